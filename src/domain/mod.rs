//! Domain layer - Core types and port definitions
//!
//! This module defines the data model and the driver contracts (ports)
//! that backend adapters implement, following hexagonal architecture
//! principles.

pub mod ports;
pub mod types;

pub use ports::*;
pub use types::*;
