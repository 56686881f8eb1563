//! Volume Orchestrator - Pluggable Storage Runtime
//!
//! Exposes one volume lifecycle (create, inspect, attach, detach, remove)
//! over heterogeneous storage backends, each implemented as a driver behind
//! a shared contract.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                               Service Set                                   │
//! │  ┌───────────────────────┐  ┌───────────────────────┐  ┌─────────────────┐  │
//! │  │  Service "nas"        │  │  Service "objects"    │  │       ...       │  │
//! │  │  FIFO task queue      │  │  FIFO task queue      │  │                 │  │
//! │  │  single consumer      │  │  single consumer      │  │                 │  │
//! │  └──────────┬────────────┘  └──────────┬────────────┘  └─────────────────┘  │
//! │             │                          │                                    │
//! │             └─────────────┬────────────┘                                    │
//! │               ┌───────────┴───────────┐                                     │
//! │               │    Driver Registry    │                                     │
//! │               │ storage / os / exec   │                                     │
//! │               └───────────────────────┘                                     │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │                             Storage Drivers                                 │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐  ┌──────────────────┐ │
//! │  │  GlusterFS   │  │ ObjectiveFS  │  │    S3FS      │  │       EFS        │ │
//! │  │    (NAS)     │  │  (Object)    │  │  (Object)    │  │      (NAS)       │ │
//! │  └──────────────┘  └──────────────┘  └──────────────┘  └──────────────────┘ │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │                          Host Mount Engine (linux)                          │
//! │   classify device -> probe signature -> mount / format -> data directory    │
//! │   mount table parsing -> local device map -> attachment status              │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`registry`]: driver constructors for the three driver families
//! - [`service`]: storage services and their task queues
//! - [`drivers`]: storage driver variants and executors
//! - [`os`]: mount table, filesystem probing and the Linux mount engine
//! - [`domain`]: shared types and driver contracts
//! - [`config`]: layered configuration
//! - [`error`]: error types and handling

pub mod config;
pub mod domain;
pub mod drivers;
pub mod error;
pub mod os;
pub mod registry;
pub mod service;

use std::sync::Arc;

// Re-export commonly used types
pub use crate::config::{Config, ConfigRegistration};

pub use domain::ports::{
    OsDriver, OsDriverRef, StorageDriver, StorageDriverRef, StorageExecutor, StorageExecutorRef,
};

pub use domain::types::{
    AttachmentStatus, Instance, InstanceId, LocalDevices, MountInfo, Snapshot, StorageType,
    Volume, VolumeAttachment,
};

pub use error::{Error, Result};

pub use registry::{DriverFamily, DriverRegistry, RegistryBuilder};

pub use service::{ServiceSet, StorageService, TaskHandle, TaskInfo, TaskStatus};

/// Registry holding every built-in driver
pub fn default_registry() -> Arc<DriverRegistry> {
    let mut builder = RegistryBuilder::new();
    drivers::register_all(&mut builder);
    builder.build()
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
