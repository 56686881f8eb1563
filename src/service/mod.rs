//! Storage Services
//!
//! A service owns one initialized storage driver and serializes every
//! queued task against it.

pub mod metrics;
pub mod storage_service;
pub mod task;

pub use storage_service::{resolve_driver_name, to_task_value, ServiceSet, StorageService};
pub use task::{TaskError, TaskErrorKind, TaskHandle, TaskInfo, TaskRunFn, TaskStatus};
