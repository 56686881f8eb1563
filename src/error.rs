//! Error types for the Volume Orchestrator
//!
//! Provides structured error types for all runtime components including
//! the driver registry, storage services, storage drivers and the host
//! mount engine.

use thiserror::Error;

/// Unified error type for the runtime
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Usage error: {0}")]
    Usage(String),

    // =========================================================================
    // Registry Errors
    // =========================================================================
    #[error("Driver not found: {family}/{name}")]
    DriverNotFound { family: String, name: String },

    #[error("No driver name configured for service: {service}")]
    MissingDriverName { service: String },

    // =========================================================================
    // Storage Driver Errors
    // =========================================================================
    #[error("{kind} not found: {id}")]
    NotFound { kind: String, id: String },

    #[error("Missing {field}")]
    MissingField { field: String },

    #[error("Not implemented: {driver} - {operation}")]
    NotImplemented { driver: String, operation: String },

    // =========================================================================
    // Task Errors
    // =========================================================================
    #[error("Task {task_id} failed: {message}")]
    TaskFailed { task_id: String, message: String },

    #[error("Task {task_id} result does not match schema: {reason}")]
    ResultSchema { task_id: String, reason: String },

    #[error("Task {task_id} was dropped before completion")]
    TaskAborted { task_id: String },

    // =========================================================================
    // Mount Engine Errors
    // =========================================================================
    #[error("Unsupported OS: {0}")]
    UnsupportedOs(String),

    #[error("Unknown file system on device: {device}")]
    UnknownFileSystem { device: String },

    #[error("Unsupported file system: {fs_type}")]
    UnsupportedFileSystem { fs_type: String },

    #[error("Mount failed: {device} -> {mount_point}: {reason}")]
    Mount {
        device: String,
        mount_point: String,
        reason: String,
    },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("Mount table parse error: {reason} in {line:?}")]
    MountTableParse { line: String, reason: String },

    #[error("Could not parse output of {command}: {reason}")]
    CommandOutputParse { command: String, reason: String },

    // =========================================================================
    // External Command Errors
    // =========================================================================
    #[error("{action} failed (exit code {status}): {args:?} stdout={stdout:?} stderr={stderr:?}")]
    CommandFailed {
        action: String,
        args: Vec<String>,
        stdout: String,
        stderr: String,
        status: i32,
    },

    #[error("Instance metadata unavailable: {0}")]
    InstanceMetadata(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // =========================================================================
    // IO / Serialization Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration source error: {0}")]
    ConfigSource(#[from] ::config::ConfigError),
}

impl Error {
    /// Entity lookup error
    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// Required identifier was empty
    pub fn missing(field: impl Into<String>) -> Self {
        Error::MissingField {
            field: field.into(),
        }
    }

    pub fn missing_volume_id() -> Self {
        Self::missing("volume ID")
    }

    pub fn missing_volume_name() -> Self {
        Self::missing("volume name")
    }

    /// Capability deliberately unsupported by a driver
    pub fn not_implemented(driver: impl Into<String>, operation: impl Into<String>) -> Self {
        Error::NotImplemented {
            driver: driver.into(),
            operation: operation.into(),
        }
    }

    /// Check if this error reports an absent entity
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Check if this error reports an unsupported capability
    pub fn is_not_implemented(&self) -> bool {
        matches!(self, Error::NotImplemented { .. })
    }

    /// Check if this error was raised before any external call was made
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::MissingField { .. }
                | Error::Configuration(_)
                | Error::ConfigSource(_)
                | Error::Usage(_)
                | Error::MissingDriverName { .. }
                | Error::UnsupportedFileSystem { .. }
        )
    }
}

/// Result type alias for the runtime
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let err = Error::missing_volume_id();
        assert!(err.is_validation());
        assert!(!err.is_not_found());
        assert_eq!(err.to_string(), "Missing volume ID");

        let err = Error::not_found("Volume", "vol-1");
        assert!(err.is_not_found());
        assert!(!err.is_validation());
        assert_eq!(err.to_string(), "Volume not found: vol-1");

        let err = Error::not_implemented("efs", "snapshots");
        assert!(err.is_not_implemented());
    }

    #[test]
    fn test_command_failed_carries_output() {
        let err = Error::CommandFailed {
            action: "objectivefsMount".into(),
            args: vec!["mount".into(), "-t".into(), "objectivefs".into()],
            stdout: String::new(),
            stderr: "bad passphrase".into(),
            status: 1,
        };
        let text = err.to_string();
        assert!(text.contains("objectivefsMount"));
        assert!(text.contains("bad passphrase"));
    }
}
