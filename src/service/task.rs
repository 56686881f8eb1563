//! Tasks
//!
//! A task is one unit of work queued against a storage service. The queued
//! half ([`Task`]) travels through the service's queue and owns the
//! completion sender; callers hold the other half ([`TaskHandle`]) and
//! observe status or await the result. Dropping a queued task without
//! running it closes the channel, which handles report as
//! [`Error::TaskAborted`].

use crate::domain::ports::StorageDriverRef;
use crate::error::{Error, Result};
use crate::service::metrics::task_metrics;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Body of a task: receives the service's driver, yields a JSON result
pub type TaskRunFn = Box<dyn FnOnce(StorageDriverRef) -> BoxFuture<'static, Result<Value>> + Send>;

// =============================================================================
// Status & Errors
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

/// Coarse classification of a captured task error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorKind {
    NotFound,
    Validation,
    NotImplemented,
    Schema,
    Panicked,
    Backend,
}

impl From<&Error> for TaskErrorKind {
    fn from(err: &Error) -> Self {
        if err.is_not_found() {
            TaskErrorKind::NotFound
        } else if err.is_not_implemented() {
            TaskErrorKind::NotImplemented
        } else if err.is_validation() {
            TaskErrorKind::Validation
        } else if matches!(err, Error::ResultSchema { .. }) {
            TaskErrorKind::Schema
        } else {
            TaskErrorKind::Backend
        }
    }
}

/// Error captured on a task; never propagated across the queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: TaskErrorKind,
    pub message: String,
}

// =============================================================================
// Task Info
// =============================================================================

/// Serializable view of a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: String,
    pub service: String,
    pub status: TaskStatus,
    pub queued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
}

// =============================================================================
// Queued Task
// =============================================================================

/// The queued half of a task
pub struct Task {
    info: Arc<Mutex<TaskInfo>>,
    run: TaskRunFn,
    schema: Option<Value>,
    done: watch::Sender<TaskStatus>,
}

impl Task {
    /// Create a task and the handle observing it
    pub fn new(service: &str, run: TaskRunFn, schema: Option<Value>) -> (Task, TaskHandle) {
        let info = Arc::new(Mutex::new(TaskInfo {
            id: uuid::Uuid::new_v4().to_string(),
            service: service.to_string(),
            status: TaskStatus::Queued,
            queued_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        }));
        let (done, status) = watch::channel(TaskStatus::Queued);
        let handle = TaskHandle {
            info: info.clone(),
            status,
        };
        (
            Task {
                info,
                run,
                schema,
                done,
            },
            handle,
        )
    }

    pub fn id(&self) -> String {
        self.info.lock().id.clone()
    }

    /// Run the body against `driver` and publish the outcome
    ///
    /// Failures and panics in the body are captured on the task.
    pub async fn execute(self, driver: StorageDriverRef) {
        let (id, service) = {
            let mut info = self.info.lock();
            info.status = TaskStatus::Running;
            info.started_at = Some(Utc::now());
            (info.id.clone(), info.service.clone())
        };
        let _ = self.done.send(TaskStatus::Running);
        debug!(service = %service, task_id = %id, "Task started");

        let started = Instant::now();
        let run = self.run;
        let outcome = AssertUnwindSafe(async move { run(driver).await })
            .catch_unwind()
            .await;
        let elapsed = started.elapsed();

        let (result, error) = match outcome {
            Ok(Ok(value)) => match check_schema(&id, self.schema.as_ref(), &value) {
                Ok(()) => (Some(value), None),
                Err(e) => (None, Some(captured(&e))),
            },
            Ok(Err(e)) => (None, Some(captured(&e))),
            Err(_) => (
                None,
                Some(TaskError {
                    kind: TaskErrorKind::Panicked,
                    message: "task body panicked".into(),
                }),
            ),
        };

        let status = if error.is_some() {
            TaskStatus::Failed
        } else {
            TaskStatus::Completed
        };
        if let Some(err) = &error {
            warn!(service = %service, task_id = %id, kind = ?err.kind, error = %err.message, "Task failed");
        } else {
            debug!(service = %service, task_id = %id, elapsed_ms = elapsed.as_millis() as u64, "Task completed");
        }

        if let Some(metrics) = task_metrics() {
            metrics
                .tasks_total
                .with_label_values(&[service.as_str(), status.as_str()])
                .inc();
            metrics
                .task_duration
                .with_label_values(&[service.as_str()])
                .observe(elapsed.as_secs_f64());
        }

        {
            let mut info = self.info.lock();
            info.status = status;
            info.completed_at = Some(Utc::now());
            info.result = result;
            info.error = error;
        }
        let _ = self.done.send(status);
    }
}

fn captured(err: &Error) -> TaskError {
    TaskError {
        kind: err.into(),
        message: err.to_string(),
    }
}

/// Check a result against the `type`/`required` parts of a JSON schema
pub fn check_schema(task_id: &str, schema: Option<&Value>, value: &Value) -> Result<()> {
    let Some(schema) = schema else {
        return Ok(());
    };
    let fail = |reason: String| Error::ResultSchema {
        task_id: task_id.to_string(),
        reason,
    };

    let required: Vec<&str> = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|keys| keys.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    let wants_object = schema.get("type").and_then(Value::as_str) == Some("object");

    if !wants_object && required.is_empty() {
        return Ok(());
    }
    let object = value
        .as_object()
        .ok_or_else(|| fail("result is not an object".into()))?;
    if let Some(missing) = required.iter().find(|k| !object.contains_key(**k)) {
        return Err(fail(format!("missing required key {:?}", missing)));
    }
    Ok(())
}

// =============================================================================
// Task Handle
// =============================================================================

/// Caller-side view of a task
#[derive(Clone)]
pub struct TaskHandle {
    info: Arc<Mutex<TaskInfo>>,
    status: watch::Receiver<TaskStatus>,
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let info = self.info.lock();
        f.debug_struct("TaskHandle")
            .field("id", &info.id)
            .field("status", &info.status)
            .finish()
    }
}

impl TaskHandle {
    pub fn id(&self) -> String {
        self.info.lock().id.clone()
    }

    pub fn status(&self) -> TaskStatus {
        self.info.lock().status
    }

    pub fn is_done(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn snapshot(&self) -> TaskInfo {
        self.info.lock().clone()
    }

    /// Wait for the task to finish and return its result
    pub async fn wait(&self) -> Result<Value> {
        let mut status = self.status.clone();
        if status.wait_for(TaskStatus::is_terminal).await.is_err() && !self.is_done() {
            return Err(Error::TaskAborted { task_id: self.id() });
        }

        let info = self.snapshot();
        match (info.result, info.error) {
            (Some(value), None) => Ok(value),
            (_, Some(err)) => Err(Error::TaskFailed {
                task_id: info.id,
                message: err.message,
            }),
            (None, None) => Err(Error::TaskAborted { task_id: info.id }),
        }
    }
}
