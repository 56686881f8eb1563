//! Task queue metrics, registered once in the default prometheus registry

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts};
use std::sync::OnceLock;
use tracing::warn;

pub struct TaskMetrics {
    /// Finished tasks by service and terminal status
    pub tasks_total: IntCounterVec,
    /// Run time of task bodies by service
    pub task_duration: HistogramVec,
}

impl TaskMetrics {
    fn register() -> prometheus::Result<Self> {
        let tasks_total = IntCounterVec::new(
            Opts::new(
                "volume_orchestrator_tasks_total",
                "Total number of finished storage service tasks",
            ),
            &["service", "status"],
        )?;
        let task_duration = HistogramVec::new(
            HistogramOpts::new(
                "volume_orchestrator_task_duration_seconds",
                "Duration of storage service task bodies",
            ),
            &["service"],
        )?;

        prometheus::register(Box::new(tasks_total.clone()))?;
        prometheus::register(Box::new(task_duration.clone()))?;

        Ok(Self {
            tasks_total,
            task_duration,
        })
    }
}

static METRICS: OnceLock<Option<TaskMetrics>> = OnceLock::new();

/// Process-wide task metrics; `None` when registration failed
pub fn task_metrics() -> Option<&'static TaskMetrics> {
    METRICS
        .get_or_init(|| match TaskMetrics::register() {
            Ok(metrics) => Some(metrics),
            Err(e) => {
                warn!(error = %e, "Task metrics not registered");
                None
            }
        })
        .as_ref()
}

/// Register the task metrics ahead of the first scrape
///
/// Returns whether they are present in the default registry.
pub fn register() -> bool {
    task_metrics().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_is_idempotent() {
        assert!(register());
        assert!(register());
        // A second registration of the same collectors is refused
        assert!(matches!(
            TaskMetrics::register(),
            Err(prometheus::Error::AlreadyReg)
        ));
    }
}
