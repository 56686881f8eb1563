//! Storage Service
//!
//! Binds one configuration scope to one storage driver instance and owns
//! the only execution path for tasks against it: a single consumer
//! draining an unbounded FIFO queue, one task at a time.

use crate::config::Config;
use crate::domain::ports::{StorageDriver, StorageDriverRef};
use crate::error::{Error, Result};
use crate::registry::DriverRegistry;
use crate::service::task::{Task, TaskHandle, TaskInfo, TaskRunFn};
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Keys consulted, in order, for the driver name of a service
pub const DRIVER_NAME_KEYS: [&str; 3] = ["driver", "libstorage.driver", "libstorage.storage.driver"];

/// Tracked tasks past which the consumer forgets finished ones
pub const TASK_HISTORY_LIMIT: usize = 1024;

type TaskTable = Arc<DashMap<String, TaskHandle>>;

// =============================================================================
// Storage Service
// =============================================================================

pub struct StorageService {
    name: String,
    config: Config,
    driver: StorageDriverRef,
    queue: Mutex<Option<mpsc::UnboundedSender<Task>>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
    tasks: TaskTable,
}

impl std::fmt::Debug for StorageService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageService")
            .field("name", &self.name)
            .field("driver", &self.driver.name())
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

impl StorageService {
    /// Resolve, construct and initialize the driver, then start the consumer
    ///
    /// A driver init failure aborts construction; no service is returned.
    pub async fn init(
        name: &str,
        config: Config,
        registry: &DriverRegistry,
    ) -> Result<Arc<StorageService>> {
        let driver_name = resolve_driver_name(&config).ok_or_else(|| Error::MissingDriverName {
            service: name.to_string(),
        })?;
        debug!(service = name, driver = %driver_name, "Resolved driver name");

        let mut driver = registry.new_storage_driver(&driver_name)?;
        driver.init(&config).await?;
        let driver: StorageDriverRef = Arc::from(driver);

        Ok(Self::start(name, config, driver))
    }

    /// Wrap an already initialized driver and start the consumer
    pub fn start(name: &str, config: Config, driver: StorageDriverRef) -> Arc<StorageService> {
        let (tx, rx) = mpsc::unbounded_channel();
        let tasks: TaskTable = Arc::new(DashMap::new());
        let consumer = tokio::spawn(consume(name.to_string(), driver.clone(), tasks.clone(), rx));

        info!(service = name, driver = %driver.name(), "Storage service started");
        Arc::new(StorageService {
            name: name.to_string(),
            config,
            driver,
            queue: Mutex::new(Some(tx)),
            consumer: Mutex::new(Some(consumer)),
            tasks,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The driver, for calls the caller has already serialized
    pub fn driver(&self) -> StorageDriverRef {
        self.driver.clone()
    }

    /// Queue `run` against the driver; returns before execution begins
    ///
    /// The queue is unbounded, so enqueueing never waits on the consumer.
    pub fn task_execute<F, Fut>(&self, run: F, schema: Option<Value>) -> TaskHandle
    where
        F: FnOnce(StorageDriverRef) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let run: TaskRunFn = Box::new(move |driver| run(driver).boxed());
        self.enqueue(run, schema)
    }

    fn enqueue(&self, run: TaskRunFn, schema: Option<Value>) -> TaskHandle {
        let (task, handle) = Task::new(&self.name, run, schema);
        let id = handle.id();
        self.tasks.insert(id.clone(), handle.clone());

        // A closed queue drops the task, which its handle reports as aborted
        if let Some(queue) = self.queue.lock().as_ref() {
            if queue.send(task).is_ok() {
                debug!(service = %self.name, task_id = %id, "Task queued");
            }
        }
        handle
    }

    /// Look up a tracked task
    pub fn task(&self, id: &str) -> Option<TaskHandle> {
        self.tasks.get(id).map(|h| h.value().clone())
    }

    /// Snapshots of every tracked task, oldest first
    pub fn tasks(&self) -> Vec<TaskInfo> {
        let mut infos: Vec<TaskInfo> = self.tasks.iter().map(|h| h.value().snapshot()).collect();
        infos.sort_by_key(|i| i.queued_at);
        infos
    }

    /// Forget finished tasks, returning how many were dropped
    pub fn prune_finished(&self) -> usize {
        prune(&self.tasks)
    }

    /// Stop accepting tasks and wait for queued ones to drain
    pub async fn shutdown(&self) {
        self.queue.lock().take();
        let consumer = self.consumer.lock().take();
        if let Some(consumer) = consumer {
            let _ = consumer.await;
        }
        info!(service = %self.name, "Storage service stopped");
    }
}

impl Drop for StorageService {
    fn drop(&mut self) {
        if let Some(consumer) = self.consumer.get_mut().take() {
            consumer.abort();
        }
    }
}

/// First non-empty driver name among [`DRIVER_NAME_KEYS`]
pub fn resolve_driver_name(config: &Config) -> Option<String> {
    DRIVER_NAME_KEYS
        .iter()
        .map(|key| config.get_string(key))
        .find(|name| !name.is_empty())
}

fn prune(tasks: &DashMap<String, TaskHandle>) -> usize {
    let before = tasks.len();
    tasks.retain(|_, h| !h.is_done());
    before - tasks.len()
}

async fn consume(
    service: String,
    driver: StorageDriverRef,
    tasks: TaskTable,
    mut rx: mpsc::UnboundedReceiver<Task>,
) {
    debug!(service = %service, "Task consumer started");
    while let Some(task) = rx.recv().await {
        task.execute(driver.clone()).await;
        if tasks.len() > TASK_HISTORY_LIMIT {
            let dropped = prune(&tasks);
            debug!(service = %service, dropped, "Pruned finished tasks");
        }
    }
    debug!(service = %service, "Task consumer stopped");
}

// =============================================================================
// Service Set
// =============================================================================

/// Every service configured under `services.*`
#[derive(Debug, Default)]
pub struct ServiceSet {
    services: BTreeMap<String, Arc<StorageService>>,
}

impl ServiceSet {
    /// Build services in name order, stopping at the first failure
    pub async fn from_config(config: &Config, registry: &DriverRegistry) -> Result<ServiceSet> {
        let mut services = BTreeMap::new();
        for name in config.child_names("services") {
            let scoped = config.scoped(&format!("services.{}", name));
            let service = StorageService::init(&name, scoped, registry).await?;
            services.insert(name, service);
        }
        info!(count = services.len(), "Storage services initialized");
        Ok(ServiceSet { services })
    }

    pub fn insert(&mut self, service: Arc<StorageService>) {
        self.services.insert(service.name().to_string(), service);
    }

    pub fn get(&self, name: &str) -> Result<Arc<StorageService>> {
        self.services
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found("Service", name))
    }

    pub fn names(&self) -> Vec<String> {
        self.services.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<StorageService>> {
        self.services.values()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub async fn shutdown(&self) {
        for service in self.services.values() {
            service.shutdown().await;
        }
    }
}

/// Serialize a driver result into a task value
pub fn to_task_value<T: serde::Serialize>(value: T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}
