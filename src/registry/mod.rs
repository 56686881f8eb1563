//! Driver Registry
//!
//! Maps driver names to constructors for the three driver families.
//! Constructors are collected into a [`RegistryBuilder`] during startup and
//! frozen into an immutable [`DriverRegistry`] before the first service is
//! built. Re-registering a name overwrites the earlier constructor, which is
//! how tests substitute doubles for real drivers.

use crate::domain::ports::{OsDriver, StorageDriver, StorageExecutor};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

// =============================================================================
// Families & Constructors
// =============================================================================

/// Independent capability families a driver can register under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverFamily {
    Storage,
    Os,
    Executor,
}

impl std::fmt::Display for DriverFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriverFamily::Storage => write!(f, "storage"),
            DriverFamily::Os => write!(f, "os"),
            DriverFamily::Executor => write!(f, "executor"),
        }
    }
}

pub type StorageDriverCtor = Arc<dyn Fn() -> Box<dyn StorageDriver> + Send + Sync>;
pub type OsDriverCtor = Arc<dyn Fn() -> Box<dyn OsDriver> + Send + Sync>;
pub type StorageExecutorCtor = Arc<dyn Fn() -> Box<dyn StorageExecutor> + Send + Sync>;

// =============================================================================
// Builder
// =============================================================================

/// Mutable collection phase of the registry
#[derive(Default)]
pub struct RegistryBuilder {
    storage: HashMap<String, StorageDriverCtor>,
    os: HashMap<String, OsDriverCtor>,
    executors: HashMap<String, StorageExecutorCtor>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_storage_driver<F>(&mut self, name: &str, ctor: F) -> &mut Self
    where
        F: Fn() -> Box<dyn StorageDriver> + Send + Sync + 'static,
    {
        if self.storage.insert(name.to_string(), Arc::new(ctor)).is_some() {
            debug!(family = "storage", name, "Replaced driver constructor");
        }
        self
    }

    pub fn register_os_driver<F>(&mut self, name: &str, ctor: F) -> &mut Self
    where
        F: Fn() -> Box<dyn OsDriver> + Send + Sync + 'static,
    {
        if self.os.insert(name.to_string(), Arc::new(ctor)).is_some() {
            debug!(family = "os", name, "Replaced driver constructor");
        }
        self
    }

    pub fn register_storage_executor<F>(&mut self, name: &str, ctor: F) -> &mut Self
    where
        F: Fn() -> Box<dyn StorageExecutor> + Send + Sync + 'static,
    {
        if self.executors.insert(name.to_string(), Arc::new(ctor)).is_some() {
            debug!(family = "executor", name, "Replaced driver constructor");
        }
        self
    }

    /// Freeze the collected constructors
    pub fn build(self) -> Arc<DriverRegistry> {
        debug!(
            storage = self.storage.len(),
            os = self.os.len(),
            executors = self.executors.len(),
            "Driver registry frozen"
        );
        Arc::new(DriverRegistry {
            storage: self.storage,
            os: self.os,
            executors: self.executors,
        })
    }
}

// =============================================================================
// Frozen Registry
// =============================================================================

/// Immutable name -> constructor lookup shared by every service
pub struct DriverRegistry {
    storage: HashMap<String, StorageDriverCtor>,
    os: HashMap<String, OsDriverCtor>,
    executors: HashMap<String, StorageExecutorCtor>,
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("storage", &self.names(DriverFamily::Storage))
            .field("os", &self.names(DriverFamily::Os))
            .field("executors", &self.names(DriverFamily::Executor))
            .finish()
    }
}

impl DriverRegistry {
    /// Construct a fresh storage driver
    pub fn new_storage_driver(&self, name: &str) -> Result<Box<dyn StorageDriver>> {
        let ctor = self
            .storage
            .get(name)
            .ok_or_else(|| not_found(DriverFamily::Storage, name))?;
        Ok(ctor())
    }

    /// Construct a fresh OS driver
    pub fn new_os_driver(&self, name: &str) -> Result<Box<dyn OsDriver>> {
        let ctor = self
            .os
            .get(name)
            .ok_or_else(|| not_found(DriverFamily::Os, name))?;
        Ok(ctor())
    }

    /// Construct a fresh storage executor
    pub fn new_storage_executor(&self, name: &str) -> Result<Box<dyn StorageExecutor>> {
        let ctor = self
            .executors
            .get(name)
            .ok_or_else(|| not_found(DriverFamily::Executor, name))?;
        Ok(ctor())
    }

    pub fn contains(&self, family: DriverFamily, name: &str) -> bool {
        match family {
            DriverFamily::Storage => self.storage.contains_key(name),
            DriverFamily::Os => self.os.contains_key(name),
            DriverFamily::Executor => self.executors.contains_key(name),
        }
    }

    /// Sorted names registered under a family
    pub fn names(&self, family: DriverFamily) -> Vec<String> {
        let mut names: Vec<String> = match family {
            DriverFamily::Storage => self.storage.keys().cloned().collect(),
            DriverFamily::Os => self.os.keys().cloned().collect(),
            DriverFamily::Executor => self.executors.keys().cloned().collect(),
        };
        names.sort();
        names
    }
}

fn not_found(family: DriverFamily, name: &str) -> Error {
    Error::DriverNotFound {
        family: family.to_string(),
        name: name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::domain::types::*;
    use assert_matches::assert_matches;
    use async_trait::async_trait;

    struct Named(&'static str);

    #[async_trait]
    impl StorageDriver for Named {
        fn name(&self) -> &str {
            self.0
        }
        async fn init(&mut self, _config: &Config) -> Result<()> {
            Ok(())
        }
        fn storage_type(&self) -> StorageType {
            StorageType::Unknown
        }
        async fn instance_inspect(&self) -> Result<Instance> {
            Ok(InstanceId::new("host", self.0).into())
        }
        async fn volumes(&self, _opts: &VolumesOpts) -> Result<Vec<Volume>> {
            Ok(Vec::new())
        }
        async fn volume_inspect(&self, id: &str, _opts: &VolumeInspectOpts) -> Result<Volume> {
            Err(Error::not_found("Volume", id))
        }
        async fn volume_create(&self, name: &str, _opts: &VolumeCreateOpts) -> Result<Volume> {
            Ok(Volume::new(name, name, StorageType::Unknown))
        }
        async fn volume_remove(&self, _id: &str) -> Result<()> {
            Ok(())
        }
        async fn volume_attach(&self, id: &str, _o: &VolumeAttachOpts) -> Result<(Volume, String)> {
            Ok((Volume::new(id, id, StorageType::Unknown), String::new()))
        }
        async fn volume_detach(&self, id: &str, _o: &VolumeDetachOpts) -> Result<Volume> {
            Ok(Volume::new(id, id, StorageType::Unknown))
        }
    }

    #[test]
    fn test_lookup_returns_named_driver() {
        let mut builder = RegistryBuilder::new();
        builder
            .register_storage_driver("alpha", || Box::new(Named("alpha")))
            .register_storage_driver("beta", || Box::new(Named("beta")));
        let registry = builder.build();

        for name in registry.names(DriverFamily::Storage) {
            let driver = registry.new_storage_driver(&name).unwrap();
            assert_eq!(driver.name(), name);
        }
        assert!(registry.contains(DriverFamily::Storage, "alpha"));
        assert!(!registry.contains(DriverFamily::Os, "alpha"));
    }

    #[test]
    fn test_reregistration_overwrites() {
        let mut builder = RegistryBuilder::new();
        builder.register_storage_driver("dup", || Box::new(Named("first")));
        builder.register_storage_driver("dup", || Box::new(Named("second")));
        let registry = builder.build();

        assert_eq!(registry.names(DriverFamily::Storage), vec!["dup".to_string()]);
        assert_eq!(registry.new_storage_driver("dup").unwrap().name(), "second");
    }

    #[test]
    fn test_missing_driver_names_family_and_name() {
        let registry = RegistryBuilder::new().build();
        let err = registry.new_storage_executor("nope").err().unwrap();
        assert_matches!(
            err,
            Error::DriverNotFound { ref family, ref name } if family == "executor" && name == "nope"
        );
        assert_eq!(err.to_string(), "Driver not found: executor/nope");
    }
}
