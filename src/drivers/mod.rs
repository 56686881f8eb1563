//! Storage Drivers
//!
//! Backend variants of the storage driver contract and their host-local
//! executors:
//!
//! - `glusterfs`: NAS, in-memory volume set
//! - `objectivefs`: object filesystems managed with `mount.objectivefs`
//! - `s3fs`: one bucket per volume
//! - `efs`: NAS over Elastic File System mount targets

pub mod aws;
pub mod efs;
pub mod glusterfs;
pub mod objectivefs;
pub mod s3fs;

pub use efs::{EfsDriver, EfsExecutor};
pub use glusterfs::{GlusterfsDriver, GlusterfsExecutor};
pub use objectivefs::ObjectiveFsDriver;
pub use s3fs::S3fsDriver;

use crate::config::ConfigRegistration;
use crate::registry::RegistryBuilder;

/// Register every storage driver, executor and OS driver
pub fn register_all(builder: &mut RegistryBuilder) {
    builder
        .register_storage_driver(glusterfs::DRIVER_NAME, || Box::new(GlusterfsDriver::new()))
        .register_storage_driver(objectivefs::DRIVER_NAME, || {
            Box::new(ObjectiveFsDriver::new())
        })
        .register_storage_driver(s3fs::DRIVER_NAME, || Box::new(S3fsDriver::new()))
        .register_storage_driver(efs::DRIVER_NAME, || Box::new(EfsDriver::new()))
        .register_storage_executor(glusterfs::DRIVER_NAME, || {
            Box::new(GlusterfsExecutor::new())
        })
        .register_storage_executor(efs::DRIVER_NAME, || Box::new(EfsExecutor::new()));
    crate::os::register(builder);
}

/// Default configuration keys of every component
pub fn config_registrations() -> Vec<ConfigRegistration> {
    vec![
        crate::os::linux::config_registration(),
        glusterfs::config_registration(),
        objectivefs::config_registration(),
        s3fs::config_registration(),
        efs::config_registration(),
    ]
}
