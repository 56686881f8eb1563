//! Domain Ports - Driver contracts for the storage runtime
//!
//! These traits define the boundaries between the driver-hosting core and
//! concrete backends. Three independent families exist: storage drivers
//! (remote volume lifecycle), OS drivers (host mount engine) and storage
//! executors (host-local view of one backend).

use crate::config::Config;
use crate::domain::types::*;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;

// =============================================================================
// Storage Driver Port
// =============================================================================

/// Contract every storage backend implements
///
/// Capabilities are grouped as instance identity, volume lifecycle and
/// snapshot lifecycle. Snapshot operations default to `NotImplemented`
/// so a backend lacking them still satisfies the contract and callers can
/// tell "unsupported" apart from "none exist".
#[async_trait]
pub trait StorageDriver: Send + Sync {
    /// Registered name of the driver
    fn name(&self) -> &str;

    /// Validate configuration; must fail on the first missing field
    async fn init(&mut self, config: &Config) -> Result<()>;

    /// Static capability declaration
    fn storage_type(&self) -> StorageType;

    // -------------------------------------------------------------------------
    // Instance identity
    // -------------------------------------------------------------------------

    /// Identify the local host in backend terms
    async fn instance_inspect(&self) -> Result<Instance>;

    // -------------------------------------------------------------------------
    // Volume lifecycle
    // -------------------------------------------------------------------------

    async fn volumes(&self, opts: &VolumesOpts) -> Result<Vec<Volume>>;

    async fn volume_inspect(&self, volume_id: &str, opts: &VolumeInspectOpts) -> Result<Volume>;

    async fn volume_create(&self, name: &str, opts: &VolumeCreateOpts) -> Result<Volume>;

    async fn volume_remove(&self, volume_id: &str) -> Result<()>;

    /// Returns the volume and a device token (empty when not applicable)
    async fn volume_attach(
        &self,
        volume_id: &str,
        opts: &VolumeAttachOpts,
    ) -> Result<(Volume, String)>;

    async fn volume_detach(&self, volume_id: &str, opts: &VolumeDetachOpts) -> Result<Volume>;

    // -------------------------------------------------------------------------
    // Snapshot lifecycle
    // -------------------------------------------------------------------------

    async fn volume_create_from_snapshot(
        &self,
        _snapshot_id: &str,
        _volume_name: &str,
        _opts: &VolumeCreateOpts,
    ) -> Result<Volume> {
        Err(Error::not_implemented(self.name(), "volume_create_from_snapshot"))
    }

    async fn volume_copy(&self, _volume_id: &str, _volume_name: &str) -> Result<Volume> {
        Err(Error::not_implemented(self.name(), "volume_copy"))
    }

    async fn volume_snapshot(&self, _volume_id: &str, _snapshot_name: &str) -> Result<Snapshot> {
        Err(Error::not_implemented(self.name(), "volume_snapshot"))
    }

    async fn snapshots(&self) -> Result<Vec<Snapshot>> {
        Err(Error::not_implemented(self.name(), "snapshots"))
    }

    async fn snapshot_inspect(&self, _snapshot_id: &str) -> Result<Snapshot> {
        Err(Error::not_implemented(self.name(), "snapshot_inspect"))
    }

    async fn snapshot_copy(
        &self,
        _snapshot_id: &str,
        _snapshot_name: &str,
        _destination_id: &str,
    ) -> Result<Snapshot> {
        Err(Error::not_implemented(self.name(), "snapshot_copy"))
    }

    async fn snapshot_remove(&self, _snapshot_id: &str) -> Result<()> {
        Err(Error::not_implemented(self.name(), "snapshot_remove"))
    }
}

// =============================================================================
// OS Driver Port
// =============================================================================

/// Host-local mount engine
///
/// Every operation may block on subprocesses, device reads or mount
/// syscalls; callers run it from a context prepared to wait.
#[async_trait]
pub trait OsDriver: Send + Sync {
    fn name(&self) -> &str;

    async fn init(&mut self, config: &Config) -> Result<()>;

    /// Live mount table, filtered by device or mount point (not both)
    async fn mounts(&self, device: &str, mount_point: &str) -> Result<Vec<MountInfo>>;

    async fn mount(&self, device: &str, mount_point: &str, opts: &DeviceMountOpts) -> Result<()>;

    async fn unmount(&self, mount_point: &str) -> Result<()>;

    async fn is_mounted(&self, mount_point: &str) -> Result<bool>;

    async fn format(&self, device: &str, opts: &DeviceFormatOpts) -> Result<()>;

    /// Whether the engine can operate on this host at all
    fn supported(&self) -> bool;
}

// =============================================================================
// Storage Executor Port
// =============================================================================

/// Host-local companion of a storage driver
#[async_trait]
pub trait StorageExecutor: Send + Sync {
    fn name(&self) -> &str;

    async fn init(&mut self, config: &Config) -> Result<()>;

    /// Identity of this host as the backend sees it
    async fn instance_id(&self) -> Result<InstanceId>;

    /// Next free local device name, for backends that hand out block devices
    async fn next_device(&self) -> Result<String> {
        Err(Error::not_implemented(self.name(), "next_device"))
    }

    /// Current device -> mount point map, rebuilt on every call
    async fn local_devices(&self) -> Result<LocalDevices>;

    /// Whether the backend's required executable is on the search path
    fn supported(&self) -> bool;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type StorageDriverRef = Arc<dyn StorageDriver>;
pub type OsDriverRef = Arc<dyn OsDriver>;
pub type StorageExecutorRef = Arc<dyn StorageExecutor>;
