//! GlusterFS Storage Driver
//!
//! NAS variant backed by an in-memory volume set. Volumes are always
//! exported; each one is reachable through a connection string built from
//! `glusterfs.connectionStringFormatter` with the volume id substituted for
//! its single `%s`.

use crate::config::{Config, ConfigRegistration};
use crate::domain::ports::{StorageDriver, StorageExecutor};
use crate::domain::types::*;
use crate::error::{Error, Result};
use crate::os::command::executable_exists;
use crate::os::mountinfo::{attachment_status, local_devices_from, MOUNTINFO_PATH};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

pub const DRIVER_NAME: &str = "glusterfs";

const DEFAULT_FORMATTER: &str = "%s.gluster";
const MOUNT_HELPER: &str = "mount.glusterfs";

/// Host token reported by both the driver and its executor
const INSTANCE_TOKEN: &str = "an-unused-id";

pub fn config_registration() -> ConfigRegistration {
    ConfigRegistration::new("GlusterFS").key(
        "glusterfs.connectionStringFormatter",
        DEFAULT_FORMATTER,
        "Connection string template; %s is replaced by the volume id",
    )
}

// =============================================================================
// Connection Strings
// =============================================================================

/// Connection string template holding exactly one `%s`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionFormatter(String);

impl ConnectionFormatter {
    pub fn parse(template: &str) -> Result<Self> {
        match template.matches("%s").count() {
            0 => Err(Error::Configuration(format!(
                "glusterfs.connectionStringFormatter must contain at least one %s: {:?}",
                template
            ))),
            1 => Ok(Self(template.to_string())),
            _ => Err(Error::Configuration(format!(
                "glusterfs.connectionStringFormatter must contain only one %s: {:?}",
                template
            ))),
        }
    }

    /// Device string for a volume
    pub fn device(&self, volume_id: &str) -> String {
        self.0.replacen("%s", volume_id, 1)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionFormatter {
    fn default() -> Self {
        Self(DEFAULT_FORMATTER.to_string())
    }
}

// =============================================================================
// Volume Set
// =============================================================================

/// Named volumes guarded by a read/write lock
///
/// Mutation only happens through the driver (and so through the owning
/// service's queue); readers may hold a shared handle.
#[derive(Debug, Default)]
pub struct VolumeSet {
    volumes: RwLock<BTreeMap<String, Volume>>,
}

impl VolumeSet {
    pub fn get(&self, id: &str) -> Option<Volume> {
        self.volumes.read().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.volumes.read().contains_key(id)
    }

    /// Volumes in name order
    pub fn list(&self) -> Vec<Volume> {
        self.volumes.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.volumes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.volumes.read().is_empty()
    }

    /// Insert unless present; returns the stored volume
    fn insert(&self, name: &str) -> Volume {
        self.volumes
            .write()
            .entry(name.to_string())
            .or_insert_with(|| Volume::new(name, name, StorageType::Nas))
            .clone()
    }

    fn remove(&self, id: &str) -> bool {
        self.volumes.write().remove(id).is_some()
    }
}

// =============================================================================
// Storage Driver
// =============================================================================

#[derive(Debug)]
pub struct GlusterfsDriver {
    formatter: ConnectionFormatter,
    volumes: Arc<VolumeSet>,
}

impl Default for GlusterfsDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl GlusterfsDriver {
    pub fn new() -> Self {
        Self {
            formatter: ConnectionFormatter::default(),
            volumes: Arc::new(VolumeSet::default()),
        }
    }

    /// Shared read handle on the volume set
    pub fn volume_set(&self) -> Arc<VolumeSet> {
        self.volumes.clone()
    }

    fn instance_id(&self) -> InstanceId {
        InstanceId::new(INSTANCE_TOKEN, DRIVER_NAME)
    }

    /// Single always-exported attachment, status from the host mount map
    fn attachments(
        &self,
        volume_id: &str,
        local_devices: Option<&LocalDevices>,
    ) -> Result<Vec<VolumeAttachment>> {
        if volume_id.is_empty() {
            return Err(Error::missing_volume_id());
        }
        let device = self.formatter.device(volume_id);
        let status = attachment_status(&device, local_devices);
        Ok(vec![VolumeAttachment {
            volume_id: volume_id.to_string(),
            instance_id: self.instance_id(),
            device_name: device,
            status,
        }])
    }

    fn with_attachments(&self, mut volume: Volume, opts: &VolumeInspectOpts) -> Result<Volume> {
        if opts.attachments {
            volume.attachments = Some(self.attachments(&volume.id, opts.local_devices.as_ref())?);
        }
        Ok(volume)
    }
}

#[async_trait]
impl StorageDriver for GlusterfsDriver {
    fn name(&self) -> &str {
        DRIVER_NAME
    }

    async fn init(&mut self, config: &Config) -> Result<()> {
        config.register(&config_registration());
        self.formatter =
            ConnectionFormatter::parse(&config.get_string("glusterfs.connectionStringFormatter"))?;
        info!(
            driver = DRIVER_NAME,
            formatter = %self.formatter.as_str(),
            "Storage driver initialized"
        );
        Ok(())
    }

    fn storage_type(&self) -> StorageType {
        StorageType::Nas
    }

    async fn instance_inspect(&self) -> Result<Instance> {
        Ok(self.instance_id().into())
    }

    async fn volumes(&self, opts: &VolumesOpts) -> Result<Vec<Volume>> {
        let inspect = VolumeInspectOpts::from(opts);
        self.volumes
            .list()
            .into_iter()
            .map(|v| self.with_attachments(v, &inspect))
            .collect()
    }

    async fn volume_inspect(&self, volume_id: &str, opts: &VolumeInspectOpts) -> Result<Volume> {
        if volume_id.is_empty() {
            return Err(Error::missing_volume_id());
        }
        let volume = self
            .volumes
            .get(volume_id)
            .ok_or_else(|| Error::not_found("Volume", volume_id))?;
        self.with_attachments(volume, opts)
    }

    async fn volume_create(&self, name: &str, _opts: &VolumeCreateOpts) -> Result<Volume> {
        if name.is_empty() {
            return Err(Error::missing_volume_name());
        }
        let created = self.volumes.insert(name);
        debug!(driver = DRIVER_NAME, volume = %created.id, "Volume created");
        self.volume_inspect(&created.id, &VolumeInspectOpts::default())
            .await
    }

    async fn volume_remove(&self, volume_id: &str) -> Result<()> {
        if volume_id.is_empty() {
            return Err(Error::missing_volume_id());
        }
        if !self.volumes.remove(volume_id) {
            return Err(Error::not_found("Volume", volume_id));
        }
        debug!(driver = DRIVER_NAME, volume = volume_id, "Volume removed");
        Ok(())
    }

    /// Volumes are always exported, so attaching is a read-back
    async fn volume_attach(
        &self,
        volume_id: &str,
        opts: &VolumeAttachOpts,
    ) -> Result<(Volume, String)> {
        let volume = self
            .volume_inspect(
                volume_id,
                &VolumeInspectOpts::with_attachments(opts.local_devices.clone()),
            )
            .await?;
        Ok((volume, String::new()))
    }

    /// Exports stay up for other clients; detaching only reads back
    async fn volume_detach(&self, volume_id: &str, opts: &VolumeDetachOpts) -> Result<Volume> {
        self.volume_inspect(
            volume_id,
            &VolumeInspectOpts::with_attachments(opts.local_devices.clone()),
        )
        .await
    }
}

// =============================================================================
// Storage Executor
// =============================================================================

pub struct GlusterfsExecutor {
    mount_table: PathBuf,
}

impl Default for GlusterfsExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl GlusterfsExecutor {
    pub fn new() -> Self {
        Self::with_mount_table(MOUNTINFO_PATH)
    }

    pub fn with_mount_table(path: impl Into<PathBuf>) -> Self {
        Self {
            mount_table: path.into(),
        }
    }
}

#[async_trait]
impl StorageExecutor for GlusterfsExecutor {
    fn name(&self) -> &str {
        DRIVER_NAME
    }

    async fn init(&mut self, config: &Config) -> Result<()> {
        config.register(&config_registration());
        Ok(())
    }

    async fn instance_id(&self) -> Result<InstanceId> {
        Ok(InstanceId::new(INSTANCE_TOKEN, DRIVER_NAME))
    }

    async fn local_devices(&self) -> Result<LocalDevices> {
        local_devices_from(DRIVER_NAME, &self.mount_table).await
    }

    fn supported(&self) -> bool {
        executable_exists(MOUNT_HELPER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::io::Write;

    async fn driver_with(formatter: Option<&str>) -> Result<GlusterfsDriver> {
        let config = Config::isolated();
        if let Some(f) = formatter {
            config.set("glusterfs.connectionStringFormatter", f);
        }
        let mut driver = GlusterfsDriver::new();
        driver.init(&config).await?;
        Ok(driver)
    }

    #[test]
    fn test_formatter_requires_single_placeholder() {
        assert_matches!(
            ConnectionFormatter::parse("gluster-host"),
            Err(Error::Configuration(ref m)) if m.contains("at least one")
        );
        assert_matches!(
            ConnectionFormatter::parse("%s.%s"),
            Err(Error::Configuration(ref m)) if m.contains("only one")
        );
        let f = ConnectionFormatter::parse("gluster1:/%s").unwrap();
        assert_eq!(f.device("vol1"), "gluster1:/vol1");
    }

    #[tokio::test]
    async fn test_init_uses_default_formatter() {
        let driver = driver_with(None).await.unwrap();
        assert_eq!(driver.formatter.device("data"), "data.gluster");
        assert_eq!(driver.storage_type(), StorageType::Nas);
        assert_matches!(
            driver_with(Some("no-placeholder")).await,
            Err(Error::Configuration(_))
        );
    }

    #[tokio::test]
    async fn test_create_then_inspect() {
        let driver = driver_with(None).await.unwrap();
        let created = driver
            .volume_create("data", &VolumeCreateOpts::default())
            .await
            .unwrap();
        assert_eq!(created.name, "data");
        assert!(created.attachments.is_none());

        let inspected = driver
            .volume_inspect(&created.id, &VolumeInspectOpts::default())
            .await
            .unwrap();
        assert_eq!(inspected.name, created.name);
        assert_eq!(inspected.id, created.id);
        assert_eq!(driver.volume_set().len(), 1);
    }

    #[tokio::test]
    async fn test_validation_and_not_found() {
        let driver = driver_with(None).await.unwrap();
        assert_matches!(
            driver.volume_create("", &VolumeCreateOpts::default()).await,
            Err(Error::MissingField { ref field }) if field == "volume name"
        );
        assert_matches!(
            driver.volume_inspect("", &VolumeInspectOpts::default()).await,
            Err(Error::MissingField { ref field }) if field == "volume ID"
        );
        assert_matches!(
            driver.volume_inspect("ghost", &VolumeInspectOpts::default()).await,
            Err(Error::NotFound { .. })
        );
        assert_matches!(driver.volume_remove("ghost").await, Err(Error::NotFound { .. }));
        assert_matches!(driver.snapshots().await, Err(Error::NotImplemented { .. }));
    }

    #[tokio::test]
    async fn test_remove_then_list() {
        let driver = driver_with(None).await.unwrap();
        for name in ["b", "a"] {
            driver
                .volume_create(name, &VolumeCreateOpts::default())
                .await
                .unwrap();
        }
        driver.volume_remove("b").await.unwrap();
        let names: Vec<String> = driver
            .volumes(&VolumesOpts::default())
            .await
            .unwrap()
            .into_iter()
            .map(|v| v.name)
            .collect();
        assert_eq!(names, vec!["a"]);
    }

    #[tokio::test]
    async fn test_attachment_status_follows_local_devices() {
        let driver = driver_with(Some("gluster1:/%s")).await.unwrap();
        driver
            .volume_create("data", &VolumeCreateOpts::default())
            .await
            .unwrap();

        let mut mounted = LocalDevices::default();
        mounted
            .device_map
            .insert("gluster1:/data".into(), "/mnt/data".into());

        let cases = [
            (None, AttachmentStatus::Exported),
            (Some(mounted), AttachmentStatus::ExportedMounted),
            (Some(LocalDevices::default()), AttachmentStatus::ExportedUnmounted),
        ];
        for (local_devices, expected) in cases {
            let opts = VolumesOpts {
                attachments: true,
                local_devices,
            };
            let volumes = driver.volumes(&opts).await.unwrap();
            let atts = volumes[0].attachments.as_ref().unwrap();
            assert_eq!(atts.len(), 1);
            assert_eq!(atts[0].device_name, "gluster1:/data");
            assert_eq!(atts[0].instance_id.id, INSTANCE_TOKEN);
            assert_eq!(atts[0].status, expected);
        }
    }

    #[tokio::test]
    async fn test_attach_returns_empty_token() {
        let driver = driver_with(None).await.unwrap();
        driver
            .volume_create("data", &VolumeCreateOpts::default())
            .await
            .unwrap();
        let (volume, token) = driver
            .volume_attach("data", &VolumeAttachOpts::default())
            .await
            .unwrap();
        assert!(token.is_empty());
        assert_eq!(volume.attachments.as_ref().map(Vec::len), Some(1));

        let detached = driver
            .volume_detach("data", &VolumeDetachOpts::default())
            .await
            .unwrap();
        assert_eq!(detached.id, "data");
        assert!(driver.volume_set().contains("data"));
    }

    #[tokio::test]
    async fn test_executor_reads_mount_table() {
        let mut table = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            table,
            "40 25 0:50 / /mnt/data rw,relatime shared:30 - fuse.glusterfs data.gluster rw,user_id=0"
        )
        .unwrap();
        let executor = GlusterfsExecutor::with_mount_table(table.path());
        let ld = executor.local_devices().await.unwrap();
        assert_eq!(ld.driver, DRIVER_NAME);
        assert_eq!(ld.mount_point("data.gluster"), Some("/mnt/data"));
        assert_eq!(executor.instance_id().await.unwrap().id, INSTANCE_TOKEN);
        assert_matches!(executor.next_device().await, Err(Error::NotImplemented { .. }));
    }
}
