//! EFS Storage Driver
//!
//! NAS variant over Elastic File System. A volume is a file system tagged
//! `Name=<tag>/<name>`; its attachments are the file system's mount
//! targets, one per subnet, exported as `<ip>:/`. The caller's identity is
//! its subnet, which the executor reads from instance metadata and carries
//! in the opaque metadata slot of [`InstanceId`].

use crate::config::{mask_secret, Config, ConfigRegistration};
use crate::domain::ports::{StorageDriver, StorageExecutor};
use crate::domain::types::*;
use crate::drivers::aws::{
    AwsCli, AWS_CLI, AwsCredentials, Ec2Metadata, EfsCli, ElasticFileSystemsRef, FileSystemDescription,
    InstanceMetadata, InstanceMetadataRef,
};
use crate::error::{Error, Result};
use crate::os::command::{executable_exists, HostCommands};
use crate::os::mountinfo::{attachment_status, local_devices_from, MOUNTINFO_PATH};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

pub const DRIVER_NAME: &str = "efs";

const TAG_DELIMITER: &str = "/";
const NAME_TAG: &str = "Name";
const MOUNT_HELPER: &str = "mount.nfs4";

pub fn config_registration() -> ConfigRegistration {
    ConfigRegistration::new("EFS")
        .key("efs.accessKey", "", "AWS access key")
        .key("efs.secretKey", "", "AWS secret key")
        .key(
            "efs.securityGroups",
            "",
            "Comma separated security groups for new mount targets",
        )
        .key("efs.region", "", "AWS region")
        .key("efs.tag", "", "Name tag prefix for this deployment")
}

/// Identity of this host: its subnet, stored in the metadata slot
pub async fn subnet_instance_id(metadata: &dyn InstanceMetadata) -> Result<InstanceId> {
    let mac = metadata.get("mac").await?;
    let subnet = metadata
        .get(&format!("network/interfaces/macs/{}/subnet-id", mac))
        .await?;
    let mut iid = InstanceId::new("", DRIVER_NAME);
    iid.marshal_metadata(&subnet)?;
    Ok(iid)
}

/// Resolve an executor-produced identity into the subnet it names
pub fn resolve_instance(iid: &InstanceId) -> Result<Instance> {
    if !iid.id.is_empty() {
        return Ok(iid.clone().into());
    }
    let subnet: Option<String> = iid.unmarshal_metadata()?;
    match subnet.filter(|s| !s.is_empty()) {
        Some(subnet) => Ok(InstanceId::new(subnet, DRIVER_NAME).into()),
        None => Err(Error::missing("instance subnet ID")),
    }
}

// =============================================================================
// Storage Driver
// =============================================================================

pub struct EfsDriver {
    config: Config,
    tag: String,
    client: Option<ElasticFileSystemsRef>,
    metadata: Option<InstanceMetadataRef>,
    binary_available: fn(&str) -> bool,
}

impl Default for EfsDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl EfsDriver {
    pub fn new() -> Self {
        Self {
            config: Config::new(),
            tag: String::new(),
            client: None,
            metadata: None,
            binary_available: executable_exists,
        }
    }

    /// Driver with substituted EFS client, metadata service and PATH lookup
    pub fn with_backends(
        client: ElasticFileSystemsRef,
        metadata: InstanceMetadataRef,
        binary_available: fn(&str) -> bool,
    ) -> Self {
        Self {
            client: Some(client),
            metadata: Some(metadata),
            binary_available,
            ..Self::new()
        }
    }

    fn client(&self) -> Result<&ElasticFileSystemsRef> {
        self.client
            .as_ref()
            .ok_or_else(|| Error::Internal("efs driver used before init".into()))
    }

    /// Name tag prefix; applied even when the tag is empty
    fn prefix(&self) -> String {
        format!("{}{}", self.tag, TAG_DELIMITER)
    }

    fn full_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix(), name)
    }

    fn tag_name<'a>(&self, fs: &'a FileSystemDescription) -> &'a str {
        fs.name.as_deref().unwrap_or(&fs.creation_token)
    }

    fn owns(&self, fs: &FileSystemDescription) -> bool {
        self.tag_name(fs).starts_with(&self.prefix())
    }

    /// File system by id, provided it carries this deployment's tag
    async fn owned_file_system(&self, volume_id: &str) -> Result<FileSystemDescription> {
        self.client()?
            .describe_file_system(volume_id)
            .await?
            .filter(|fs| self.owns(fs))
            .ok_or_else(|| Error::not_found("Volume", volume_id))
    }

    fn to_volume(&self, fs: &FileSystemDescription) -> Volume {
        let tag_name = self.tag_name(fs);
        let name = tag_name.strip_prefix(&self.prefix()).unwrap_or(tag_name);
        let mut volume = Volume::new(name, &fs.file_system_id, StorageType::Nas);
        volume.size = fs.size_in_bytes.as_ref().map(|s| s.value);
        if !fs.life_cycle_state.is_empty() {
            volume
                .fields
                .insert("lifeCycleState".into(), fs.life_cycle_state.clone());
        }
        volume
    }

    async fn attachments(
        &self,
        volume_id: &str,
        local_devices: Option<&LocalDevices>,
    ) -> Result<Vec<VolumeAttachment>> {
        if volume_id.is_empty() {
            return Err(Error::missing_volume_id());
        }
        let targets = self.client()?.describe_mount_targets(volume_id).await?;
        Ok(targets
            .into_iter()
            .map(|target| {
                let device = format!("{}:/", target.ip_address);
                VolumeAttachment {
                    volume_id: target.file_system_id,
                    instance_id: InstanceId::new(target.subnet_id, DRIVER_NAME),
                    status: attachment_status(&device, local_devices),
                    device_name: device,
                }
            })
            .collect())
    }

    async fn with_attachments(
        &self,
        mut volume: Volume,
        attachments: bool,
        local_devices: Option<&LocalDevices>,
    ) -> Result<Volume> {
        if attachments {
            volume.attachments = Some(self.attachments(&volume.id, local_devices).await?);
        }
        Ok(volume)
    }

    async fn all_file_systems(&self) -> Result<Vec<FileSystemDescription>> {
        let client = self.client()?;
        let mut file_systems = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let page = client.describe_file_systems(marker.as_deref()).await?;
            file_systems.extend(page.file_systems);
            match page.next_marker {
                Some(next) => marker = Some(next),
                None => break,
            }
        }
        Ok(file_systems)
    }
}

#[async_trait]
impl StorageDriver for EfsDriver {
    fn name(&self) -> &str {
        DRIVER_NAME
    }

    async fn init(&mut self, config: &Config) -> Result<()> {
        config.register(&config_registration());
        self.config = config.clone();
        self.tag = config.get_string("efs.tag");

        let creds = AwsCredentials::from_config(config, DRIVER_NAME);
        info!(
            driver = DRIVER_NAME,
            access_key = mask_secret(&creds.access_key),
            secret_key = mask_secret(&creds.secret_key),
            region = %creds.region,
            tag = %self.tag,
            "Initializing storage driver"
        );
        if !(self.binary_available)(AWS_CLI) {
            return Err(Error::Configuration(format!(
                "efs: {} not found on PATH",
                AWS_CLI
            )));
        }
        if self.client.is_none() {
            let cli = AwsCli::new(HostCommands::shared(), creds);
            self.client = Some(Arc::new(EfsCli::new(cli)));
        }
        if self.metadata.is_none() {
            self.metadata = Some(Arc::new(Ec2Metadata::new()?));
        }
        Ok(())
    }

    fn storage_type(&self) -> StorageType {
        StorageType::Nas
    }

    async fn instance_inspect(&self) -> Result<Instance> {
        let metadata = self
            .metadata
            .as_ref()
            .ok_or_else(|| Error::Internal("efs driver used before init".into()))?;
        let iid = subnet_instance_id(metadata.as_ref()).await?;
        resolve_instance(&iid)
    }

    async fn volumes(&self, opts: &VolumesOpts) -> Result<Vec<Volume>> {
        let mut volumes = Vec::new();
        for fs in self.all_file_systems().await? {
            if !self.owns(&fs) {
                continue;
            }
            let volume = self
                .with_attachments(
                    self.to_volume(&fs),
                    opts.attachments,
                    opts.local_devices.as_ref(),
                )
                .await?;
            volumes.push(volume);
        }
        Ok(volumes)
    }

    async fn volume_inspect(&self, volume_id: &str, opts: &VolumeInspectOpts) -> Result<Volume> {
        if volume_id.is_empty() {
            return Err(Error::missing_volume_id());
        }
        let fs = self.owned_file_system(volume_id).await?;
        self.with_attachments(
            self.to_volume(&fs),
            opts.attachments,
            opts.local_devices.as_ref(),
        )
        .await
    }

    async fn volume_create(&self, name: &str, _opts: &VolumeCreateOpts) -> Result<Volume> {
        if name.is_empty() {
            return Err(Error::missing_volume_name());
        }
        let client = self.client()?;
        let fs = client.create_file_system(name).await?;
        client
            .create_tag(&fs.file_system_id, NAME_TAG, &self.full_name(name))
            .await?;
        debug!(driver = DRIVER_NAME, file_system = %fs.file_system_id, "File system created");
        self.volume_inspect(&fs.file_system_id, &VolumeInspectOpts::default())
            .await
    }

    async fn volume_remove(&self, volume_id: &str) -> Result<()> {
        if volume_id.is_empty() {
            return Err(Error::missing_volume_id());
        }
        self.owned_file_system(volume_id).await?;
        let client = self.client()?;
        for target in client.describe_mount_targets(volume_id).await? {
            client.delete_mount_target(&target.mount_target_id).await?;
            debug!(driver = DRIVER_NAME, mount_target = %target.mount_target_id, "Mount target deleted");
        }
        client.delete_file_system(volume_id).await?;
        info!(driver = DRIVER_NAME, file_system = volume_id, "File system removed");
        Ok(())
    }

    /// Ensure a mount target exists in the caller's subnet
    ///
    /// A second attach from the same subnet finds the existing target and
    /// creates nothing.
    async fn volume_attach(
        &self,
        volume_id: &str,
        opts: &VolumeAttachOpts,
    ) -> Result<(Volume, String)> {
        let inspect = VolumeInspectOpts::with_attachments(opts.local_devices.clone());
        let volume = self.volume_inspect(volume_id, &inspect).await?;

        let instance = match &opts.instance_id {
            Some(iid) => resolve_instance(iid)?,
            None => self.instance_inspect().await?,
        };
        let subnet = instance.instance_id.id;
        let attached = volume
            .attachments
            .iter()
            .flatten()
            .any(|a| a.instance_id.id == subnet);
        if attached {
            return Ok((volume, String::new()));
        }

        let security_groups = self.config.get_string_list("efs.securityGroups");
        let target = self
            .client()?
            .create_mount_target(&volume.id, &subnet, &security_groups)
            .await?;
        info!(
            driver = DRIVER_NAME,
            file_system = %volume.id,
            subnet = %subnet,
            mount_target = %target.mount_target_id,
            "Mount target created"
        );
        let volume = self.volume_inspect(volume_id, &inspect).await?;
        Ok((volume, String::new()))
    }

    /// No-op: a mount target serves every host in its subnet, so removing
    /// it here could cut off other attachers
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

pub struct EfsExecutor {
    metadata: Option<InstanceMetadataRef>,
    mount_table: PathBuf,
}

impl Default for EfsExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl EfsExecutor {
    pub fn new() -> Self {
        Self {
            metadata: None,
            mount_table: MOUNTINFO_PATH.into(),
        }
    }

    pub fn with_backends(metadata: InstanceMetadataRef, mount_table: impl Into<PathBuf>) -> Self {
        Self {
            metadata: Some(metadata),
            mount_table: mount_table.into(),
        }
    }
}

#[async_trait]
impl StorageExecutor for EfsExecutor {
    fn name(&self) -> &str {
        DRIVER_NAME
    }

    async fn init(&mut self, config: &Config) -> Result<()> {
        config.register(&config_registration());
        if self.metadata.is_none() {
            self.metadata = Some(Arc::new(Ec2Metadata::new()?));
        }
        Ok(())
    }

    async fn instance_id(&self) -> Result<InstanceId> {
        let metadata = self
            .metadata
            .as_ref()
            .ok_or_else(|| Error::Internal("efs executor used before init".into()))?;
        subnet_instance_id(metadata.as_ref()).await
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
    use crate::drivers::aws::fake::StaticMetadata;
    use crate::drivers::aws::{ElasticFileSystems, FileSystemPage, FileSystemSize, MountTarget};
    use assert_matches::assert_matches;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;
    use std::io::Write;

    /// File systems served one per page
    #[derive(Default)]
    struct MemoryEfs {
        file_systems: Mutex<Vec<FileSystemDescription>>,
        targets: Mutex<Vec<MountTarget>>,
        calls: Mutex<Vec<String>>,
    }

    impl MemoryEfs {
        fn record(&self, op: &str) {
            self.calls.lock().push(op.to_string());
        }

        fn count(&self, op: &str) -> usize {
            self.calls.lock().iter().filter(|c| *c == op).count()
        }

        fn add(&self, id: &str, name: &str) {
            self.file_systems.lock().push(FileSystemDescription {
                file_system_id: id.into(),
                name: Some(name.into()),
                creation_token: name.into(),
                size_in_bytes: Some(FileSystemSize { value: 6144 }),
                life_cycle_state: "available".into(),
            });
        }

        fn add_target(&self, fs: &str, subnet: &str, ip: &str) {
            let mut targets = self.targets.lock();
            let id = format!("fsmt-{}", targets.len());
            targets.push(MountTarget {
                mount_target_id: id,
                file_system_id: fs.into(),
                subnet_id: subnet.into(),
                ip_address: ip.into(),
                life_cycle_state: "available".into(),
            });
        }
    }

    #[async_trait]
    impl ElasticFileSystems for MemoryEfs {
        async fn describe_file_systems(&self, marker: Option<&str>) -> Result<FileSystemPage> {
            self.record("describe_file_systems");
            let all = self.file_systems.lock();
            let index: usize = marker.and_then(|m| m.parse().ok()).unwrap_or(0);
            let next = index + 1;
            Ok(FileSystemPage {
                file_systems: all.get(index).cloned().into_iter().collect(),
                next_marker: (next < all.len()).then(|| next.to_string()),
            })
        }

        async fn describe_file_system(&self, id: &str) -> Result<Option<FileSystemDescription>> {
            self.record("describe_file_system");
            Ok(self
                .file_systems
                .lock()
                .iter()
                .find(|fs| fs.file_system_id == id)
                .cloned())
        }

        async fn create_file_system(&self, creation_token: &str) -> Result<FileSystemDescription> {
            self.record("create_file_system");
            let id = format!("fs-{}", self.file_systems.lock().len() + 1);
            let fs = FileSystemDescription {
                file_system_id: id,
                name: None,
                creation_token: creation_token.into(),
                size_in_bytes: Some(FileSystemSize { value: 0 }),
                life_cycle_state: "creating".into(),
            };
            self.file_systems.lock().push(fs.clone());
            Ok(fs)
        }

        async fn create_tag(&self, file_system_id: &str, key: &str, value: &str) -> Result<()> {
            self.record("create_tag");
            assert_eq!(key, NAME_TAG);
            if let Some(fs) = self
                .file_systems
                .lock()
                .iter_mut()
                .find(|fs| fs.file_system_id == file_system_id)
            {
                fs.name = Some(value.into());
            }
            Ok(())
        }

        async fn describe_mount_targets(&self, file_system_id: &str) -> Result<Vec<MountTarget>> {
            self.record("describe_mount_targets");
            Ok(self
                .targets
                .lock()
                .iter()
                .filter(|t| t.file_system_id == file_system_id)
                .cloned()
                .collect())
        }

        async fn create_mount_target(
            &self,
            file_system_id: &str,
            subnet_id: &str,
            security_groups: &[String],
        ) -> Result<MountTarget> {
            self.record("create_mount_target");
            assert_eq!(security_groups, ["sg-1".to_string(), "sg-2".to_string()]);
            self.add_target(file_system_id, subnet_id, "10.0.1.9");
            Ok(self.targets.lock().last().cloned().unwrap())
        }

        async fn delete_mount_target(&self, mount_target_id: &str) -> Result<()> {
            self.record("delete_mount_target");
            self.targets
                .lock()
                .retain(|t| t.mount_target_id != mount_target_id);
            Ok(())
        }

        async fn delete_file_system(&self, file_system_id: &str) -> Result<()> {
            self.record("delete_file_system");
            assert!(self
                .targets
                .lock()
                .iter()
                .all(|t| t.file_system_id != file_system_id));
            self.file_systems
                .lock()
                .retain(|fs| fs.file_system_id != file_system_id);
            Ok(())
        }
    }

    fn metadata(subnet: &str) -> Arc<StaticMetadata> {
        let mut answers = BTreeMap::new();
        answers.insert("mac".to_string(), "0e:aa:bb".to_string());
        answers.insert(
            "network/interfaces/macs/0e:aa:bb/subnet-id".to_string(),
            subnet.to_string(),
        );
        Arc::new(StaticMetadata(answers))
    }

    async fn driver(tag: &str) -> (EfsDriver, Arc<MemoryEfs>) {
        let efs = Arc::new(MemoryEfs::default());
        let config = Config::isolated();
        config.set("efs.tag", tag);
        config.set("efs.securityGroups", "sg-1, sg-2");
        let mut driver = EfsDriver::with_backends(efs.clone(), metadata("subnet-a"), |_| true);
        driver.init(&config).await.unwrap();
        (driver, efs)
    }

    #[tokio::test]
    async fn test_create_then_inspect() {
        let (driver, efs) = driver("prod").await;
        let created = driver
            .volume_create("data", &VolumeCreateOpts::default())
            .await
            .unwrap();
        assert_eq!(created.name, "data");
        assert_eq!(created.id, "fs-1");
        assert_eq!(
            efs.file_systems.lock()[0].name.as_deref(),
            Some("prod/data")
        );

        let inspected = driver
            .volume_inspect(&created.id, &VolumeInspectOpts::default())
            .await
            .unwrap();
        assert_eq!((inspected.name, inspected.id), (created.name, created.id));
        assert_eq!(inspected.storage_type, StorageType::Nas);
    }

    #[tokio::test]
    async fn test_volumes_pages_and_filters_by_tag() {
        let (driver, efs) = driver("prod").await;
        efs.add("fs-1", "prod/a");
        efs.add("fs-2", "dev/b");
        efs.add("fs-3", "prod/c");
        let volumes = driver.volumes(&VolumesOpts::default()).await.unwrap();
        let names: Vec<&str> = volumes.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["a", "c"]);
        assert_eq!(volumes[0].size, Some(6144));
        assert_eq!(efs.count("describe_file_systems"), 3);
        assert_eq!(efs.count("describe_mount_targets"), 0);
    }

    #[tokio::test]
    async fn test_attachments_from_mount_targets() {
        let (driver, efs) = driver("prod").await;
        efs.add("fs-1", "prod/data");
        efs.add_target("fs-1", "subnet-a", "10.0.0.5");
        efs.add_target("fs-1", "subnet-b", "10.0.2.7");
        let mut ld = LocalDevices::default();
        ld.device_map.insert("10.0.0.5:/".into(), "/mnt/data".into());

        let volume = driver
            .volume_inspect("fs-1", &VolumeInspectOpts::with_attachments(Some(ld)))
            .await
            .unwrap();
        let atts = volume.attachments.unwrap();
        assert_eq!(atts.len(), 2);
        assert_eq!(atts[0].device_name, "10.0.0.5:/");
        assert_eq!(atts[0].instance_id.id, "subnet-a");
        assert_eq!(atts[0].status, AttachmentStatus::ExportedMounted);
        assert_eq!(atts[1].status, AttachmentStatus::ExportedUnmounted);
    }

    #[tokio::test]
    async fn test_attach_is_idempotent_per_subnet() {
        let (driver, efs) = driver("prod").await;
        efs.add("fs-1", "prod/data");

        let (volume, token) = driver
            .volume_attach("fs-1", &VolumeAttachOpts::default())
            .await
            .unwrap();
        assert!(token.is_empty());
        assert_eq!(efs.count("create_mount_target"), 1);
        let atts = volume.attachments.unwrap();
        assert_eq!(atts.len(), 1);
        assert_eq!(atts[0].instance_id.id, "subnet-a");

        driver
            .volume_attach("fs-1", &VolumeAttachOpts::default())
            .await
            .unwrap();
        assert_eq!(efs.count("create_mount_target"), 1);
    }

    #[tokio::test]
    async fn test_attach_uses_caller_identity() {
        let (driver, efs) = driver("prod").await;
        efs.add("fs-1", "prod/data");
        let mut iid = InstanceId::new("", DRIVER_NAME);
        iid.marshal_metadata(&"subnet-z").unwrap();
        let opts = VolumeAttachOpts {
            instance_id: Some(iid),
            ..Default::default()
        };
        let (volume, _) = driver.volume_attach("fs-1", &opts).await.unwrap();
        assert_eq!(volume.attachments.unwrap()[0].instance_id.id, "subnet-z");
    }

    #[tokio::test]
    async fn test_remove_deletes_targets_first() {
        let (driver, efs) = driver("prod").await;
        efs.add("fs-1", "prod/data");
        efs.add_target("fs-1", "subnet-a", "10.0.0.5");
        efs.add_target("fs-1", "subnet-b", "10.0.2.7");
        driver.volume_remove("fs-1").await.unwrap();
        assert_eq!(efs.count("delete_mount_target"), 2);
        assert!(efs.file_systems.lock().is_empty());
    }

    #[tokio::test]
    async fn test_validation_and_not_found() {
        let (driver, efs) = driver("prod").await;
        assert_matches!(
            driver.volume_create("", &VolumeCreateOpts::default()).await,
            Err(Error::MissingField { .. })
        );
        assert_matches!(
            driver.volume_inspect("", &VolumeInspectOpts::default()).await,
            Err(Error::MissingField { .. })
        );
        assert!(efs.calls.lock().is_empty());
        assert_matches!(
            driver.volume_inspect("fs-404", &VolumeInspectOpts::default()).await,
            Err(Error::NotFound { .. })
        );
        assert_matches!(driver.volume_snapshot("fs-1", "s").await, Err(Error::NotImplemented { .. }));
    }

    #[tokio::test]
    async fn test_untagged_driver_ignores_foreign_file_systems() {
        let (driver, efs) = driver("").await;
        efs.add("fs-1", "payroll-prod");
        efs.add("fs-2", "/scratch");

        let volumes = driver.volumes(&VolumesOpts::default()).await.unwrap();
        let names: Vec<&str> = volumes.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["scratch"]);

        assert_matches!(
            driver.volume_inspect("fs-1", &VolumeInspectOpts::default()).await,
            Err(Error::NotFound { .. })
        );
        assert_matches!(driver.volume_remove("fs-1").await, Err(Error::NotFound { .. }));
        assert_eq!(efs.count("delete_file_system"), 0);
        assert_eq!(efs.file_systems.lock().len(), 2);

        let created = driver
            .volume_create("data", &VolumeCreateOpts::default())
            .await
            .unwrap();
        assert_eq!(created.name, "data");
        assert_eq!(efs.file_systems.lock()[2].name.as_deref(), Some("/data"));
    }

    #[tokio::test]
    async fn test_init_requires_aws_cli() {
        let efs = Arc::new(MemoryEfs::default());
        let mut driver = EfsDriver::with_backends(efs, metadata("subnet-a"), |bin| bin != AWS_CLI);
        assert_matches!(
            driver.init(&Config::isolated()).await,
            Err(Error::Configuration(ref m)) if m.contains(AWS_CLI)
        );
    }

    #[tokio::test]
    async fn test_detach_leaves_targets() {
        let (driver, efs) = driver("prod").await;
        efs.add("fs-1", "prod/data");
        efs.add_target("fs-1", "subnet-a", "10.0.0.5");
        let volume = driver
            .volume_detach("fs-1", &VolumeDetachOpts::default())
            .await
            .unwrap();
        assert_eq!(volume.attachments.map(|a| a.len()), Some(1));
        assert_eq!(efs.count("delete_mount_target"), 0);
    }

    #[tokio::test]
    async fn test_executor_identity_round_trip() {
        let mut table = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            table,
            "50 25 0:60 / /mnt/data rw,relatime shared:40 - nfs4 10.0.0.5:/ rw,vers=4.1"
        )
        .unwrap();
        let executor = EfsExecutor::with_backends(metadata("subnet-a"), table.path());

        let iid = executor.instance_id().await.unwrap();
        assert!(iid.id.is_empty());
        let instance = resolve_instance(&iid).unwrap();
        assert_eq!(instance.instance_id.id, "subnet-a");

        let ld = executor.local_devices().await.unwrap();
        assert_eq!(ld.mount_point("10.0.0.5:/"), Some("/mnt/data"));

        assert_matches!(
            resolve_instance(&InstanceId::new("", DRIVER_NAME)),
            Err(Error::MissingField { .. })
        );
    }
}
