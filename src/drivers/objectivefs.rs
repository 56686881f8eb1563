//! ObjectiveFS Storage Driver
//!
//! Object variant: every volume is an ObjectiveFS filesystem living in an
//! S3 bucket of the same name. Listing and creation go through the
//! `mount.objectivefs` tool; removal empties and deletes the bucket through
//! the [`ObjectStore`] port.

use crate::config::{mask_secret, Config, ConfigRegistration};
use crate::domain::ports::StorageDriver;
use crate::domain::types::*;
use crate::drivers::aws::{remove_bucket, AwsCli, AwsCredentials, ObjectStoreRef, S3Cli, AWS_CLI};
use crate::error::{Error, Result};
use crate::os::command::{executable_exists, CommandExecutorRef, CommandSpec, HostCommands, Secret};
use crate::os::mountinfo::attachment_status;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

pub const DRIVER_NAME: &str = "objectivefs";

const BINARY: &str = "mount.objectivefs";
const DEVICE_PREFIX: &str = "s3://";
const DEFAULT_REGION: &str = "us-east-1";

pub fn config_registration() -> ConfigRegistration {
    ConfigRegistration::new("ObjectiveFS")
        .key("objectivefs.accessKey", "", "AWS access key")
        .key("objectivefs.secretKey", "", "AWS secret key")
        .key(
            "objectivefs.metadataHost",
            "",
            "Instance metadata host used instead of static keys",
        )
        .key("objectivefs.license", "", "ObjectiveFS license")
        .key(
            "objectivefs.adminLicense",
            "",
            "ObjectiveFS admin license, required to create filesystems",
        )
        .key("objectivefs.passphrase", "", "Filesystem encryption passphrase")
        .key("objectivefs.region", DEFAULT_REGION, "AWS region")
}

/// Device string under which a filesystem is mounted
pub fn device_name(volume_id: &str) -> String {
    format!("{}{}", DEVICE_PREFIX, volume_id)
}

// =============================================================================
// Listing
// =============================================================================

/// One row of `mount.objectivefs list`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSystemEntry {
    pub name: String,
    pub kind: String,
    pub region: String,
}

/// Parse `mount.objectivefs list` output
///
/// ```text
/// NAME                        KIND    REGION
/// s3://test-fs-12             ofs     us-east-1
/// ```
///
/// The header is required; every following row must have exactly three
/// non-empty fields.
pub fn parse_list(output: &str) -> Result<Vec<FileSystemEntry>> {
    let invalid = |reason: String| Error::CommandOutputParse {
        command: format!("{} list", BINARY),
        reason,
    };

    let mut lines = output.lines();
    if lines.next().is_none() {
        return Err(invalid("no header".into()));
    }

    lines
        .map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let [name, kind, region] = fields[..] else {
                return Err(invalid(format!("expected 3 fields in {:?}", line)));
            };
            let name = name.trim_start_matches(DEVICE_PREFIX);
            if name.is_empty() {
                return Err(invalid(format!("empty name in {:?}", line)));
            }
            Ok(FileSystemEntry {
                name: name.to_string(),
                kind: kind.to_string(),
                region: region.to_string(),
            })
        })
        .collect()
}

// =============================================================================
// Driver
// =============================================================================

pub struct ObjectiveFsDriver {
    config: Config,
    commands: CommandExecutorRef,
    store: Option<ObjectStoreRef>,
    binary_available: fn(&str) -> bool,
}

impl Default for ObjectiveFsDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectiveFsDriver {
    pub fn new() -> Self {
        Self {
            config: Config::new(),
            commands: HostCommands::shared(),
            store: None,
            binary_available: executable_exists,
        }
    }

    /// Driver with substituted process runner, bucket store and PATH lookup
    pub fn with_backends(
        commands: CommandExecutorRef,
        store: ObjectStoreRef,
        binary_available: fn(&str) -> bool,
    ) -> Self {
        Self {
            config: Config::new(),
            commands,
            store: Some(store),
            binary_available,
        }
    }

    fn setting(&self, key: &str) -> String {
        self.config.get_string(&format!("objectivefs.{}", key))
    }

    fn credentials(&self) -> AwsCredentials {
        AwsCredentials::from_config(&self.config, DRIVER_NAME)
    }

    fn region(&self) -> String {
        let region = self.setting("region");
        if region.is_empty() {
            DEFAULT_REGION.to_string()
        } else {
            region
        }
    }

    fn store(&self) -> Result<&ObjectStoreRef> {
        self.store
            .as_ref()
            .ok_or_else(|| Error::Internal("objectivefs driver used before init".into()))
    }

    /// `mount.objectivefs <subcommand>` with credentials and `license`
    fn command(&self, action: &str, subcommand: &str, license: &str) -> CommandSpec {
        let mut spec = CommandSpec::new(action, BINARY)
            .arg(subcommand)
            .env_clear()
            .env("AWS_DEFAULT_REGION", self.region());
        let metadata_host = self.setting("metadataHost");
        if metadata_host.is_empty() {
            let creds = self.credentials();
            spec = spec
                .env("AWS_ACCESS_KEY_ID", creds.access_key)
                .env("AWS_SECRET_ACCESS_KEY", creds.secret_key);
        } else {
            spec = spec.env("AWS_METADATA_HOST", metadata_host);
        }
        spec.env("OBJECTIVEFS_LICENSE", license)
    }

    async fn file_systems(&self) -> Result<Vec<FileSystemEntry>> {
        let spec = self.command("objectivefsList", "list", &self.setting("license"));
        let output = self.commands.run_checked(&spec).await?;
        parse_list(&output.stdout)
    }

    fn to_volume(&self, fs: FileSystemEntry) -> Volume {
        let mut volume = Volume::new(&fs.name, &fs.name, StorageType::Object);
        volume.fields.insert("region".into(), fs.region);
        volume.fields.insert("kind".into(), fs.kind);
        volume
    }

    fn attachments(
        &self,
        volume_id: &str,
        local_devices: Option<&LocalDevices>,
    ) -> Result<Vec<VolumeAttachment>> {
        if volume_id.is_empty() {
            return Err(Error::missing_volume_id());
        }
        let device = device_name(volume_id);
        Ok(vec![VolumeAttachment {
            volume_id: volume_id.to_string(),
            instance_id: InstanceId::new(self.region(), DRIVER_NAME),
            status: attachment_status(&device, local_devices),
            device_name: device,
        }])
    }
}

#[async_trait]
impl StorageDriver for ObjectiveFsDriver {
    fn name(&self) -> &str {
        DRIVER_NAME
    }

    async fn init(&mut self, config: &Config) -> Result<()> {
        config.register(&config_registration());
        self.config = config.clone();

        let creds = self.credentials();
        let metadata_host = self.setting("metadataHost");
        info!(
            driver = DRIVER_NAME,
            access_key = mask_secret(&creds.access_key),
            secret_key = mask_secret(&creds.secret_key),
            region = %self.region(),
            metadata_host = %metadata_host,
            "Initializing storage driver"
        );

        if !creds.has_keys() && metadata_host.is_empty() {
            return Err(Error::Configuration(
                "objectivefs: missing metadata host or credentials".into(),
            ));
        }
        for (key, what) in [
            ("license", "license"),
            ("adminLicense", "admin license"),
            ("passphrase", "passphrase"),
        ] {
            if self.setting(key).is_empty() {
                return Err(Error::Configuration(format!(
                    "objectivefs: missing {} (objectivefs.{})",
                    what, key
                )));
            }
        }
        for binary in [BINARY, AWS_CLI] {
            if !(self.binary_available)(binary) {
                return Err(Error::Configuration(format!(
                    "objectivefs: {} not found on PATH",
                    binary
                )));
            }
        }

        if self.store.is_none() {
            let cli = AwsCli::new(self.commands.clone(), creds);
            self.store = Some(Arc::new(S3Cli::new(cli)));
        }
        info!(driver = DRIVER_NAME, "Storage driver initialized");
        Ok(())
    }

    fn storage_type(&self) -> StorageType {
        StorageType::Object
    }

    async fn instance_inspect(&self) -> Result<Instance> {
        Ok(InstanceId::new(self.region(), DRIVER_NAME).into())
    }

    async fn volumes(&self, opts: &VolumesOpts) -> Result<Vec<Volume>> {
        self.file_systems()
            .await?
            .into_iter()
            .map(|fs| {
                let mut volume = self.to_volume(fs);
                if opts.attachments {
                    volume.attachments =
                        Some(self.attachments(&volume.id, opts.local_devices.as_ref())?);
                }
                Ok(volume)
            })
            .collect()
    }

    async fn volume_inspect(&self, volume_id: &str, opts: &VolumeInspectOpts) -> Result<Volume> {
        if volume_id.is_empty() {
            return Err(Error::missing_volume_id());
        }
        let fs = self
            .file_systems()
            .await?
            .into_iter()
            .find(|fs| fs.name == volume_id)
            .ok_or_else(|| Error::not_found("Volume", volume_id))?;
        let mut volume = self.to_volume(fs);
        if opts.attachments {
            volume.attachments = Some(self.attachments(volume_id, opts.local_devices.as_ref())?);
        }
        Ok(volume)
    }

    async fn volume_create(&self, name: &str, _opts: &VolumeCreateOpts) -> Result<Volume> {
        if name.is_empty() {
            return Err(Error::missing_volume_name());
        }
        let spec = self
            .command("objectivefsCreate", "create", &self.setting("adminLicense"))
            .arg(name)
            .stdin(Secret::line(&self.setting("passphrase")))
            .new_session();
        let output = self.commands.run_checked(&spec).await?;
        debug!(
            driver = DRIVER_NAME,
            args = ?spec.argv(),
            stdout = %output.stdout,
            stderr = %output.stderr,
            "Filesystem created"
        );
        self.volume_inspect(name, &VolumeInspectOpts::default())
            .await
    }

    async fn volume_remove(&self, volume_id: &str) -> Result<()> {
        if volume_id.is_empty() {
            return Err(Error::missing_volume_id());
        }
        remove_bucket(self.store()?.as_ref(), volume_id).await
    }

    /// Filesystems are reachable from any host; attaching is a read-back
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

    /// Nothing is held per host; unmounting is the OS driver's job
    async fn volume_detach(&self, volume_id: &str, opts: &VolumeDetachOpts) -> Result<Volume> {
        self.volume_inspect(
            volume_id,
            &VolumeInspectOpts::with_attachments(opts.local_devices.clone()),
        )
        .await
    }
}
