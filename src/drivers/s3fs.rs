//! S3FS Storage Driver
//!
//! Object variant with one bucket per volume. Bucket names carry the
//! configured tag as a prefix (`<tag>--<name>`, `--<name>` when the tag is
//! empty) so several deployments can share an account; buckets without this
//! deployment's prefix are never listed, inspected or removed.

use crate::config::{mask_secret, Config, ConfigRegistration};
use crate::domain::ports::StorageDriver;
use crate::domain::types::*;
use crate::drivers::aws::{
    remove_bucket, AwsCli, AwsCredentials, ObjectStoreRef, S3Cli, AWS_CLI,
};
use crate::error::{Error, Result};
use crate::os::command::{executable_exists, HostCommands};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

pub const DRIVER_NAME: &str = "s3fs";

const TAG_DELIMITER: &str = "--";
const DEFAULT_REGION: &str = "us-east-1";

pub fn config_registration() -> ConfigRegistration {
    ConfigRegistration::new("S3FS")
        .key("s3fs.accessKey", "", "AWS access key")
        .key("s3fs.secretKey", "", "AWS secret key")
        .key("s3fs.region", DEFAULT_REGION, "AWS region")
        .key("s3fs.tag", "", "Bucket name prefix for this deployment")
}

/// Maps volume names to bucket names and back
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BucketNaming {
    tag: String,
}

impl BucketNaming {
    pub fn new(tag: impl Into<String>) -> Self {
        Self { tag: tag.into() }
    }

    fn prefix(&self) -> String {
        format!("{}{}", self.tag, TAG_DELIMITER)
    }

    /// Bucket for a volume name
    pub fn bucket(&self, name: &str) -> String {
        format!("{}{}", self.prefix(), name)
    }

    /// Volume name for a bucket
    pub fn printable<'a>(&self, bucket: &'a str) -> &'a str {
        bucket.strip_prefix(&self.prefix()).unwrap_or(bucket)
    }

    pub fn owns(&self, bucket: &str) -> bool {
        bucket.starts_with(&self.prefix())
    }
}

pub struct S3fsDriver {
    config: Config,
    naming: BucketNaming,
    store: Option<ObjectStoreRef>,
    binary_available: fn(&str) -> bool,
}

impl Default for S3fsDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl S3fsDriver {
    pub fn new() -> Self {
        Self {
            config: Config::new(),
            naming: BucketNaming::default(),
            store: None,
            binary_available: executable_exists,
        }
    }

    /// Driver with substituted bucket store and PATH lookup
    pub fn with_backends(store: ObjectStoreRef, binary_available: fn(&str) -> bool) -> Self {
        Self {
            store: Some(store),
            binary_available,
            ..Self::new()
        }
    }

    fn store(&self) -> Result<&ObjectStoreRef> {
        self.store
            .as_ref()
            .ok_or_else(|| Error::Internal("s3fs driver used before init".into()))
    }

    /// Reject ids outside this deployment's prefix before any backend call
    fn owned(&self, volume_id: &str) -> Result<()> {
        if volume_id.is_empty() {
            return Err(Error::missing_volume_id());
        }
        if !self.naming.owns(volume_id) {
            return Err(Error::not_found("Volume", volume_id));
        }
        Ok(())
    }

    fn region(&self) -> String {
        let region = self.config.get_string("s3fs.region");
        if region.is_empty() {
            DEFAULT_REGION.to_string()
        } else {
            region
        }
    }

    fn to_volume(&self, bucket: &str, with_attachments: bool) -> Volume {
        let mut volume = Volume::new(self.naming.printable(bucket), bucket, StorageType::Object);
        volume.fields.insert("bucket".into(), bucket.to_string());
        if with_attachments {
            // Buckets are mounted through FUSE, whose mount source does not
            // name the bucket, so no per-host attachment can be derived.
            volume.attachments = Some(Vec::new());
        }
        volume
    }
}

#[async_trait]
impl StorageDriver for S3fsDriver {
    fn name(&self) -> &str {
        DRIVER_NAME
    }

    async fn init(&mut self, config: &Config) -> Result<()> {
        config.register(&config_registration());
        self.config = config.clone();
        self.naming = BucketNaming::new(config.get_string("s3fs.tag"));

        let mut creds = AwsCredentials::from_config(config, DRIVER_NAME);
        creds.region = self.region();
        info!(
            driver = DRIVER_NAME,
            access_key = mask_secret(&creds.access_key),
            secret_key = mask_secret(&creds.secret_key),
            region = %creds.region,
            tag = %self.naming.tag,
            "Initializing storage driver"
        );
        if !(self.binary_available)(AWS_CLI) {
            return Err(Error::Configuration(format!(
                "s3fs: {} not found on PATH",
                AWS_CLI
            )));
        }
        if self.store.is_none() {
            let cli = AwsCli::new(HostCommands::shared(), creds);
            self.store = Some(Arc::new(S3Cli::new(cli)));
        }
        Ok(())
    }

    fn storage_type(&self) -> StorageType {
        StorageType::Object
    }

    async fn instance_inspect(&self) -> Result<Instance> {
        Ok(InstanceId::new(self.region(), DRIVER_NAME).into())
    }

    async fn volumes(&self, opts: &VolumesOpts) -> Result<Vec<Volume>> {
        let buckets = self.store()?.list_buckets().await?;
        Ok(buckets
            .iter()
            .filter(|b| self.naming.owns(b))
            .map(|b| self.to_volume(b, opts.attachments))
            .collect())
    }

    async fn volume_inspect(&self, volume_id: &str, opts: &VolumeInspectOpts) -> Result<Volume> {
        self.owned(volume_id)?;
        if !self.store()?.bucket_exists(volume_id).await? {
            return Err(Error::not_found("Volume", volume_id));
        }
        Ok(self.to_volume(volume_id, opts.attachments))
    }

    async fn volume_create(&self, name: &str, _opts: &VolumeCreateOpts) -> Result<Volume> {
        if name.is_empty() {
            return Err(Error::missing_volume_name());
        }
        let bucket = self.naming.bucket(name);
        let store = self.store()?;
        store.create_bucket(&bucket).await?;
        store.wait_bucket_exists(&bucket).await?;
        debug!(driver = DRIVER_NAME, bucket = %bucket, "Bucket created");
        self.volume_inspect(&bucket, &VolumeInspectOpts::default())
            .await
    }

    async fn volume_remove(&self, volume_id: &str) -> Result<()> {
        self.owned(volume_id)?;
        remove_bucket(self.store()?.as_ref(), volume_id).await
    }

    /// Buckets need no per-host resource; attaching is a read-back
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

    /// No-op: nothing was created by attach, so the volume is returned as is
    async fn volume_detach(&self, volume_id: &str, _opts: &VolumeDetachOpts) -> Result<Volume> {
        self.volume_inspect(volume_id, &VolumeInspectOpts::default())
            .await
    }
}
