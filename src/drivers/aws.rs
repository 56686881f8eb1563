//! AWS Boundary
//!
//! The object-store and EFS variants reach AWS through the `aws` command
//! line client with JSON output. Credentials are handed to the child through
//! its environment, never its argument vector. Both vendor surfaces sit
//! behind traits ([`ObjectStore`], [`ElasticFileSystems`]) and the instance
//! metadata service behind [`InstanceMetadata`].

use crate::config::{mask_secret, Config};
use crate::error::{Error, Result};
use crate::os::command::{CommandExecutorRef, CommandSpec};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const AWS_CLI: &str = "aws";

/// Region that rejects an explicit bucket location constraint
const US_EAST_1: &str = "us-east-1";

const IMDS_ENDPOINT: &str = "http://169.254.169.254";
const IMDS_TOKEN_TTL_SECONDS: &str = "21600";
const IMDS_TIMEOUT: Duration = Duration::from_secs(2);

// =============================================================================
// Credentials
// =============================================================================

/// Static credentials and region for one driver
#[derive(Clone, Default, PartialEq, Eq)]
pub struct AwsCredentials {
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
}

impl std::fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("access_key", &mask_secret(&self.access_key))
            .field("secret_key", &mask_secret(&self.secret_key))
            .field("region", &self.region)
            .finish()
    }
}

impl AwsCredentials {
    /// Read `<prefix>.accessKey`, `<prefix>.secretKey` and `<prefix>.region`
    pub fn from_config(config: &Config, prefix: &str) -> Self {
        Self {
            access_key: config.get_string(&format!("{}.accessKey", prefix)),
            secret_key: config.get_string(&format!("{}.secretKey", prefix)),
            region: config.get_string(&format!("{}.region", prefix)),
        }
    }

    /// Both static keys are present
    pub fn has_keys(&self) -> bool {
        !self.access_key.is_empty() && !self.secret_key.is_empty()
    }

    /// Add region and static keys to a child's environment
    ///
    /// Without static keys the child falls back to its own provider chain
    /// (shared profile, instance role).
    pub fn apply(&self, mut spec: CommandSpec) -> CommandSpec {
        if !self.region.is_empty() {
            spec = spec.env("AWS_DEFAULT_REGION", &self.region);
        }
        if self.has_keys() {
            spec = spec
                .env("AWS_ACCESS_KEY_ID", &self.access_key)
                .env("AWS_SECRET_ACCESS_KEY", &self.secret_key);
        }
        spec
    }
}

// =============================================================================
// CLI Client
// =============================================================================

/// Thin wrapper over `aws <service> <operation> ... --output json`
#[derive(Clone)]
pub struct AwsCli {
    commands: CommandExecutorRef,
    credentials: AwsCredentials,
}

impl AwsCli {
    pub fn new(commands: CommandExecutorRef, credentials: AwsCredentials) -> Self {
        Self {
            commands,
            credentials,
        }
    }

    pub fn credentials(&self) -> &AwsCredentials {
        &self.credentials
    }

    fn spec(&self, service: &str, operation: &str, args: &[String]) -> CommandSpec {
        let spec = CommandSpec::new(format!("{} {}", service, operation), AWS_CLI)
            .args([service, operation])
            .args(args.iter().cloned())
            .args(["--output", "json"]);
        self.credentials.apply(spec)
    }

    /// Run an operation; empty output reads as `null`
    pub async fn call(&self, service: &str, operation: &str, args: &[String]) -> Result<Value> {
        let spec = self.spec(service, operation, args);
        let output = self.commands.run_checked(&spec).await?;
        parse_output(&spec.action, &output.stdout)
    }

    /// Run an operation and decode its output
    pub async fn call_as<T: DeserializeOwned>(
        &self,
        service: &str,
        operation: &str,
        args: &[String],
    ) -> Result<T> {
        let value = self.call(service, operation, args).await?;
        decode(&format!("{} {}", service, operation), value)
    }

    /// Run an operation whose failure may mean "absent"
    ///
    /// Returns `None` when the command fails and its stderr carries one of
    /// `absent_markers`; any other failure is an error.
    pub async fn call_optional(
        &self,
        service: &str,
        operation: &str,
        args: &[String],
        absent_markers: &[&str],
    ) -> Result<Option<Value>> {
        let spec = self.spec(service, operation, args);
        let output = self.commands.run(&spec).await?;
        if !output.success() && absent_markers.iter().any(|m| output.stderr.contains(m)) {
            debug!(action = %spec.action, "Resource absent");
            return Ok(None);
        }
        let output = output.check(&spec)?;
        parse_output(&spec.action, &output.stdout).map(Some)
    }
}

fn parse_output(command: &str, stdout: &str) -> Result<Value> {
    if stdout.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(stdout).map_err(|e| Error::CommandOutputParse {
        command: command.to_string(),
        reason: e.to_string(),
    })
}

fn decode<T: DeserializeOwned>(command: &str, value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| Error::CommandOutputParse {
        command: command.to_string(),
        reason: e.to_string(),
    })
}

fn args<const N: usize>(items: [&str; N]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

// =============================================================================
// Object Store Port
// =============================================================================

/// One page of object keys
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectPage {
    pub keys: Vec<String>,
    pub is_truncated: bool,
    pub next_token: Option<String>,
}

/// Bucket operations used by the object-backed variants
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn list_buckets(&self) -> Result<Vec<String>>;

    async fn bucket_exists(&self, bucket: &str) -> Result<bool>;

    async fn create_bucket(&self, bucket: &str) -> Result<()>;

    async fn wait_bucket_exists(&self, bucket: &str) -> Result<()>;

    async fn list_objects(&self, bucket: &str, token: Option<&str>) -> Result<ObjectPage>;

    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> Result<()>;

    async fn delete_bucket(&self, bucket: &str) -> Result<()>;

    async fn wait_bucket_not_exists(&self, bucket: &str) -> Result<()>;
}

pub type ObjectStoreRef = Arc<dyn ObjectStore>;

/// Drain a bucket page by page, delete it and wait until it is gone
///
/// The first failing step aborts the sequence and its error is returned
/// unchanged; the log records how far the drain got.
pub async fn remove_bucket(store: &dyn ObjectStore, bucket: &str) -> Result<()> {
    if bucket.is_empty() {
        return Err(Error::missing_volume_id());
    }

    let mut token: Option<String> = None;
    let mut drained = 0usize;
    loop {
        let page = match store.list_objects(bucket, token.as_deref()).await {
            Ok(page) => page,
            Err(e) => {
                warn!(bucket, drained, error = %e, "Bucket drain stopped while listing");
                return Err(e);
            }
        };
        if !page.keys.is_empty() {
            if let Err(e) = store.delete_objects(bucket, &page.keys).await {
                warn!(bucket, drained, error = %e, "Bucket drain stopped while deleting");
                return Err(e);
            }
            drained += page.keys.len();
        }
        if !page.is_truncated {
            break;
        }
        token = match page.next_token {
            Some(next) => Some(next),
            None => {
                return Err(Error::CommandOutputParse {
                    command: "s3api list-objects-v2".into(),
                    reason: "truncated page without a continuation token".into(),
                })
            }
        };
    }

    store.delete_bucket(bucket).await?;
    store.wait_bucket_not_exists(bucket).await?;
    info!(bucket, objects = drained, "Bucket removed");
    Ok(())
}

// =============================================================================
// S3 via CLI
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListBucketsOutput {
    #[serde(default)]
    buckets: Vec<BucketEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BucketEntry {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListObjectsOutput {
    #[serde(default)]
    contents: Vec<ObjectEntry>,
    #[serde(default)]
    is_truncated: bool,
    #[serde(default)]
    next_continuation_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ObjectEntry {
    key: String,
}

/// [`ObjectStore`] over `aws s3api`
#[derive(Clone)]
pub struct S3Cli {
    cli: AwsCli,
}

impl S3Cli {
    pub fn new(cli: AwsCli) -> Self {
        Self { cli }
    }
}

#[async_trait]
impl ObjectStore for S3Cli {
    async fn list_buckets(&self) -> Result<Vec<String>> {
        let out: ListBucketsOutput = self.cli.call_as("s3api", "list-buckets", &[]).await?;
        Ok(out.buckets.into_iter().map(|b| b.name).collect())
    }

    async fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        let found = self
            .cli
            .call_optional(
                "s3api",
                "head-bucket",
                &args(["--bucket", bucket]),
                &["404", "Not Found", "NoSuchBucket"],
            )
            .await?;
        Ok(found.is_some())
    }

    async fn create_bucket(&self, bucket: &str) -> Result<()> {
        let mut create = args(["--bucket", bucket]);
        let region = &self.cli.credentials().region;
        if !region.is_empty() && region != US_EAST_1 {
            create.push("--create-bucket-configuration".into());
            create.push(format!("LocationConstraint={}", region));
        }
        self.cli.call("s3api", "create-bucket", &create).await?;
        Ok(())
    }

    async fn wait_bucket_exists(&self, bucket: &str) -> Result<()> {
        self.cli
            .call("s3api", "wait", &args(["bucket-exists", "--bucket", bucket]))
            .await?;
        Ok(())
    }

    async fn list_objects(&self, bucket: &str, token: Option<&str>) -> Result<ObjectPage> {
        let mut list = args(["--bucket", bucket, "--max-keys", "1000", "--no-paginate"]);
        if let Some(token) = token {
            list.push("--continuation-token".into());
            list.push(token.to_string());
        }
        let out: ListObjectsOutput = self.cli.call_as("s3api", "list-objects-v2", &list).await?;
        Ok(ObjectPage {
            keys: out.contents.into_iter().map(|o| o.key).collect(),
            is_truncated: out.is_truncated,
            next_token: out.next_continuation_token,
        })
    }

    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> Result<()> {
        let objects: Vec<Value> = keys.iter().map(|k| json!({ "Key": k })).collect();
        let delete = json!({ "Objects": objects, "Quiet": true }).to_string();
        self.cli
            .call(
                "s3api",
                "delete-objects",
                &args(["--bucket", bucket, "--delete", delete.as_str()]),
            )
            .await?;
        Ok(())
    }

    async fn delete_bucket(&self, bucket: &str) -> Result<()> {
        self.cli
            .call("s3api", "delete-bucket", &args(["--bucket", bucket]))
            .await?;
        Ok(())
    }

    async fn wait_bucket_not_exists(&self, bucket: &str) -> Result<()> {
        self.cli
            .call("s3api", "wait", &args(["bucket-not-exists", "--bucket", bucket]))
            .await?;
        Ok(())
    }
}

// =============================================================================
// Elastic File System Port
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FileSystemSize {
    pub value: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FileSystemDescription {
    pub file_system_id: String,
    /// Value of the `Name` tag
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub creation_token: String,
    #[serde(default)]
    pub size_in_bytes: Option<FileSystemSize>,
    #[serde(default)]
    pub life_cycle_state: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileSystemPage {
    pub file_systems: Vec<FileSystemDescription>,
    pub next_marker: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MountTarget {
    pub mount_target_id: String,
    pub file_system_id: String,
    pub subnet_id: String,
    #[serde(default)]
    pub ip_address: String,
    #[serde(default)]
    pub life_cycle_state: String,
}

/// File system and mount target operations used by the EFS variant
#[async_trait]
pub trait ElasticFileSystems: Send + Sync {
    async fn describe_file_systems(&self, marker: Option<&str>) -> Result<FileSystemPage>;

    /// `None` when no file system has this id
    async fn describe_file_system(&self, id: &str) -> Result<Option<FileSystemDescription>>;

    async fn create_file_system(&self, creation_token: &str) -> Result<FileSystemDescription>;

    async fn create_tag(&self, file_system_id: &str, key: &str, value: &str) -> Result<()>;

    async fn describe_mount_targets(&self, file_system_id: &str) -> Result<Vec<MountTarget>>;

    async fn create_mount_target(
        &self,
        file_system_id: &str,
        subnet_id: &str,
        security_groups: &[String],
    ) -> Result<MountTarget>;

    async fn delete_mount_target(&self, mount_target_id: &str) -> Result<()>;

    async fn delete_file_system(&self, file_system_id: &str) -> Result<()>;
}

pub type ElasticFileSystemsRef = Arc<dyn ElasticFileSystems>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeFileSystemsOutput {
    #[serde(default)]
    file_systems: Vec<FileSystemDescription>,
    #[serde(default)]
    next_marker: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeMountTargetsOutput {
    #[serde(default)]
    mount_targets: Vec<MountTarget>,
}

/// [`ElasticFileSystems`] over `aws efs`
#[derive(Clone)]
pub struct EfsCli {
    cli: AwsCli,
}

impl EfsCli {
    pub fn new(cli: AwsCli) -> Self {
        Self { cli }
    }
}

#[async_trait]
impl ElasticFileSystems for EfsCli {
    async fn describe_file_systems(&self, marker: Option<&str>) -> Result<FileSystemPage> {
        let mut describe = args(["--no-paginate"]);
        if let Some(marker) = marker {
            describe.push("--marker".into());
            describe.push(marker.to_string());
        }
        let out: DescribeFileSystemsOutput = self
            .cli
            .call_as("efs", "describe-file-systems", &describe)
            .await?;
        Ok(FileSystemPage {
            file_systems: out.file_systems,
            next_marker: out.next_marker,
        })
    }

    async fn describe_file_system(&self, id: &str) -> Result<Option<FileSystemDescription>> {
        let found = self
            .cli
            .call_optional(
                "efs",
                "describe-file-systems",
                &args(["--file-system-id", id]),
                &["FileSystemNotFound"],
            )
            .await?;
        match found {
            Some(value) => {
                let out: DescribeFileSystemsOutput = decode("efs describe-file-systems", value)?;
                Ok(out.file_systems.into_iter().next())
            }
            None => Ok(None),
        }
    }

    async fn create_file_system(&self, creation_token: &str) -> Result<FileSystemDescription> {
        self.cli
            .call_as(
                "efs",
                "create-file-system",
                &args(["--creation-token", creation_token]),
            )
            .await
    }

    async fn create_tag(&self, file_system_id: &str, key: &str, value: &str) -> Result<()> {
        let tag = format!("Key={},Value={}", key, value);
        self.cli
            .call(
                "efs",
                "create-tags",
                &args(["--file-system-id", file_system_id, "--tags", tag.as_str()]),
            )
            .await?;
        Ok(())
    }

    async fn describe_mount_targets(&self, file_system_id: &str) -> Result<Vec<MountTarget>> {
        let out: DescribeMountTargetsOutput = self
            .cli
            .call_as(
                "efs",
                "describe-mount-targets",
                &args(["--file-system-id", file_system_id]),
            )
            .await?;
        Ok(out.mount_targets)
    }

    async fn create_mount_target(
        &self,
        file_system_id: &str,
        subnet_id: &str,
        security_groups: &[String],
    ) -> Result<MountTarget> {
        let mut create = args(["--file-system-id", file_system_id, "--subnet-id", subnet_id]);
        if !security_groups.is_empty() {
            create.push("--security-groups".into());
            create.extend(security_groups.iter().cloned());
        }
        self.cli.call_as("efs", "create-mount-target", &create).await
    }

    async fn delete_mount_target(&self, mount_target_id: &str) -> Result<()> {
        self.cli
            .call(
                "efs",
                "delete-mount-target",
                &args(["--mount-target-id", mount_target_id]),
            )
            .await?;
        Ok(())
    }

    async fn delete_file_system(&self, file_system_id: &str) -> Result<()> {
        self.cli
            .call(
                "efs",
                "delete-file-system",
                &args(["--file-system-id", file_system_id]),
            )
            .await?;
        Ok(())
    }
}

// =============================================================================
// Instance Metadata
// =============================================================================

/// Read-only access to the instance metadata tree
#[async_trait]
pub trait InstanceMetadata: Send + Sync {
    /// Value at `meta-data/<path>`
    async fn get(&self, path: &str) -> Result<String>;
}

pub type InstanceMetadataRef = Arc<dyn InstanceMetadata>;

/// IMDSv2 client: session token first, then the metadata read
#[derive(Debug, Clone)]
pub struct Ec2Metadata {
    client: reqwest::Client,
    endpoint: String,
}

impl Ec2Metadata {
    pub fn new() -> Result<Self> {
        Self::with_endpoint(IMDS_ENDPOINT)
    }

    pub fn with_endpoint(endpoint: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(IMDS_TIMEOUT).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        })
    }

    async fn session_token(&self) -> Result<String> {
        let response = self
            .client
            .put(format!("{}/latest/api/token", self.endpoint))
            .header("X-aws-ec2-metadata-token-ttl-seconds", IMDS_TOKEN_TTL_SECONDS)
            .send()
            .await
            .map_err(|e| {
                Error::InstanceMetadata(format!("metadata service not available: {}", e))
            })?;
        Ok(response.error_for_status()?.text().await?)
    }
}

#[async_trait]
impl InstanceMetadata for Ec2Metadata {
    async fn get(&self, path: &str) -> Result<String> {
        let token = self.session_token().await?;
        let response = self
            .client
            .get(format!("{}/latest/meta-data/{}", self.endpoint, path))
            .header("X-aws-ec2-metadata-token", token)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| Error::InstanceMetadata(format!("no metadata at {}: {}", path, e)))?;
        Ok(response.text().await?.trim().to_string())
    }
}

// =============================================================================
// In-memory Fakes
// =============================================================================

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;

    /// Buckets of keys, listed in fixed-size pages
    #[derive(Default)]
    pub(crate) struct MemoryObjectStore {
        pub buckets: Mutex<BTreeMap<String, Vec<String>>>,
        pub page_size: usize,
        pub calls: Mutex<Vec<String>>,
        /// Operation name that fails once reached
        pub fail_on: Mutex<Option<&'static str>>,
    }

    impl MemoryObjectStore {
        pub(crate) fn new(page_size: usize) -> Arc<Self> {
            Arc::new(Self {
                page_size,
                ..Default::default()
            })
        }

        pub(crate) fn with_bucket(&self, bucket: &str, objects: usize) {
            let keys = (0..objects).map(|i| format!("obj-{:04}", i)).collect();
            self.buckets.lock().insert(bucket.to_string(), keys);
        }

        pub(crate) fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        fn record(&self, op: &'static str) -> Result<()> {
            self.calls.lock().push(op.to_string());
            if *self.fail_on.lock() == Some(op) {
                return Err(Error::Internal(format!("{} failed", op)));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ObjectStore for MemoryObjectStore {
        async fn list_buckets(&self) -> Result<Vec<String>> {
            self.record("list_buckets")?;
            Ok(self.buckets.lock().keys().cloned().collect())
        }

        async fn bucket_exists(&self, bucket: &str) -> Result<bool> {
            self.record("bucket_exists")?;
            Ok(self.buckets.lock().contains_key(bucket))
        }

        async fn create_bucket(&self, bucket: &str) -> Result<()> {
            self.record("create_bucket")?;
            self.buckets.lock().entry(bucket.to_string()).or_default();
            Ok(())
        }

        async fn wait_bucket_exists(&self, _bucket: &str) -> Result<()> {
            self.record("wait_bucket_exists")
        }

        async fn list_objects(&self, bucket: &str, token: Option<&str>) -> Result<ObjectPage> {
            self.record("list_objects")?;
            let buckets = self.buckets.lock();
            let keys = buckets
                .get(bucket)
                .ok_or_else(|| Error::not_found("Bucket", bucket))?;
            let start: usize = token.and_then(|t| t.parse().ok()).unwrap_or(0);
            let end = (start + self.page_size).min(keys.len());
            let is_truncated = end < keys.len();
            Ok(ObjectPage {
                keys: keys[start.min(end)..end].to_vec(),
                is_truncated,
                next_token: is_truncated.then(|| end.to_string()),
            })
        }

        async fn delete_objects(&self, bucket: &str, keys: &[String]) -> Result<()> {
            self.record("delete_objects")?;
            // Deleted keys stay in place so paging tokens remain offsets;
            // the bucket is emptied once delete_bucket runs.
            let _ = (bucket, keys);
            Ok(())
        }

        async fn delete_bucket(&self, bucket: &str) -> Result<()> {
            self.record("delete_bucket")?;
            self.buckets.lock().remove(bucket);
            Ok(())
        }

        async fn wait_bucket_not_exists(&self, _bucket: &str) -> Result<()> {
            self.record("wait_bucket_not_exists")
        }
    }

    /// Fixed metadata answers by path
    #[derive(Default)]
    pub(crate) struct StaticMetadata(pub BTreeMap<String, String>);

    #[async_trait]
    impl InstanceMetadata for StaticMetadata {
        async fn get(&self, path: &str) -> Result<String> {
            self.0
                .get(path)
                .cloned()
                .ok_or_else(|| Error::InstanceMetadata(format!("no metadata at {}", path)))
        }
    }
}
