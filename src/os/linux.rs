//! Linux Mount Engine
//!
//! Routes a mount request by the shape of the device string:
//!
//! - `s3://bucket` goes to the object filesystem helper, with the passphrase
//!   piped on stdin to a child in its own session, then verified against the
//!   live mount table
//! - `host:/export` goes to the network filesystem helper (`mount`)
//! - anything else is a block device: probe the signature, then mount(2)
//!
//! Every successful mount ends by creating the data directory under the
//! mount point with the configured mode.

use crate::config::{mask_secret, Config, ConfigRegistration};
use crate::domain::ports::OsDriver;
use crate::domain::types::{DeviceFormatOpts, DeviceMountOpts, MountInfo};
use crate::error::{Error, Result};
use crate::os::command::{
    executable_exists, CommandExecutorRef, CommandSpec, HostCommands, Secret,
};
use crate::os::mountinfo::{filter_mounts, read_mount_table, MOUNTINFO_PATH};
use crate::os::probe::probe_fs_type;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const DRIVER_NAME: &str = "linux";

const DEFAULT_FILE_MODE: u32 = 0o700;
const DEFAULT_ROOT_PATH: &str = "/data";

/// Default keys contributed by the mount engine
pub fn config_registration() -> ConfigRegistration {
    ConfigRegistration::new("Linux")
        .key(
            "linux.volume.filemode",
            DEFAULT_FILE_MODE as i64,
            "Mode of the data directory created under each mount point",
        )
        .key(
            "linux.volume.rootpath",
            DEFAULT_ROOT_PATH,
            "Data directory created under each mount point",
        )
        .key(
            "linux.volume.objectivefsPassphrase",
            "",
            "Passphrase for mounting ObjectiveFS filesystems",
        )
}

// =============================================================================
// Device Classes
// =============================================================================

/// How a device string is mounted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    ObjectFs,
    Network,
    Block,
}

impl DeviceClass {
    pub fn of(device: &str) -> Self {
        if device.contains("s3://") {
            DeviceClass::ObjectFs
        } else if device.contains(':') {
            DeviceClass::Network
        } else {
            DeviceClass::Block
        }
    }
}

// =============================================================================
// Mount Syscalls
// =============================================================================

/// The mount(2)/umount(2) boundary
#[async_trait]
pub trait Mounter: Send + Sync {
    async fn mount(&self, source: &str, target: &str, fs_type: &str, options: &str) -> Result<()>;

    async fn unmount(&self, target: &str) -> Result<()>;
}

pub type MounterRef = Arc<dyn Mounter>;

/// Issues the syscalls through `nix` on a blocking thread
#[derive(Debug, Clone, Copy, Default)]
pub struct SyscallMounter;

#[async_trait]
impl Mounter for SyscallMounter {
    #[cfg(target_os = "linux")]
    async fn mount(&self, source: &str, target: &str, fs_type: &str, options: &str) -> Result<()> {
        let (source, target, fs_type) = (source.to_string(), target.to_string(), fs_type.to_string());
        let (flags, data) = split_mount_options(options);
        tokio::task::spawn_blocking(move || {
            let data = (!data.is_empty()).then_some(data.as_str());
            nix::mount::mount(
                Some(source.as_str()),
                target.as_str(),
                Some(fs_type.as_str()),
                flags,
                data,
            )
            .map_err(|e| Error::Mount {
                device: source.clone(),
                mount_point: target.clone(),
                reason: e.to_string(),
            })
        })
        .await
        .map_err(|e| Error::Internal(format!("mount task failed: {}", e)))?
    }

    #[cfg(not(target_os = "linux"))]
    async fn mount(&self, _source: &str, _target: &str, _fs: &str, _options: &str) -> Result<()> {
        Err(Error::UnsupportedOs(std::env::consts::OS.to_string()))
    }

    #[cfg(target_os = "linux")]
    async fn unmount(&self, target: &str) -> Result<()> {
        let target = target.to_string();
        tokio::task::spawn_blocking(move || {
            nix::mount::umount(target.as_str()).map_err(|e| Error::Mount {
                device: String::new(),
                mount_point: target.clone(),
                reason: format!("unmount: {}", e),
            })
        })
        .await
        .map_err(|e| Error::Internal(format!("unmount task failed: {}", e)))?
    }

    #[cfg(not(target_os = "linux"))]
    async fn unmount(&self, _target: &str) -> Result<()> {
        Err(Error::UnsupportedOs(std::env::consts::OS.to_string()))
    }
}

/// Split generic mount flags from filesystem-specific data
#[cfg(target_os = "linux")]
fn split_mount_options(options: &str) -> (nix::mount::MsFlags, String) {
    use nix::mount::MsFlags;

    let mut flags = MsFlags::empty();
    let mut data = Vec::new();
    for opt in options.split(',').map(str::trim).filter(|o| !o.is_empty()) {
        match opt {
            "ro" => flags |= MsFlags::MS_RDONLY,
            "rw" => {}
            "nosuid" => flags |= MsFlags::MS_NOSUID,
            "nodev" => flags |= MsFlags::MS_NODEV,
            "noexec" => flags |= MsFlags::MS_NOEXEC,
            "sync" => flags |= MsFlags::MS_SYNCHRONOUS,
            "noatime" => flags |= MsFlags::MS_NOATIME,
            "nodiratime" => flags |= MsFlags::MS_NODIRATIME,
            "relatime" => flags |= MsFlags::MS_RELATIME,
            other => data.push(other),
        }
    }
    (flags, data.join(","))
}

// =============================================================================
// Linux OS Driver
// =============================================================================

pub struct LinuxOsDriver {
    config: Config,
    commands: CommandExecutorRef,
    mounter: MounterRef,
    mount_table: PathBuf,
}

impl Default for LinuxOsDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl LinuxOsDriver {
    pub fn new() -> Self {
        Self::with_backends(
            HostCommands::shared(),
            Arc::new(SyscallMounter),
            MOUNTINFO_PATH,
        )
    }

    /// Driver with substituted process, syscall and mount table sources
    pub fn with_backends(
        commands: CommandExecutorRef,
        mounter: MounterRef,
        mount_table: impl Into<PathBuf>,
    ) -> Self {
        Self {
            config: Config::new(),
            commands,
            mounter,
            mount_table: mount_table.into(),
        }
    }

    fn file_mode(&self) -> u32 {
        self.config
            .get_int("linux.volume.filemode")
            .and_then(|m| u32::try_from(m).ok())
            .unwrap_or(DEFAULT_FILE_MODE)
    }

    fn root_path(&self) -> String {
        let root = self.config.get_string("linux.volume.rootpath");
        if root.is_empty() {
            DEFAULT_ROOT_PATH.to_string()
        } else {
            root
        }
    }

    /// `<mountPoint><rootpath>`
    pub fn volume_mount_path(&self, mount_point: &str) -> PathBuf {
        PathBuf::from(format!("{}{}", mount_point, self.root_path()))
    }

    async fn ensure_data_dir(&self, mount_point: &str) -> Result<()> {
        let path = self.volume_mount_path(mount_point);
        let mode = self.file_mode();
        tokio::fs::create_dir_all(&path).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).await?;
        }
        debug!(path = %path.display(), mode = %format!("{:o}", mode), "Prepared data directory");
        Ok(())
    }

    async fn object_fs_mount(&self, device: &str, mount_point: &str) -> Result<()> {
        let passphrase = self.config.get_string("linux.volume.objectivefsPassphrase");
        if passphrase.is_empty() {
            return Err(Error::Configuration(
                "missing passphrase: set linux.volume.objectivefsPassphrase".into(),
            ));
        }

        let spec = CommandSpec::new("objectivefsMount", "mount")
            .args(["-t", "objectivefs", device, mount_point])
            .stdin(Secret::line(&passphrase))
            .new_session();
        let output = self.commands.run_checked(&spec).await?;

        // The helper's exit code alone does not prove the mount exists
        if !self.is_mounted(mount_point).await? {
            return Err(Error::Mount {
                device: device.to_string(),
                mount_point: mount_point.to_string(),
                reason: format!(
                    "not in mount table after objectivefsMount (stdout={:?} stderr={:?})",
                    output.stdout, output.stderr
                ),
            });
        }
        Ok(())
    }

    async fn network_mount(&self, device: &str, mount_point: &str) -> Result<()> {
        let spec = CommandSpec::new("nfsMount", "mount").args([device, mount_point]);
        self.commands.run_checked(&spec).await?;
        Ok(())
    }

    async fn block_mount(
        &self,
        device: &str,
        mount_point: &str,
        opts: &DeviceMountOpts,
    ) -> Result<()> {
        let fs_type = probe_fs_type(device).await?;
        let options = mount_options(fs_type, opts);
        debug!(device, mount_point, fs_type, options = %options, "Mounting block device");
        self.mounter
            .mount(device, mount_point, fs_type, &options)
            .await
    }
}

/// Caller options and label, plus filesystem-specific flags
fn mount_options(fs_type: &str, opts: &DeviceMountOpts) -> String {
    let mut parts: Vec<&str> = [opts.mount_options.as_str(), opts.mount_label.as_str()]
        .into_iter()
        .filter(|p| !p.is_empty())
        .collect();
    // Cloned xfs volumes share a UUID
    if fs_type == "xfs" {
        parts.push("nouuid");
    }
    parts.join(",")
}

#[async_trait]
impl OsDriver for LinuxOsDriver {
    fn name(&self) -> &str {
        DRIVER_NAME
    }

    async fn init(&mut self, config: &Config) -> Result<()> {
        if !cfg!(target_os = "linux") {
            return Err(Error::UnsupportedOs(std::env::consts::OS.to_string()));
        }
        config.register(&config_registration());
        self.config = config.clone();
        let file_mode = format!("{:o}", self.file_mode());
        info!(
            driver = DRIVER_NAME,
            root_path = %self.root_path(),
            file_mode = %file_mode,
            passphrase = mask_secret(&self.config.get_string("linux.volume.objectivefsPassphrase")),
            "OS driver initialized"
        );
        Ok(())
    }

    async fn mounts(&self, device: &str, mount_point: &str) -> Result<Vec<MountInfo>> {
        if !device.is_empty() && !mount_point.is_empty() {
            return Err(Error::Usage(
                "cannot specify both device and mount point".into(),
            ));
        }
        let mounts = read_mount_table(&self.mount_table).await?;
        filter_mounts(mounts, device, mount_point)
    }

    async fn mount(&self, device: &str, mount_point: &str, opts: &DeviceMountOpts) -> Result<()> {
        let class = DeviceClass::of(device);
        info!(device, mount_point, ?class, "Mounting device");

        match class {
            DeviceClass::ObjectFs => self.object_fs_mount(device, mount_point).await?,
            DeviceClass::Network => self.network_mount(device, mount_point).await?,
            DeviceClass::Block => self.block_mount(device, mount_point, opts).await?,
        }

        self.ensure_data_dir(mount_point).await
    }

    async fn unmount(&self, mount_point: &str) -> Result<()> {
        info!(mount_point, "Unmounting");
        self.mounter.unmount(mount_point).await
    }

    async fn is_mounted(&self, mount_point: &str) -> Result<bool> {
        let mounts = read_mount_table(&self.mount_table).await?;
        Ok(mounts.iter().any(|m| m.mount_point == mount_point))
    }

    async fn format(&self, device: &str, opts: &DeviceFormatOpts) -> Result<()> {
        let detected = match probe_fs_type(device).await {
            Ok(fs_type) => Some(fs_type),
            Err(Error::UnknownFileSystem { .. }) => None,
            Err(e) => return Err(e),
        };
        info!(
            device,
            fs_detected = detected.is_some(),
            fs_type = detected.unwrap_or(""),
            overwrite = opts.overwrite,
            "Probe information"
        );

        if detected.is_some() && !opts.overwrite {
            return Ok(());
        }

        let spec = match opts.new_fs_type.as_str() {
            "ext4" => CommandSpec::new("mkfs", "mkfs.ext4").args(["-F", device]),
            "xfs" => CommandSpec::new("mkfs", "mkfs.xfs").args(["-f", device]),
            other => {
                warn!(device, fs_type = other, "Refusing to create unsupported filesystem");
                return Err(Error::UnsupportedFileSystem {
                    fs_type: other.to_string(),
                });
            }
        };
        self.commands.run_checked(&spec).await?;
        Ok(())
    }

    fn supported(&self) -> bool {
        cfg!(target_os = "linux") && executable_exists("mount")
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use crate::os::command::fake::RecordingCommands;
    use crate::os::probe::tests::device_image;
    use assert_matches::assert_matches;
    use parking_lot::Mutex;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    #[derive(Default)]
    struct RecordingMounter {
        mounts: Mutex<Vec<(String, String, String, String)>>,
    }

    #[async_trait]
    impl Mounter for RecordingMounter {
        async fn mount(&self, source: &str, target: &str, fs: &str, options: &str) -> Result<()> {
            self.mounts.lock().push((
                source.to_string(),
                target.to_string(),
                fs.to_string(),
                options.to_string(),
            ));
            Ok(())
        }

        async fn unmount(&self, _target: &str) -> Result<()> {
            Ok(())
        }
    }

    struct Harness {
        driver: LinuxOsDriver,
        commands: Arc<RecordingCommands>,
        mounter: Arc<RecordingMounter>,
        table: tempfile::NamedTempFile,
        mount_dir: tempfile::TempDir,
    }

    impl Harness {
        async fn new(yaml: &str) -> Self {
            let commands = RecordingCommands::new();
            let mounter = Arc::new(RecordingMounter::default());
            let table = tempfile::NamedTempFile::new().unwrap();
            let mut driver =
                LinuxOsDriver::with_backends(commands.clone(), mounter.clone(), table.path());
            let config = Config::isolated();
            config.load_yaml_str(yaml).unwrap();
            driver.init(&config).await.unwrap();
            Self {
                driver,
                commands,
                mounter,
                table,
                mount_dir: tempfile::tempdir().unwrap(),
            }
        }

        fn mount_point(&self) -> String {
            self.mount_dir.path().display().to_string()
        }

        fn add_mount(&mut self, source: &str, target: &str) {
            writeln!(self.table, "60 22 0:50 / {} rw - fuse {} rw", target, source).unwrap();
            self.table.flush().unwrap();
        }
    }

    #[test]
    fn test_device_classification() {
        assert_eq!(DeviceClass::of("s3://bucket"), DeviceClass::ObjectFs);
        assert_eq!(DeviceClass::of("10.0.0.5:/"), DeviceClass::Network);
        assert_eq!(DeviceClass::of("/dev/xvdf"), DeviceClass::Block);
    }

    #[test]
    fn test_mount_options() {
        let opts = DeviceMountOpts {
            mount_options: "noatime".into(),
            mount_label: String::new(),
        };
        assert_eq!(mount_options("ext4", &opts), "noatime");
        assert_eq!(mount_options("xfs", &opts), "noatime,nouuid");
        assert_eq!(mount_options("xfs", &DeviceMountOpts::default()), "nouuid");
    }

    #[test]
    fn test_split_mount_options() {
        let (flags, data) = split_mount_options("ro,noatime,nouuid,discard");
        assert!(flags.contains(nix::mount::MsFlags::MS_RDONLY));
        assert!(flags.contains(nix::mount::MsFlags::MS_NOATIME));
        assert_eq!(data, "nouuid,discard");
    }

    #[tokio::test]
    async fn test_format_is_noop_on_existing_filesystem() {
        let h = Harness::new("{}").await;
        let image = device_image(Some("ext4"));
        let device = image.path().display().to_string();

        h.driver
            .format(&device, &DeviceFormatOpts::default())
            .await
            .unwrap();
        assert!(h.commands.calls().is_empty());
    }

    #[tokio::test]
    async fn test_format_creates_filesystem() {
        let h = Harness::new("{}").await;
        let blank = device_image(None);
        let device = blank.path().display().to_string();

        h.driver
            .format(&device, &DeviceFormatOpts::default())
            .await
            .unwrap();

        let existing = device_image(Some("ext4"));
        let existing_dev = existing.path().display().to_string();
        let overwrite = DeviceFormatOpts {
            new_fs_type: "xfs".into(),
            overwrite: true,
        };
        h.driver.format(&existing_dev, &overwrite).await.unwrap();

        let calls = h.commands.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].argv(), vec!["mkfs.ext4", "-F", device.as_str()]);
        assert_eq!(calls[1].argv(), vec!["mkfs.xfs", "-f", existing_dev.as_str()]);
    }

    #[tokio::test]
    async fn test_format_rejects_unknown_type() {
        let h = Harness::new("{}").await;
        let blank = device_image(None);
        let opts = DeviceFormatOpts {
            new_fs_type: "zfs".into(),
            overwrite: false,
        };
        assert_matches!(
            h.driver.format(&blank.path().display().to_string(), &opts).await,
            Err(Error::UnsupportedFileSystem { ref fs_type }) if fs_type == "zfs"
        );
        assert!(h.commands.calls().is_empty());
    }

    #[tokio::test]
    async fn test_block_mount_probes_and_creates_data_dir() {
        let h = Harness::new("linux:\n  volume:\n    filemode: \"0750\"\n").await;
        let image = device_image(Some("xfs"));
        let device = image.path().display().to_string();
        let mp = h.mount_point();

        h.driver
            .mount(&device, &mp, &DeviceMountOpts::default())
            .await
            .unwrap();

        let mounts = h.mounter.mounts.lock().clone();
        assert_eq!(mounts, vec![(device, mp.clone(), "xfs".into(), "nouuid".into())]);

        let data = h.driver.volume_mount_path(&mp);
        let mode = std::fs::metadata(&data).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o750);
    }

    #[tokio::test]
    async fn test_block_mount_of_unformatted_device_fails() {
        let h = Harness::new("{}").await;
        let blank = device_image(None);
        assert_matches!(
            h.driver
                .mount(&blank.path().display().to_string(), &h.mount_point(), &DeviceMountOpts::default())
                .await,
            Err(Error::UnknownFileSystem { .. })
        );
        assert!(h.mounter.mounts.lock().is_empty());
    }

    #[tokio::test]
    async fn test_network_mount_runs_helper() {
        let h = Harness::new("linux:\n  volume:\n    rootpath: /payload\n").await;
        let mp = h.mount_point();
        h.driver
            .mount("10.0.0.5:/", &mp, &DeviceMountOpts::default())
            .await
            .unwrap();

        let calls = h.commands.calls();
        assert_eq!(calls[0].argv(), vec!["mount", "10.0.0.5:/", mp.as_str()]);
        assert!(calls[0].stdin.is_none());
        assert!(h.mount_dir.path().join("payload").is_dir());
    }

    #[tokio::test]
    async fn test_object_fs_mount_pipes_passphrase_and_verifies() {
        let mut h =
            Harness::new("linux:\n  volume:\n    objectivefsPassphrase: s3cret\n").await;
        let mp = h.mount_point();
        h.add_mount("s3://bucket", &mp);

        h.driver
            .mount("s3://bucket", &mp, &DeviceMountOpts::default())
            .await
            .unwrap();

        let calls = h.commands.calls();
        assert_eq!(calls.len(), 1);
        let call = &calls[0];
        assert_eq!(call.argv(), vec!["mount", "-t", "objectivefs", "s3://bucket", mp.as_str()]);
        assert_eq!(call.stdin.as_ref().unwrap().expose(), b"s3cret\n");
        assert!(call.new_session);
        assert!(call.envs.is_empty());
        assert!(!call.argv().iter().any(|a| a.contains("s3cret")));
    }

    #[tokio::test]
    async fn test_object_fs_mount_not_trusted_without_table_entry() {
        let h = Harness::new("linux:\n  volume:\n    objectivefsPassphrase: s3cret\n").await;
        let mp = h.mount_point();
        assert_matches!(
            h.driver.mount("s3://bucket", &mp, &DeviceMountOpts::default()).await,
            Err(Error::Mount { .. })
        );
    }

    #[tokio::test]
    async fn test_object_fs_mount_requires_passphrase() {
        let h = Harness::new("{}").await;
        assert_matches!(
            h.driver
                .mount("s3://bucket", &h.mount_point(), &DeviceMountOpts::default())
                .await,
            Err(Error::Configuration(_))
        );
        assert!(h.commands.calls().is_empty());
    }

    #[tokio::test]
    async fn test_mounts_filtering_and_is_mounted() {
        let mut h = Harness::new("{}").await;
        h.add_mount("host:/export", "/mnt/export");

        assert_eq!(h.driver.mounts("", "").await.unwrap().len(), 1);
        assert_eq!(
            h.driver.mounts("host:/export", "").await.unwrap()[0].mount_point,
            "/mnt/export"
        );
        assert_matches!(
            h.driver.mounts("host:/export", "/mnt/export").await,
            Err(Error::Usage(_))
        );
        assert!(h.driver.is_mounted("/mnt/export").await.unwrap());
        assert!(!h.driver.is_mounted("/mnt/other").await.unwrap());
    }
}
