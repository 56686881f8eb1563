//! Domain Types
//!
//! Volumes, attachments, instance identities and host mount state shared by
//! every driver family.

use crate::error::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// Storage Types
// =============================================================================

/// Coarse semantics a client should expect from a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Block,
    Nas,
    Object,
    Unknown,
}

impl std::fmt::Display for StorageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageType::Block => write!(f, "block"),
            StorageType::Nas => write!(f, "nas"),
            StorageType::Object => write!(f, "object"),
            StorageType::Unknown => write!(f, "unknown"),
        }
    }
}

// =============================================================================
// Instance Identity
// =============================================================================

/// Identity of the compute instance a driver observes itself running on
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InstanceId {
    /// Driver-specific identifier (region, subnet, host token)
    pub id: String,
    /// Name of the owning driver
    pub driver: String,
    /// Auxiliary attributes such as region or availability zone
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, String>,
    /// Opaque driver-encoded payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl InstanceId {
    pub fn new(id: impl Into<String>, driver: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            driver: driver.into(),
            ..Default::default()
        }
    }

    /// Encode a value into the opaque metadata slot
    pub fn marshal_metadata<T: Serialize>(&mut self, value: &T) -> Result<()> {
        self.metadata = Some(serde_json::to_value(value)?);
        Ok(())
    }

    /// Decode the opaque metadata slot
    pub fn unmarshal_metadata<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        match &self.metadata {
            Some(v) => Ok(Some(serde_json::from_value(v.clone())?)),
            None => Ok(None),
        }
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}", self.driver, self.id)
    }
}

/// Result of instance inspection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub instance_id: InstanceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl From<InstanceId> for Instance {
    fn from(instance_id: InstanceId) -> Self {
        Self {
            instance_id,
            name: None,
        }
    }
}

// =============================================================================
// Volumes & Attachments
// =============================================================================

/// Locally observed status of an attachment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttachmentStatus {
    /// Known to the backend, not verifiable from this host
    #[serde(rename = "Exported")]
    Exported,
    #[serde(rename = "Exported and Mounted")]
    ExportedMounted,
    #[serde(rename = "Exported and Unmounted")]
    ExportedUnmounted,
}

impl AttachmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentStatus::Exported => "Exported",
            AttachmentStatus::ExportedMounted => "Exported and Mounted",
            AttachmentStatus::ExportedUnmounted => "Exported and Unmounted",
        }
    }
}

impl std::fmt::Display for AttachmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Relationship between a volume and the instance that may access it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeAttachment {
    pub volume_id: String,
    pub instance_id: InstanceId,
    /// Local device path or export string
    pub device_name: String,
    pub status: AttachmentStatus,
}

/// A backend-addressable storage unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    pub name: String,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(rename = "type")]
    pub storage_type: StorageType,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, String>,
    /// `None` when attachments were not requested
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<VolumeAttachment>>,
}

impl Volume {
    pub fn new(name: impl Into<String>, id: impl Into<String>, storage_type: StorageType) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
            size: None,
            storage_type,
            fields: BTreeMap::new(),
            attachments: None,
        }
    }
}

/// Point-in-time copy of a volume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub name: String,
    pub volume_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    pub status: String,
}

// =============================================================================
// Host Mount State
// =============================================================================

/// One row of the host mount table
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MountInfo {
    pub id: u32,
    pub parent: u32,
    pub major: u32,
    pub minor: u32,
    pub root: String,
    pub mount_point: String,
    pub opts: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub optional: String,
    pub fs_type: String,
    pub source: String,
    pub vfs_opts: String,
}

/// Snapshot of the host device -> mount point mapping
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LocalDevices {
    /// Name of the driver that produced the snapshot
    pub driver: String,
    /// Source device/export -> mount point
    pub device_map: BTreeMap<String, String>,
}

impl LocalDevices {
    pub fn from_mounts(driver: impl Into<String>, mounts: &[MountInfo]) -> Self {
        let device_map = mounts
            .iter()
            .map(|m| (m.source.clone(), m.mount_point.clone()))
            .collect();
        Self {
            driver: driver.into(),
            device_map,
        }
    }

    pub fn mount_point(&self, device: &str) -> Option<&str> {
        self.device_map.get(device).map(String::as_str)
    }
}

// =============================================================================
// Operation Options
// =============================================================================

/// Options for listing volumes
#[derive(Debug, Clone, Default)]
pub struct VolumesOpts {
    /// Compute attachments (may cost an extra backend call per volume)
    pub attachments: bool,
    /// Host device map used to derive attachment status
    pub local_devices: Option<LocalDevices>,
}

/// Options for inspecting one volume
#[derive(Debug, Clone, Default)]
pub struct VolumeInspectOpts {
    pub attachments: bool,
    pub local_devices: Option<LocalDevices>,
}

impl VolumeInspectOpts {
    pub fn with_attachments(local_devices: Option<LocalDevices>) -> Self {
        Self {
            attachments: true,
            local_devices,
        }
    }
}

impl From<&VolumesOpts> for VolumeInspectOpts {
    fn from(opts: &VolumesOpts) -> Self {
        Self {
            attachments: opts.attachments,
            local_devices: opts.local_devices.clone(),
        }
    }
}

/// Options for creating a volume
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeCreateOpts {
    pub size: Option<u64>,
    pub availability_zone: Option<String>,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

/// Options for attaching a volume
#[derive(Debug, Clone, Default)]
pub struct VolumeAttachOpts {
    pub next_device: Option<String>,
    /// Caller identity as reported by the backend's executor
    pub instance_id: Option<InstanceId>,
    pub force: bool,
    pub local_devices: Option<LocalDevices>,
}

/// Options for detaching a volume
#[derive(Debug, Clone, Default)]
pub struct VolumeDetachOpts {
    pub force: bool,
    pub local_devices: Option<LocalDevices>,
}

/// Options for mounting a device
#[derive(Debug, Clone, Default)]
pub struct DeviceMountOpts {
    pub mount_options: String,
    pub mount_label: String,
}

/// Options for formatting a device
#[derive(Debug, Clone)]
pub struct DeviceFormatOpts {
    pub new_fs_type: String,
    pub overwrite: bool,
}

impl Default for DeviceFormatOpts {
    fn default() -> Self {
        Self {
            new_fs_type: "ext4".to_string(),
            overwrite: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_type_display() {
        assert_eq!(format!("{}", StorageType::Block), "block");
        assert_eq!(format!("{}", StorageType::Nas), "nas");
        assert_eq!(format!("{}", StorageType::Object), "object");
        assert_eq!(format!("{}", StorageType::Unknown), "unknown");
    }

    #[test]
    fn test_attachment_status_strings() {
        assert_eq!(AttachmentStatus::Exported.as_str(), "Exported");
        assert_eq!(
            AttachmentStatus::ExportedMounted.to_string(),
            "Exported and Mounted"
        );
        let json = serde_json::to_string(&AttachmentStatus::ExportedUnmounted).unwrap();
        assert_eq!(json, "\"Exported and Unmounted\"");
    }

    #[test]
    fn test_instance_metadata_roundtrip() {
        let mut iid = InstanceId::new("", "efs");
        iid.marshal_metadata(&"subnet-1234").unwrap();
        let subnet: Option<String> = iid.unmarshal_metadata().unwrap();
        assert_eq!(subnet.as_deref(), Some("subnet-1234"));

        let empty = InstanceId::new("us-east-1", "objectivefs");
        let none: Option<String> = empty.unmarshal_metadata().unwrap();
        assert!(none.is_none());
    }

    #[test]
    fn test_volume_attachments_absent_vs_empty() {
        let mut vol = Volume::new("data", "data", StorageType::Nas);
        let json = serde_json::to_value(&vol).unwrap();
        assert!(json.get("attachments").is_none());

        vol.attachments = Some(Vec::new());
        let json = serde_json::to_value(&vol).unwrap();
        assert_eq!(json["attachments"], serde_json::json!([]));
    }

    #[test]
    fn test_local_devices_from_mounts() {
        let mounts = vec![MountInfo {
            source: "host:/export".into(),
            mount_point: "/mnt/export".into(),
            ..Default::default()
        }];
        let ld = LocalDevices::from_mounts("efs", &mounts);
        assert_eq!(ld.driver, "efs");
        assert_eq!(ld.mount_point("host:/export"), Some("/mnt/export"));
        assert_eq!(ld.mount_point("other:/"), None);
    }
}
