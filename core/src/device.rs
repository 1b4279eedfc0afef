use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Snapshot of a block device as reported by the inventory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub model: String,
    pub device_type: DeviceType,
    pub mounted: bool,
    pub mount_points: Vec<PathBuf>,
    pub is_removable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeviceType {
    HardDisk,
    SSD,
    USB,
    SDCard,
    NVMe,
    Virtual,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device: DeviceDescriptor,
    pub filesystem: Option<String>,
    pub label: Option<String>,
    pub partitions: Vec<Partition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Partition {
    pub id: String,
    pub size: u64,
    pub filesystem: Option<String>,
    pub mount_point: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PermissionLevel {
    ReadOnly,
    Simulate,
    FullAccess,
}

/// Lists block devices. Implemented per platform.
#[async_trait::async_trait]
pub trait DeviceInventory: Send + Sync {
    async fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, crate::EngineError>;
    async fn device_info(&self, device_id: &str) -> Result<DeviceInfo, crate::EngineError>;
    async fn check_permissions(&self, device_id: &str) -> Result<PermissionLevel, crate::EngineError>;
}

/// Small system queries the safety validator and executors depend on.
///
/// Every method may fail; callers that gate destructive work treat a
/// failure as "unsafe".
#[async_trait::async_trait]
pub trait SystemProbe: Send + Sync {
    /// Whether `device` names an existing block device.
    async fn device_exists(&self, device: &str) -> Result<bool, crate::EngineError>;

    /// Whether the device or any of its partitions is mounted.
    async fn is_mounted(&self, device: &str) -> Result<bool, crate::EngineError>;

    /// Mountpoints of the device and all of its partitions.
    async fn mountpoints(&self, device: &str) -> Result<Vec<PathBuf>, crate::EngineError>;

    /// Device node backing the root filesystem, e.g. `/dev/sda2`. A root on
    /// LVM or LUKS reports the physical device underneath.
    async fn root_device(&self) -> Result<String, crate::EngineError>;

    /// Total size of the device in bytes.
    async fn device_size(&self, device: &str) -> Result<u64, crate::EngineError>;
}

/// Strip a trailing partition suffix from a device path.
///
/// `sda1` becomes `sda`. Devices whose whole-disk name already ends in a
/// digit (`nvme0n1`, `mmcblk0`, `loop0`) name partitions with a `p`
/// separator, so only a `p<N>` suffix is removed from those.
pub fn base_device(device: &str) -> &str {
    let name_start = device.rfind('/').map(|i| i + 1).unwrap_or(0);
    let name = &device[name_start..];

    if uses_p_separator(name) {
        if let Some(pos) = name.rfind('p') {
            let suffix = &name[pos + 1..];
            let before = &name[..pos];
            if !suffix.is_empty()
                && suffix.chars().all(|c| c.is_ascii_digit())
                && before.ends_with(|c: char| c.is_ascii_digit())
            {
                return &device[..name_start + pos];
            }
        }
        return device;
    }

    device.trim_end_matches(|c: char| c.is_ascii_digit())
}

/// Path of the first partition on `device`.
pub fn first_partition(device: &str) -> String {
    if device.ends_with(|c: char| c.is_ascii_digit()) {
        format!("{}p1", device)
    } else {
        format!("{}1", device)
    }
}

fn uses_p_separator(name: &str) -> bool {
    ["nvme", "mmcblk", "loop", "nbd", "md"]
        .iter()
        .any(|prefix| name.starts_with(prefix))
}
