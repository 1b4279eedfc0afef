use serde::Deserialize;
use serde_json::Value;
use std::fs;
use std::path::PathBuf;
use std::process::Command;
use wipekit_core::{
    DeviceDescriptor, DeviceInfo, DeviceInventory, DeviceType, EngineError, Partition, PermissionLevel,
};

const LSBLK_COLUMNS: &str = "NAME,SIZE,TYPE,MODEL,MOUNTPOINT,RM,FSTYPE,LABEL";

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    #[serde(default)]
    blockdevices: Vec<LsblkEntry>,
}

/// One lsblk row. Older util-linux prints sizes and flags as strings,
/// newer versions as numbers and booleans.
#[derive(Debug, Deserialize)]
struct LsblkEntry {
    name: String,
    #[serde(default)]
    size: Value,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    mountpoint: Option<String>,
    #[serde(default)]
    rm: Value,
    #[serde(default)]
    fstype: Option<String>,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    children: Vec<LsblkEntry>,
}

impl LsblkEntry {
    fn path(&self) -> String {
        if self.name.starts_with('/') {
            self.name.clone()
        } else {
            format!("/dev/{}", self.name)
        }
    }

    fn size(&self) -> u64 {
        match &self.size {
            Value::Number(n) => n.as_u64().unwrap_or(0),
            Value::String(s) => s.trim().parse().unwrap_or(0),
            _ => 0,
        }
    }

    fn removable(&self) -> bool {
        match &self.rm {
            Value::Bool(b) => *b,
            Value::Number(n) => n.as_u64() == Some(1),
            Value::String(s) => s.trim() == "1",
            _ => false,
        }
    }

    fn mount_points(&self) -> Vec<PathBuf> {
        let mut mounts: Vec<PathBuf> = self
            .mountpoint
            .iter()
            .filter(|m| !m.is_empty())
            .map(PathBuf::from)
            .collect();
        for child in &self.children {
            mounts.extend(child.mount_points());
        }
        mounts
    }

    fn partitions(&self) -> Vec<Partition> {
        self.children
            .iter()
            .filter(|c| c.kind.as_deref() == Some("part"))
            .map(|c| Partition {
                id: c.path(),
                size: c.size(),
                filesystem: non_empty(&c.fstype),
                mount_point: c.mountpoint.as_ref().filter(|m| !m.is_empty()).map(PathBuf::from),
            })
            .collect()
    }

    fn descriptor(&self, rotational: Option<bool>) -> DeviceDescriptor {
        let name = self.name.trim_start_matches("/dev/").to_string();
        let model = non_empty(&self.model).unwrap_or_else(|| name.to_uppercase());
        let mount_points = self.mount_points();
        let is_removable = self.removable();

        DeviceDescriptor {
            id: self.path(),
            name: format!("{} ({})", model, name),
            size: self.size(),
            model,
            device_type: classify(&name, is_removable, rotational),
            mounted: !mount_points.is_empty(),
            mount_points,
            is_removable,
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_ref()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn classify(name: &str, removable: bool, rotational: Option<bool>) -> DeviceType {
    if name.starts_with("nvme") {
        return DeviceType::NVMe;
    }
    if name.starts_with("mmcblk") {
        return DeviceType::SDCard;
    }
    if ["loop", "ram", "zram", "nbd", "vd", "xvd"].iter().any(|p| name.starts_with(p)) {
        return DeviceType::Virtual;
    }
    if removable {
        return DeviceType::USB;
    }
    match rotational {
        Some(true) => DeviceType::HardDisk,
        Some(false) => DeviceType::SSD,
        None => DeviceType::Unknown,
    }
}

/// Whole disks from `lsblk -J` output. `rotational` answers the
/// HDD/SSD question for a kernel device name.
pub fn parse_lsblk<F>(json: &str, rotational: F) -> Result<Vec<DeviceDescriptor>, EngineError>
where
    F: Fn(&str) -> Option<bool>,
{
    let output: LsblkOutput = serde_json::from_str(json)?;
    let mut devices: Vec<DeviceDescriptor> = output
        .blockdevices
        .iter()
        .filter(|entry| entry.kind.as_deref() == Some("disk"))
        .map(|entry| entry.descriptor(rotational(entry.name.trim_start_matches("/dev/"))))
        .collect();

    // Removable first, then by name
    devices.sort_by(|a, b| b.is_removable.cmp(&a.is_removable).then_with(|| a.name.cmp(&b.name)));
    Ok(devices)
}

fn sysfs_rotational(name: &str) -> Option<bool> {
    fs::read_to_string(format!("/sys/block/{}/queue/rotational", name))
        .ok()
        .map(|content| content.trim() == "1")
}

/// Device inventory backed by `lsblk`.
#[derive(Debug, Clone)]
pub struct LinuxInventory {
    lsblk: String,
}

impl Default for LinuxInventory {
    fn default() -> Self {
        Self {
            lsblk: "lsblk".to_string(),
        }
    }
}

impl LinuxInventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different lsblk binary.
    pub fn with_lsblk(lsblk: impl Into<String>) -> Self {
        Self { lsblk: lsblk.into() }
    }

    fn run_lsblk(&self, device: Option<&str>) -> Result<String, EngineError> {
        let mut command = Command::new(&self.lsblk);
        command.args(["-J", "-b", "-o", LSBLK_COLUMNS]);
        if let Some(device) = device {
            command.arg(device);
        }

        let output = command
            .output()
            .map_err(|e| EngineError::Probe(format!("Failed to run lsblk: {}", e)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineError::Probe(format!("lsblk command failed: {}", stderr.trim())));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait::async_trait]
impl DeviceInventory for LinuxInventory {
    async fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, EngineError> {
        let json = self.run_lsblk(None)?;
        let devices = parse_lsblk(&json, sysfs_rotational)?;
        log::debug!("lsblk reported {} disk(s)", devices.len());
        Ok(devices)
    }

    async fn device_info(&self, device_id: &str) -> Result<DeviceInfo, EngineError> {
        let json = self.run_lsblk(Some(device_id))?;
        let output: LsblkOutput = serde_json::from_str(&json)?;
        let entry = output
            .blockdevices
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::Probe(format!("lsblk returned nothing for {}", device_id)))?;

        let name = entry.name.trim_start_matches("/dev/").to_string();
        Ok(DeviceInfo {
            device: entry.descriptor(sysfs_rotational(&name)),
            filesystem: non_empty(&entry.fstype),
            label: non_empty(&entry.label),
            partitions: entry.partitions(),
        })
    }

    async fn check_permissions(&self, device_id: &str) -> Result<PermissionLevel, EngineError> {
        if nix::unistd::geteuid().is_root() {
            return Ok(PermissionLevel::FullAccess);
        }

        // Members of the disk group can read devices but should not be
        // offered destructive operations.
        if let Ok(groups) = nix::unistd::getgroups() {
            let disk_gid = nix::unistd::Group::from_name("disk")
                .map_err(|e| EngineError::Probe(format!("Failed to get disk group: {}", e)))?
                .map(|g| g.gid);

            if let Some(gid) = disk_gid {
                if groups.contains(&gid) {
                    log::debug!("Not root but in the disk group; {} limited to simulation", device_id);
                    return Ok(PermissionLevel::Simulate);
                }
            }
        }

        Ok(PermissionLevel::ReadOnly)
    }
}
