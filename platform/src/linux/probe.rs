use std::collections::HashSet;
use std::fs;
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use wipekit_core::device::base_device;
use wipekit_core::{EngineError, SystemProbe};

/// One line of `/proc/mounts`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub source: String,
    pub target: PathBuf,
}

/// Parse `/proc/mounts` contents. Octal escapes (`\040` for a space) in
/// either column are decoded.
pub fn parse_mounts(contents: &str) -> Vec<MountEntry> {
    contents
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let source = fields.next()?;
            let target = fields.next()?;
            Some(MountEntry {
                source: unescape(source),
                target: PathBuf::from(unescape(target)),
            })
        })
        .collect()
}

fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let code = digits.iter().fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
                if let Ok(byte) = u8::try_from(code) {
                    out.push(byte);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// System queries answered from procfs and sysfs.
#[derive(Debug, Clone)]
pub struct LinuxProbe {
    mounts: PathBuf,
    sys_block: PathBuf,
    blockdev: String,
}

impl Default for LinuxProbe {
    fn default() -> Self {
        Self {
            mounts: PathBuf::from("/proc/mounts"),
            sys_block: PathBuf::from("/sys/class/block"),
            blockdev: "blockdev".to_string(),
        }
    }
}

impl LinuxProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read mount and size information from other locations.
    pub fn with_paths(mounts: impl Into<PathBuf>, sys_block: impl Into<PathBuf>) -> Self {
        Self {
            mounts: mounts.into(),
            sys_block: sys_block.into(),
            ..Self::default()
        }
    }

    fn mount_table(&self) -> Result<Vec<MountEntry>, EngineError> {
        let contents = fs::read_to_string(&self.mounts)
            .map_err(|e| EngineError::Probe(format!("Failed to read {}: {}", self.mounts.display(), e)))?;
        Ok(parse_mounts(&contents))
    }

    /// Mount entries backed by `device` or one of its partitions, including
    /// mounts of device-mapper volumes (LVM, LUKS) stacked on top of it.
    fn entries_for(&self, device: &str) -> Result<Vec<MountEntry>, EngineError> {
        let device = canonical(device);
        Ok(self
            .mount_table()?
            .into_iter()
            .filter(|entry| {
                if !entry.source.starts_with("/dev/") {
                    return false;
                }
                self.backing_devices(&entry.source)
                    .iter()
                    .any(|source| *source == device || base_device(source) == device)
            })
            .collect())
    }

    /// Kernel name (`sda1`, `dm-0`) of a device node. `/dev/mapper/<name>`
    /// paths that do not resolve are looked up through `dm/name`.
    fn kernel_name(&self, device: &str) -> Option<String> {
        let resolved = canonical(device);
        let name = Path::new(&resolved).file_name()?.to_string_lossy().into_owned();
        if self.sys_block.join(&name).exists() {
            return Some(name);
        }
        if !resolved.starts_with("/dev/mapper/") {
            return None;
        }
        fs::read_dir(&self.sys_block).ok()?.flatten().find_map(|entry| {
            let dm_name = fs::read_to_string(entry.path().join("dm").join("name")).ok()?;
            (dm_name.trim() == name).then(|| entry.file_name().to_string_lossy().into_owned())
        })
    }

    fn slaves(&self, name: &str) -> Vec<String> {
        fs::read_dir(self.sys_block.join(name).join("slaves"))
            .map(|entries| {
                entries
                    .flatten()
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn is_stacked(&self, device: &str) -> bool {
        self.kernel_name(device)
            .map(|name| !self.slaves(&name).is_empty())
            .unwrap_or(false)
    }

    /// `device` followed by every device below it, found by walking
    /// `slaves/` in sysfs.
    fn backing_devices(&self, device: &str) -> Vec<String> {
        let mut found = vec![canonical(device)];
        let mut pending: Vec<String> = self.kernel_name(device).into_iter().collect();
        let mut seen = HashSet::new();

        while let Some(name) = pending.pop() {
            if !seen.insert(name.clone()) {
                continue;
            }
            let node = format!("/dev/{}", name);
            if !found.contains(&node) {
                found.push(node);
            }
            pending.extend(self.slaves(&name));
        }
        found
    }

    fn sysfs_size(&self, device: &str) -> Option<u64> {
        let name = Path::new(device).file_name()?.to_string_lossy().to_string();
        let sectors = fs::read_to_string(self.sys_block.join(&name).join("size")).ok()?;
        sectors.trim().parse::<u64>().ok().map(|s| s * 512)
    }

    fn blockdev_size(&self, device: &str) -> Result<u64, EngineError> {
        let output = Command::new(&self.blockdev)
            .args(["--getsize64", device])
            .output()
            .map_err(|e| EngineError::Probe(format!("Failed to run blockdev: {}", e)))?;
        if !output.status.success() {
            return Err(EngineError::Probe(format!(
                "blockdev --getsize64 {} failed: {}",
                device,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        String::from_utf8_lossy(&output.stdout)
            .trim()
            .parse::<u64>()
            .map_err(|e| EngineError::Probe(format!("Unexpected blockdev output for {}: {}", device, e)))
    }
}

/// Resolve symlinks such as `/dev/disk/by-id/...` or `/dev/mapper/...`;
/// paths that cannot be resolved are used as given.
fn canonical(device: &str) -> String {
    fs::canonicalize(device)
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| device.to_string())
}

#[async_trait::async_trait]
impl SystemProbe for LinuxProbe {
    async fn device_exists(&self, device: &str) -> Result<bool, EngineError> {
        match fs::metadata(device) {
            Ok(metadata) => Ok(metadata.file_type().is_block_device()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(EngineError::Probe(format!("Failed to stat {}: {}", device, e))),
        }
    }

    async fn is_mounted(&self, device: &str) -> Result<bool, EngineError> {
        Ok(!self.entries_for(device)?.is_empty())
    }

    async fn mountpoints(&self, device: &str) -> Result<Vec<PathBuf>, EngineError> {
        Ok(self.entries_for(device)?.into_iter().map(|e| e.target).collect())
    }

    async fn root_device(&self) -> Result<String, EngineError> {
        let root = self
            .mount_table()?
            .into_iter()
            .rev()
            .find(|entry| entry.target == Path::new("/"))
            .ok_or_else(|| EngineError::Probe("No mount entry for /".to_string()))?;

        if !root.source.starts_with("/dev/") {
            return Err(EngineError::Probe(format!(
                "Root filesystem is not backed by a block device ({})",
                root.source
            )));
        }
        let mapped = root.source.starts_with("/dev/mapper/") || root.source.starts_with("/dev/dm-");
        if mapped && self.kernel_name(&root.source).is_none() {
            return Err(EngineError::Probe(format!(
                "Cannot resolve the devices behind {}",
                root.source
            )));
        }

        // First physical device under the root volume.
        let device = self
            .backing_devices(&root.source)
            .into_iter()
            .find(|d| !self.is_stacked(d))
            .ok_or_else(|| EngineError::Probe(format!("No physical device behind {}", root.source)))?;
        log::debug!("Root filesystem {} is on {}", root.source, device);
        Ok(device)
    }

    async fn device_size(&self, device: &str) -> Result<u64, EngineError> {
        if let Some(size) = self.sysfs_size(&canonical(device)) {
            return Ok(size);
        }
        log::debug!("No sysfs size for {}, asking blockdev", device);
        self.blockdev_size(device)
    }
}
