/// Test utilities and mock implementations for safe testing
use crate::{EngineError, SystemProbe};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Mutex;

/// State of one fake block device.
#[derive(Clone, Debug, Default)]
pub struct MockDevice {
    pub size: u64,
    pub mounted: bool,
    pub mountpoints: Vec<PathBuf>,
}

/// In-memory probe - NEVER touches real hardware
#[derive(Debug, Default)]
pub struct MockProbe {
    devices: Mutex<HashMap<String, MockDevice>>,
    root_device: Option<String>,
    failing: HashSet<String>,
}

impl MockProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idle, unmounted device of `size` bytes.
    pub fn with_device(self, id: &str, size: u64) -> Self {
        self.with_state(id, MockDevice { size, ..Default::default() })
    }

    /// Device with a mounted partition.
    pub fn with_mounted(self, id: &str, size: u64, mountpoint: &str) -> Self {
        self.with_state(
            id,
            MockDevice {
                size,
                mounted: true,
                mountpoints: vec![PathBuf::from(mountpoint)],
            },
        )
    }

    /// Device that reports system mountpoints without being seen as mounted,
    /// the way a stale lsblk listing can.
    pub fn with_system_mounts(self, id: &str, size: u64, mountpoints: &[&str]) -> Self {
        self.with_state(
            id,
            MockDevice {
                size,
                mounted: false,
                mountpoints: mountpoints.iter().map(PathBuf::from).collect(),
            },
        )
    }

    pub fn with_state(self, id: &str, state: MockDevice) -> Self {
        self.devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.to_string(), state);
        self
    }

    pub fn with_root(mut self, root_device: &str) -> Self {
        self.root_device = Some(root_device.to_string());
        self
    }

    /// Every probe about `id` fails.
    pub fn with_failing(mut self, id: &str) -> Self {
        self.failing.insert(id.to_string());
        self
    }

    /// Add or replace a device after construction.
    pub fn insert(&self, id: &str, state: MockDevice) {
        self.devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.to_string(), state);
    }

    fn lookup(&self, id: &str) -> Result<Option<MockDevice>, EngineError> {
        if self.failing.contains(id) {
            return Err(EngineError::Probe(format!("probe for {} failed", id)));
        }
        Ok(self
            .devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned())
    }
}

#[async_trait::async_trait]
impl SystemProbe for MockProbe {
    async fn device_exists(&self, device: &str) -> Result<bool, EngineError> {
        Ok(self.lookup(device)?.is_some())
    }

    async fn is_mounted(&self, device: &str) -> Result<bool, EngineError> {
        Ok(self.lookup(device)?.map(|d| d.mounted).unwrap_or(false))
    }

    async fn mountpoints(&self, device: &str) -> Result<Vec<PathBuf>, EngineError> {
        Ok(self.lookup(device)?.map(|d| d.mountpoints).unwrap_or_default())
    }

    async fn root_device(&self) -> Result<String, EngineError> {
        self.root_device
            .clone()
            .ok_or_else(|| EngineError::Probe("root device unknown".to_string()))
    }

    async fn device_size(&self, device: &str) -> Result<u64, EngineError> {
        self.lookup(device)?
            .map(|d| d.size)
            .ok_or_else(|| EngineError::Probe(format!("{} not found", device)))
    }
}
