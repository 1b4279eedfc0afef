//! Safety gate for destructive operations.
//!
//! Every request passes through [`SafetyValidator::validate`] before any
//! command is run against the device. Checks run in a fixed order and the
//! first failure wins. Whenever a probe cannot answer, the device is
//! treated as unsafe.

use crate::config::EngineConfig;
use crate::device::base_device;
use crate::request::{Filesystem, OperationRequest};
use crate::{EngineError, SystemProbe};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SafetyVerdict {
    pub safe: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl SafetyVerdict {
    pub fn safe() -> Self {
        Self { safe: true, reason: None }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            safe: false,
            reason: Some(reason.into()),
        }
    }
}

pub struct SafetyValidator {
    probe: Arc<dyn SystemProbe>,
    protected_mountpoints: Vec<PathBuf>,
}

impl SafetyValidator {
    pub fn new(probe: Arc<dyn SystemProbe>, config: &EngineConfig) -> Self {
        Self {
            probe,
            protected_mountpoints: config.protected_mountpoints.iter().map(PathBuf::from).collect(),
        }
    }

    pub async fn validate(&self, request: &OperationRequest) -> SafetyVerdict {
        let verdict = self.run_checks(request).await;
        match &verdict.reason {
            Some(reason) => tracing::warn!("Rejected {}: {}", request.device, reason),
            None => tracing::debug!("{} passed safety checks", request.device),
        }
        verdict
    }

    async fn run_checks(&self, request: &OperationRequest) -> SafetyVerdict {
        let device = request.device.trim();
        let action = if request.is_wipe() { "wipe" } else { "format" };

        if device.is_empty() {
            return SafetyVerdict::rejected("No device specified");
        }

        if let Some(target) = request.format_target() {
            if target.filesystem.trim().is_empty() {
                return SafetyVerdict::rejected("No filesystem specified");
            }
            if let Err(e) = target.filesystem.parse::<Filesystem>() {
                return SafetyVerdict::rejected(e.to_string());
            }
        }

        match self.probe.device_exists(device).await {
            Ok(true) => {}
            Ok(false) => return SafetyVerdict::rejected(format!("Device {} does not exist", device)),
            Err(e) => return undetermined(device, "exists", e),
        }

        match self.probe.is_mounted(device).await {
            Ok(false) => {}
            Ok(true) => {
                return SafetyVerdict::rejected(format!(
                    "Device {} is currently mounted. Please unmount before {}.",
                    device,
                    if request.is_wipe() { "wiping" } else { "formatting" }
                ))
            }
            Err(e) => return undetermined(device, "is mounted", e),
        }

        match self.is_boot_device(device).await {
            Ok(false) => {}
            Ok(true) => return SafetyVerdict::rejected(format!("Cannot {} boot device {}", action, device)),
            Err(e) => return undetermined(device, "is the boot device", e),
        }

        // Formatting keeps the boot check above but skips this one.
        if request.is_wipe() {
            match self.probe.mountpoints(device).await {
                Ok(mounts) => {
                    if let Some(mount) = mounts.iter().find(|m| self.is_protected(m)) {
                        return SafetyVerdict::rejected(format!(
                            "Device {} appears to be a system disk (carries {})",
                            device,
                            mount.display()
                        ));
                    }
                }
                Err(e) => return undetermined(device, "carries system mountpoints", e),
            }
        }

        SafetyVerdict::safe()
    }

    async fn is_boot_device(&self, device: &str) -> Result<bool, EngineError> {
        let root = self.probe.root_device().await?;
        Ok(base_device(&root) == base_device(device))
    }

    /// Device hosting the root filesystem, with its partition suffix removed.
    pub async fn boot_device(&self) -> Result<String, EngineError> {
        let root = self.probe.root_device().await?;
        Ok(base_device(&root).to_string())
    }

    fn is_protected(&self, mount: &Path) -> bool {
        self.protected_mountpoints.iter().any(|protected| {
            if protected.as_path() == Path::new("/") {
                mount == protected.as_path()
            } else {
                mount.starts_with(protected)
            }
        })
    }
}

fn undetermined(device: &str, question: &str, error: EngineError) -> SafetyVerdict {
    SafetyVerdict::rejected(format!(
        "Unable to determine whether {} {}: {}",
        device, question, error
    ))
}
