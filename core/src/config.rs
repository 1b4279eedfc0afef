//! Engine configuration.
//!
//! Every field has a default so a partial JSON file (or none at all) is
//! enough. The default location is `<config dir>/wipekit/config.json`.

use crate::EngineError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Devices processed at the same time; further requests queue.
    pub max_concurrent: usize,
    pub tools: ToolPaths,
    /// `bs=` argument handed to the overwrite utility.
    pub block_size: String,
    pub zero_source: String,
    pub random_source: String,
    /// Label type passed to `parted mklabel`.
    pub partition_table: String,
    /// Mountpoints that mark a device as a system disk.
    pub protected_mountpoints: Vec<String>,
    pub exit_policy: ExitPolicy,
    pub format_poll_interval_ms: u64,
    pub terminate_grace_ms: u64,
    pub partition_settle_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 8,
            tools: ToolPaths::default(),
            block_size: "1M".to_string(),
            zero_source: "/dev/zero".to_string(),
            random_source: "/dev/urandom".to_string(),
            partition_table: "gpt".to_string(),
            protected_mountpoints: ["/", "/boot", "/boot/efi", "/root", "/usr", "/var"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            exit_policy: ExitPolicy::default(),
            format_poll_interval_ms: 1000,
            terminate_grace_ms: 5000,
            partition_settle_timeout_ms: 5000,
        }
    }
}

/// External programs the engine delegates to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPaths {
    pub dd: String,
    pub parted: String,
    pub mkfs_ext4: String,
    pub mkfs_ntfs: String,
    pub mkfs_fat: String,
    pub mkfs_exfat: String,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            dd: "dd".to_string(),
            parted: "parted".to_string(),
            mkfs_ext4: "mkfs.ext4".to_string(),
            mkfs_ntfs: "mkfs.ntfs".to_string(),
            mkfs_fat: "mkfs.fat".to_string(),
            mkfs_exfat: "mkfs.exfat".to_string(),
        }
    }
}

/// How process exit statuses are classified.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExitPolicy {
    /// A full-device write ends with the writer running off the end of the
    /// device. When set, that exit counts as success.
    pub out_of_space: Option<OutOfSpaceRule>,
}

impl Default for ExitPolicy {
    fn default() -> Self {
        Self {
            out_of_space: Some(OutOfSpaceRule::default()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutOfSpaceRule {
    pub exit_code: i32,
    /// Substring searched for in the process diagnostics.
    pub marker: String,
}

impl Default for OutOfSpaceRule {
    fn default() -> Self {
        Self {
            exit_code: 1,
            marker: "No space left on device".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn format_poll_interval(&self) -> Duration {
        Duration::from_millis(self.format_poll_interval_ms)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }

    pub fn partition_settle_timeout(&self) -> Duration {
        Duration::from_millis(self.partition_settle_timeout_ms)
    }

    /// Default config file location, if the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("wipekit").join("config.json"))
    }

    /// Load from `path`, or from the default location when `None`.
    ///
    /// A missing file yields the defaults; a file that exists but cannot be
    /// read or parsed is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, EngineError> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match Self::default_path() {
                Some(p) => p,
                None => return Ok(Self::default()),
            },
        };

        if !path.exists() {
            tracing::debug!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(&path).map_err(|e| {
            EngineError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config = Self::from_json(&contents)
            .map_err(|e| EngineError::Config(format!("{}: {}", path.display(), e)))?;

        tracing::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_json(contents: &str) -> Result<Self, EngineError> {
        let config: Self = serde_json::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.max_concurrent == 0 {
            return Err(EngineError::Config(
                "max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.block_size.trim().is_empty() {
            return Err(EngineError::Config("block_size must not be empty".to_string()));
        }
        // A zero tick period panics the format poller, and a zero grace
        // drops output a process wrote just before exiting.
        for (field, value) in [
            ("format_poll_interval_ms", self.format_poll_interval_ms),
            ("terminate_grace_ms", self.terminate_grace_ms),
        ] {
            if value == 0 {
                return Err(EngineError::Config(format!("{} must be at least 1", field)));
            }
        }
        Ok(())
    }
}
