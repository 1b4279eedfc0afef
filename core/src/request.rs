use crate::EngineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A destructive operation requested for one device.
///
/// Method and filesystem names stay as strings here; they are parsed when
/// the request is validated and planned so that bad input is reported
/// against the device it was meant for.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OperationRequest {
    pub device: String,
    #[serde(flatten)]
    pub kind: OperationKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum OperationKind {
    Wipe {
        method: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        then_format: Option<FormatTarget>,
    },
    Format(FormatTarget),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FormatTarget {
    pub filesystem: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl OperationRequest {
    pub fn wipe(device: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            kind: OperationKind::Wipe {
                method: method.into(),
                then_format: None,
            },
        }
    }

    pub fn wipe_then_format(
        device: impl Into<String>,
        method: impl Into<String>,
        filesystem: impl Into<String>,
        label: Option<String>,
    ) -> Self {
        Self {
            device: device.into(),
            kind: OperationKind::Wipe {
                method: method.into(),
                then_format: Some(FormatTarget {
                    filesystem: filesystem.into(),
                    label,
                }),
            },
        }
    }

    pub fn format(
        device: impl Into<String>,
        filesystem: impl Into<String>,
        label: Option<String>,
    ) -> Self {
        Self {
            device: device.into(),
            kind: OperationKind::Format(FormatTarget {
                filesystem: filesystem.into(),
                label,
            }),
        }
    }

    pub fn is_wipe(&self) -> bool {
        matches!(self.kind, OperationKind::Wipe { .. })
    }

    /// The filesystem to create, for a format or a wipe-then-format.
    pub fn format_target(&self) -> Option<&FormatTarget> {
        match &self.kind {
            OperationKind::Wipe { then_format, .. } => then_format.as_ref(),
            OperationKind::Format(target) => Some(target),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WipeMethod {
    Zero,
    Random,
    Dod,
    Gutmann,
}

impl WipeMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            WipeMethod::Zero => "zero",
            WipeMethod::Random => "random",
            WipeMethod::Dod => "dod",
            WipeMethod::Gutmann => "gutmann",
        }
    }

    pub fn all() -> [WipeMethod; 4] {
        [WipeMethod::Zero, WipeMethod::Random, WipeMethod::Dod, WipeMethod::Gutmann]
    }
}

impl FromStr for WipeMethod {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "zero" => Ok(WipeMethod::Zero),
            "random" => Ok(WipeMethod::Random),
            "dod" => Ok(WipeMethod::Dod),
            "gutmann" => Ok(WipeMethod::Gutmann),
            _ => Err(EngineError::UnknownMethod(s.to_string())),
        }
    }
}

impl fmt::Display for WipeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Filesystem {
    Ext4,
    Ntfs,
    Fat32,
    Exfat,
}

impl Filesystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            Filesystem::Ext4 => "ext4",
            Filesystem::Ntfs => "ntfs",
            Filesystem::Fat32 => "fat32",
            Filesystem::Exfat => "exfat",
        }
    }

    pub fn all() -> [Filesystem; 4] {
        [Filesystem::Ext4, Filesystem::Ntfs, Filesystem::Fat32, Filesystem::Exfat]
    }
}

impl FromStr for Filesystem {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ext4" => Ok(Filesystem::Ext4),
            "ntfs" => Ok(Filesystem::Ntfs),
            "fat32" => Ok(Filesystem::Fat32),
            "exfat" => Ok(Filesystem::Exfat),
            _ => Err(EngineError::UnsupportedFilesystem(s.to_string())),
        }
    }
}

impl fmt::Display for Filesystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal state of one device's operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum Outcome {
    Success { details: String },
    Error { reason: String },
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationResult {
    pub device: String,
    #[serde(flatten)]
    pub outcome: Outcome,
    pub finished_at: DateTime<Utc>,
}

impl OperationResult {
    pub fn success(device: impl Into<String>, details: impl Into<String>) -> Self {
        Self::new(device, Outcome::Success { details: details.into() })
    }

    pub fn error(device: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(device, Outcome::Error { reason: reason.into() })
    }

    pub fn cancelled(device: impl Into<String>) -> Self {
        Self::new(device, Outcome::Cancelled)
    }

    /// Convert an execution result, keeping cancellation apart from errors.
    pub fn from_execution(device: impl Into<String>, result: Result<String, EngineError>) -> Self {
        match result {
            Ok(details) => Self::success(device, details),
            Err(e) if e.is_cancelled() => Self::cancelled(device),
            Err(e) => Self::error(device, e.to_string()),
        }
    }

    fn new(device: impl Into<String>, outcome: Outcome) -> Self {
        Self {
            device: device.into(),
            outcome,
            finished_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.outcome, Outcome::Cancelled)
    }

    pub fn reason(&self) -> Option<&str> {
        match &self.outcome {
            Outcome::Error { reason } => Some(reason),
            _ => None,
        }
    }
}
