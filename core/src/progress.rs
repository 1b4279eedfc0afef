use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Progress update for one device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProgressEvent {
    pub device: String,
    pub percentage: u8,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_devices: Option<usize>,
}

/// Per-device progress sink.
///
/// Executors report in their own 0-100 scale; the reporter maps that onto
/// its window of the overall operation, clamps it, and never lets the
/// published value go backwards.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    device: String,
    total_devices: Option<usize>,
    sender: Option<mpsc::UnboundedSender<ProgressEvent>>,
    current: Arc<AtomicU8>,
    start: u8,
    end: u8,
}

impl ProgressReporter {
    pub fn new(
        device: impl Into<String>,
        total_devices: Option<usize>,
        sender: mpsc::UnboundedSender<ProgressEvent>,
        current: Arc<AtomicU8>,
    ) -> Self {
        Self {
            device: device.into(),
            total_devices,
            sender: Some(sender),
            current,
            start: 0,
            end: 100,
        }
    }

    /// A reporter that only tracks the current value.
    pub fn detached(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            total_devices: None,
            sender: None,
            current: Arc::new(AtomicU8::new(0)),
            start: 0,
            end: 100,
        }
    }

    /// Reporter for a sub-step that owns `start..=end` of this reporter's range.
    pub fn window(&self, start: u8, end: u8) -> Self {
        let span = u32::from(self.end - self.start);
        let map = |p: u8| self.start + (u32::from(p.min(100)) * span / 100) as u8;
        Self {
            device: self.device.clone(),
            total_devices: self.total_devices,
            sender: self.sender.clone(),
            current: self.current.clone(),
            start: map(start),
            end: map(end.max(start)),
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    /// Last published overall percentage.
    pub fn current(&self) -> u8 {
        self.current.load(Ordering::SeqCst)
    }

    /// Publish `percentage` (0-100 in this reporter's scale).
    pub fn report(&self, percentage: u8, status: impl Into<String>) {
        let span = u32::from(self.end - self.start);
        let mapped = self.start + (u32::from(percentage.min(100)) * span / 100) as u8;

        // fetch_max keeps the shared value monotonic across windows.
        let previous = self.current.fetch_max(mapped, Ordering::SeqCst);
        let published = previous.max(mapped);

        if let Some(sender) = &self.sender {
            let event = ProgressEvent {
                device: self.device.clone(),
                percentage: published,
                status: status.into(),
                total_devices: self.total_devices,
            };
            if sender.send(event).is_err() {
                tracing::trace!("Progress receiver for {} dropped", self.device);
            }
        }
    }
}
