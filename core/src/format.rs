use crate::cancel::CancellationToken;
use crate::config::{EngineConfig, ToolPaths};
use crate::device::first_partition;
use crate::process::{CommandSpec, ProcessRunner};
use crate::progress::ProgressReporter;
use crate::request::Filesystem;
use crate::{EngineError, SystemProbe};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

const PARTITION_TABLE_MILESTONE: u8 = 10;
const PARTITION_MILESTONE: u8 = 30;
const FILESYSTEM_MILESTONE: u8 = 50;
const POLL_STEP: u8 = 5;
const POLL_CEILING: u8 = 95;
const SETTLE_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FormatStage {
    PartitionTable,
    Partition,
    Filesystem,
}

impl fmt::Display for FormatStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormatStage::PartitionTable => write!(f, "creating partition table"),
            FormatStage::Partition => write!(f, "creating partition"),
            FormatStage::Filesystem => write!(f, "creating filesystem"),
        }
    }
}

/// Command that creates `filesystem` on `partition`.
pub fn filesystem_command(
    tools: &ToolPaths,
    filesystem: Filesystem,
    partition: &str,
    label: Option<&str>,
) -> CommandSpec {
    let label = label.filter(|l| !l.is_empty());
    let (program, mut args, label_flag) = match filesystem {
        Filesystem::Ext4 => (&tools.mkfs_ext4, vec!["-F".to_string(), partition.to_string()], "-L"),
        Filesystem::Ntfs => (&tools.mkfs_ntfs, vec!["-f".to_string(), partition.to_string()], "-L"),
        Filesystem::Fat32 => (
            &tools.mkfs_fat,
            vec!["-F".to_string(), "32".to_string(), partition.to_string()],
            "-n",
        ),
        Filesystem::Exfat => (&tools.mkfs_exfat, vec![partition.to_string()], "-n"),
    };

    if let Some(label) = label {
        args.push(label_flag.to_string());
        args.push(label.to_string());
    }

    CommandSpec::new(program.as_str(), args)
}

/// Partition table → single partition → filesystem.
pub struct FormatPipeline {
    runner: ProcessRunner,
    probe: Arc<dyn SystemProbe>,
    tools: ToolPaths,
    partition_table: String,
    poll_interval: Duration,
    settle_timeout: Duration,
}

impl FormatPipeline {
    pub fn new(runner: ProcessRunner, probe: Arc<dyn SystemProbe>, config: &EngineConfig) -> Self {
        Self {
            runner,
            probe,
            tools: config.tools.clone(),
            partition_table: config.partition_table.clone(),
            poll_interval: config.format_poll_interval(),
            settle_timeout: config.partition_settle_timeout(),
        }
    }

    /// The commands [`execute`](Self::execute) would run, in order.
    pub fn commands(
        &self,
        device: &str,
        filesystem: Filesystem,
        label: Option<&str>,
    ) -> Vec<(FormatStage, CommandSpec)> {
        vec![
            (
                FormatStage::PartitionTable,
                CommandSpec::new(
                    self.tools.parted.as_str(),
                    vec![
                        device.to_string(),
                        "--script".to_string(),
                        "mklabel".to_string(),
                        self.partition_table.clone(),
                    ],
                ),
            ),
            (
                FormatStage::Partition,
                CommandSpec::new(
                    self.tools.parted.as_str(),
                    ["--script", "mkpart", "primary", "0%", "100%"]
                        .iter()
                        .fold(vec![device.to_string()], |mut args, a| {
                            args.push(a.to_string());
                            args
                        }),
                ),
            ),
            (
                FormatStage::Filesystem,
                filesystem_command(&self.tools, filesystem, &first_partition(device), label),
            ),
        ]
    }

    pub async fn execute(
        &self,
        device: &str,
        filesystem: &str,
        label: Option<&str>,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<String, EngineError> {
        // Normally rejected during validation already.
        let filesystem: Filesystem = filesystem.parse()?;
        let partition = first_partition(device);
        tracing::info!("Formatting {} as {}", device, filesystem);

        for (stage, command) in self.commands(device, filesystem, label) {
            if cancel.is_cancelled() {
                tracing::info!("Format of {} cancelled before {}", device, stage);
                return Err(EngineError::Cancelled);
            }

            let result = match stage {
                FormatStage::PartitionTable => {
                    progress.report(PARTITION_TABLE_MILESTONE, "Creating partition table...");
                    self.runner.run(&command, |_| {}, cancel).await.map(|_| ())
                }
                FormatStage::Partition => {
                    progress.report(PARTITION_MILESTONE, "Creating partition...");
                    self.runner.run(&command, |_| {}, cancel).await.map(|_| ())
                }
                FormatStage::Filesystem => {
                    progress.report(FILESYSTEM_MILESTONE, format!("Formatting as {}...", filesystem));
                    self.wait_for_partition(&partition, cancel).await?;
                    self.run_polled(&command, filesystem, progress, cancel).await
                }
            };

            match result {
                Ok(()) => tracing::debug!("{} on {} done", stage, device),
                Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
                Err(e) => {
                    tracing::error!("Format of {} failed while {}: {}", device, stage, e);
                    return Err(EngineError::StageFailed {
                        stage,
                        source: Box::new(e),
                    });
                }
            }
        }

        progress.report(100, "Format completed successfully");
        Ok(match label.filter(|l| !l.is_empty()) {
            Some(label) => format!(
                "Successfully formatted {} as {} with label \"{}\"",
                device, filesystem, label
            ),
            None => format!("Successfully formatted {} as {}", device, filesystem),
        })
    }

    /// The partition node shows up asynchronously after parted returns.
    async fn wait_for_partition(&self, partition: &str, cancel: &CancellationToken) -> Result<(), EngineError> {
        let deadline = tokio::time::Instant::now() + self.settle_timeout;
        loop {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            // A failing probe is not fatal here; mkfs reports a missing node itself.
            if self.probe.device_exists(partition).await.unwrap_or(false) {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!("{} did not appear within {:?}", partition, self.settle_timeout);
                return Ok(());
            }
            tokio::time::sleep(SETTLE_POLL).await;
        }
    }

    /// mkfs reports nothing byte-accurate, so progress advances on a timer.
    async fn run_polled(
        &self,
        command: &CommandSpec,
        filesystem: Filesystem,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let run = self.runner.run(command, |_| {}, cancel);
        tokio::pin!(run);

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.tick().await;
        let mut current = FILESYSTEM_MILESTONE;

        loop {
            tokio::select! {
                result = &mut run => return result.map(|_| ()),
                _ = ticker.tick() => {
                    if current < POLL_CEILING {
                        current = (current + POLL_STEP).min(POLL_CEILING);
                        progress.report(current, format!("Formatting {}... {}%", filesystem, current));
                    }
                }
            }
        }
    }
}
