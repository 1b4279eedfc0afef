//! Supervision of a single external command.
//!
//! The runner owns the child for its whole life: output is streamed through
//! a [`ProgressParser`], the exit status is classified against the
//! configured [`ExitPolicy`], and a cancelled token terminates the child
//! before `run` returns.

use crate::cancel::CancellationToken;
use crate::config::{EngineConfig, ExitPolicy};
use crate::EngineError;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

const DIAGNOSTIC_HISTORY: usize = 32;

/// Program plus arguments, no shell involved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Grammar of a tool's progress output.
pub trait ProgressParser: Send + Sync + fmt::Debug {
    /// Cumulative bytes written, if `line` is a progress line.
    fn parse_bytes(&self, line: &str) -> Option<u64>;

    /// Lines that carry no diagnostic value (summaries, counters).
    fn is_noise(&self, _line: &str) -> bool {
        false
    }
}

/// GNU/busybox `dd` output: `1048576 bytes (1.0 MB, 1.0 MiB) copied, ...`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DdProgressParser;

impl ProgressParser for DdProgressParser {
    fn parse_bytes(&self, line: &str) -> Option<u64> {
        if !line.contains("copied") && !line.contains("transferred") {
            return None;
        }

        let tokens: Vec<&str> = line.split_whitespace().collect();
        tokens.windows(2).find_map(|pair| {
            if pair[1].starts_with("bytes") {
                pair[0].parse::<u64>().ok()
            } else {
                None
            }
        })
    }

    fn is_noise(&self, line: &str) -> bool {
        line.ends_with("records in") || line.ends_with("records out")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Completed,
    /// The writer ran off the end of the device.
    OutOfSpace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
    pub reason: ExitReason,
}

#[derive(Debug, Clone)]
pub struct ProcessRunner {
    parser: Arc<dyn ProgressParser>,
    exit_policy: ExitPolicy,
    terminate_grace: Duration,
}

impl ProcessRunner {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            parser: Arc::new(DdProgressParser),
            exit_policy: config.exit_policy.clone(),
            terminate_grace: config.terminate_grace(),
        }
    }

    /// Swap the progress grammar, e.g. for a different overwrite utility.
    pub fn with_parser(mut self, parser: Arc<dyn ProgressParser>) -> Self {
        self.parser = parser;
        self
    }

    /// Run `command` to completion.
    ///
    /// `on_bytes` receives every byte count the parser recognises, in
    /// output order. Cancellation terminates the child and yields
    /// [`EngineError::Cancelled`].
    pub async fn run<F>(
        &self,
        command: &CommandSpec,
        mut on_bytes: F,
        cancel: &CancellationToken,
    ) -> Result<ProcessExit, EngineError>
    where
        F: FnMut(u64) + Send,
    {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| EngineError::Spawn {
                program: command.program.clone(),
                source,
            })?;

        tracing::debug!(pid = ?child.id(), "Spawned {}", command);

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(forward_segments(stdout, tx.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(forward_segments(stderr, tx.clone())));
        }
        drop(tx);

        let mut diagnostics = Diagnostics::default();

        let status = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.terminate(&mut child, &command.program).await;
                    for reader in &readers {
                        reader.abort();
                    }
                    return Err(EngineError::Cancelled);
                }
                Some(segment) = rx.recv() => {
                    self.handle_segment(segment, &mut on_bytes, &mut diagnostics);
                }
                status = child.wait() => break status?,
            }
        };

        // Output written just before exit may still be in flight.
        let drain = async {
            while let Some(segment) = rx.recv().await {
                self.handle_segment(segment, &mut on_bytes, &mut diagnostics);
            }
        };
        if tokio::time::timeout(self.terminate_grace, drain).await.is_err() {
            tracing::warn!("{} exited but its output stayed open; not waiting further", command.program);
            for reader in &readers {
                reader.abort();
            }
        }

        self.classify(&command.program, status, &diagnostics)
    }

    fn handle_segment<F: FnMut(u64)>(&self, segment: String, on_bytes: &mut F, diagnostics: &mut Diagnostics) {
        let segment = segment.trim();
        if segment.is_empty() {
            return;
        }

        if let Some(bytes) = self.parser.parse_bytes(segment) {
            on_bytes(bytes);
        } else if !self.parser.is_noise(segment) {
            tracing::trace!("{}", segment);
            diagnostics.push(segment);
        }
    }

    fn classify(&self, program: &str, status: ExitStatus, diagnostics: &Diagnostics) -> Result<ProcessExit, EngineError> {
        if status.success() {
            return Ok(ProcessExit {
                code: status.code(),
                reason: ExitReason::Completed,
            });
        }
        classify_failure(&self.exit_policy, program, status.code(), diagnostics)
    }

    /// SIGTERM, then SIGKILL once the grace period runs out.
    async fn terminate(&self, child: &mut Child, program: &str) {
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            if let Some(pid) = child.id() {
                match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    Ok(()) => match tokio::time::timeout(self.terminate_grace, child.wait()).await {
                        Ok(Ok(status)) => {
                            tracing::info!("Terminated {} (pid {}): {}", program, pid, status);
                            return;
                        }
                        Ok(Err(e)) => tracing::warn!("Failed to wait for {} after SIGTERM: {}", program, e),
                        Err(_) => tracing::warn!(
                            "{} ignored SIGTERM for {:?}, killing",
                            program,
                            self.terminate_grace
                        ),
                    },
                    Err(e) => tracing::debug!("SIGTERM to {} failed: {}", pid, e),
                }
            }
        }

        if let Err(e) = child.kill().await {
            tracing::warn!("Failed to kill {}: {}", program, e);
        } else {
            tracing::info!("Killed {}", program);
        }
    }
}

fn classify_failure(
    policy: &ExitPolicy,
    program: &str,
    code: Option<i32>,
    diagnostics: &Diagnostics,
) -> Result<ProcessExit, EngineError> {
    if let (Some(rule), Some(exit_code)) = (&policy.out_of_space, code) {
        if exit_code == rule.exit_code && diagnostics.contains(&rule.marker) {
            tracing::debug!("{} stopped at end of device, treating as complete", program);
            return Ok(ProcessExit {
                code,
                reason: ExitReason::OutOfSpace,
            });
        }
    }

    Err(EngineError::ProcessFailure {
        program: program.to_string(),
        code,
        detail: diagnostics
            .last()
            .unwrap_or("no diagnostic output")
            .to_string(),
    })
}

#[derive(Debug, Default)]
struct Diagnostics {
    lines: VecDeque<String>,
}

impl Diagnostics {
    fn push(&mut self, line: &str) {
        if self.lines.len() == DIAGNOSTIC_HISTORY {
            self.lines.pop_front();
        }
        self.lines.push_back(line.to_string());
    }

    fn contains(&self, marker: &str) -> bool {
        self.lines.iter().any(|line| line.contains(marker))
    }

    fn last(&self) -> Option<&str> {
        self.lines.back().map(String::as_str)
    }
}

/// Forward output split on both `\n` and `\r`; `dd status=progress`
/// rewrites its line in place with carriage returns.
async fn forward_segments<R>(mut reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 4096];
    let mut pending: Vec<u8> = Vec::new();

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                for &byte in &buf[..n] {
                    if byte == b'\n' || byte == b'\r' {
                        if !pending.is_empty() {
                            let _ = tx.send(String::from_utf8_lossy(&pending).into_owned());
                            pending.clear();
                        }
                    } else {
                        pending.push(byte);
                    }
                }
            }
            Err(e) => {
                tracing::debug!("Output stream error: {}", e);
                break;
            }
        }
    }

    if !pending.is_empty() {
        let _ = tx.send(String::from_utf8_lossy(&pending).into_owned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OutOfSpaceRule;
    use std::time::Instant;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh", vec!["-c".to_string(), script.to_string()])
    }

    fn runner() -> ProcessRunner {
        let mut config = EngineConfig::default();
        config.terminate_grace_ms = 2000;
        ProcessRunner::new(&config)
    }

    fn diagnostics(lines: &[&str]) -> Diagnostics {
        let mut d = Diagnostics::default();
        for line in lines {
            d.push(line);
        }
        d
    }

    #[test]
    fn test_dd_progress_lines() {
        let parser = DdProgressParser;
        assert_eq!(
            parser.parse_bytes("1048576000 bytes (1.0 GB, 1000 MiB) copied, 5 s, 210 MB/s"),
            Some(1_048_576_000)
        );
        assert_eq!(parser.parse_bytes("524288 bytes (524 kB) copied, 0.1 s"), Some(524_288));
        assert_eq!(parser.parse_bytes("2048+0 records out"), None);
        assert_eq!(parser.parse_bytes("dd: error writing '/dev/sdb': No space left on device"), None);
        assert!(parser.is_noise("2048+0 records in"));
    }

    #[test]
    fn test_out_of_space_exit_is_success() {
        let policy = ExitPolicy::default();
        let diag = diagnostics(&["dd: error writing '/dev/sdb': No space left on device"]);

        let exit = classify_failure(&policy, "dd", Some(1), &diag).unwrap();
        assert_eq!(exit.reason, ExitReason::OutOfSpace);
    }

    #[test]
    fn test_out_of_space_needs_code_and_marker() {
        let policy = ExitPolicy::default();

        let other_code = classify_failure(
            &policy,
            "dd",
            Some(2),
            &diagnostics(&["dd: error writing '/dev/sdb': No space left on device"]),
        );
        assert!(matches!(other_code, Err(EngineError::ProcessFailure { code: Some(2), .. })));

        let no_marker = classify_failure(&policy, "dd", Some(1), &diagnostics(&["dd: Input/output error"]));
        match no_marker {
            Err(EngineError::ProcessFailure { detail, .. }) => assert_eq!(detail, "dd: Input/output error"),
            other => panic!("expected process failure, got {:?}", other),
        }
    }

    #[test]
    fn test_out_of_space_rule_is_configurable() {
        let disabled = ExitPolicy { out_of_space: None };
        let diag = diagnostics(&["No space left on device"]);
        assert!(classify_failure(&disabled, "dd", Some(1), &diag).is_err());

        let custom = ExitPolicy {
            out_of_space: Some(OutOfSpaceRule {
                exit_code: 28,
                marker: "ENOSPC".to_string(),
            }),
        };
        let diag = diagnostics(&["write failed: ENOSPC"]);
        assert!(classify_failure(&custom, "writer", Some(28), &diag).is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_streams_progress_split_on_carriage_returns() {
        let mut seen = Vec::new();
        let exit = runner()
            .run(
                &sh(r#"printf '512 bytes copied\r1024 bytes (1 kB) copied\r' >&2; echo '2048 bytes copied' >&2"#),
                |bytes| seen.push(bytes),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(exit.reason, ExitReason::Completed);
        assert_eq!(seen, vec![512, 1024, 2048]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_real_out_of_space_exit() {
        let exit = runner()
            .run(
                &sh("echo \"dd: error writing '/dev/x': No space left on device\" >&2; exit 1"),
                |_| {},
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(exit, ProcessExit { code: Some(1), reason: ExitReason::OutOfSpace });
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_process_failure() {
        let result = runner()
            .run(&sh("echo 'mkfs: device busy' >&2; exit 3"), |_| {}, &CancellationToken::new())
            .await;

        match result {
            Err(EngineError::ProcessFailure { program, code, detail }) => {
                assert_eq!(program, "sh");
                assert_eq!(code, Some(3));
                assert_eq!(detail, "mkfs: device busy");
            }
            other => panic!("expected process failure, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_terminates_child() {
        let token = CancellationToken::new();
        let trigger = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                token.cancel();
            })
        };

        let started = Instant::now();
        let result = runner().run(&sh("exec sleep 30"), |_| {}, &token).await;
        trigger.await.unwrap();

        assert!(matches!(result, Err(EngineError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5), "cancel must not wait for the child to finish");
    }

    #[tokio::test]
    async fn test_cancelled_token_spawns_nothing() {
        let token = CancellationToken::new();
        token.cancel();
        let result = runner()
            .run(&CommandSpec::new("/nonexistent/never-run", vec![]), |_| {}, &token)
            .await;
        assert!(matches!(result, Err(EngineError::Cancelled)));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let result = runner()
            .run(&CommandSpec::new("/nonexistent/wipe-tool", vec![]), |_| {}, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(EngineError::Spawn { .. })));
    }
}
