use crate::cancel::CancellationToken;
use crate::plan::PassPlanner;
use crate::process::{ExitReason, ProcessRunner};
use crate::progress::ProgressReporter;
use crate::request::WipeMethod;
use crate::{EngineError, SystemProbe};
use std::sync::Arc;

/// Runs a wipe plan against one device, one pass at a time.
pub struct WipeExecutor {
    planner: PassPlanner,
    runner: ProcessRunner,
    probe: Arc<dyn SystemProbe>,
}

impl WipeExecutor {
    pub fn new(planner: PassPlanner, runner: ProcessRunner, probe: Arc<dyn SystemProbe>) -> Self {
        Self { planner, runner, probe }
    }

    pub async fn execute(
        &self,
        device: &str,
        method: &str,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<String, EngineError> {
        let method: WipeMethod = method.parse()?;
        let passes = self.planner.plan_method(method, device);

        let size = self.probe.device_size(device).await?;
        if size == 0 {
            return Err(EngineError::Probe(format!("{} reports a size of 0 bytes", device)));
        }

        let total = passes.len();
        tracing::info!("Wiping {} ({} bytes) with {} method, {} pass(es)", device, size, method, total);

        for (index, pass) in passes.iter().enumerate() {
            if cancel.is_cancelled() {
                tracing::info!("Wipe of {} cancelled before pass {}/{}", device, index + 1, total);
                return Err(EngineError::Cancelled);
            }

            let number = index + 1;
            tracing::info!("Starting pass {}/{} on {}: {}", number, total, device, pass.command);
            progress.report(
                overall_percentage(index, total, 0),
                format!("Pass {}/{}: {}", number, total, pass.description),
            );

            let mut last = 0u8;
            let on_bytes = |bytes: u64| {
                let pct = pass_percentage(bytes, size);
                if pct > last {
                    last = pct;
                    progress.report(
                        overall_percentage(index, total, pct),
                        format!("{} - Pass {}/{} - {}%", pass.description, number, total, pct),
                    );
                }
            };

            match self.runner.run(&pass.command, on_bytes, cancel).await {
                Ok(exit) => {
                    if exit.reason == ExitReason::OutOfSpace {
                        tracing::debug!("Pass {} reached the end of {}", number, device);
                    }
                    tracing::info!("Completed pass {}/{} on {}", number, total, device);
                }
                Err(EngineError::Cancelled) => {
                    tracing::info!("Wipe of {} cancelled during pass {}/{}", device, number, total);
                    return Err(EngineError::Cancelled);
                }
                Err(e) => {
                    tracing::error!("Pass {}/{} on {} failed: {}", number, total, device, e);
                    return Err(EngineError::PassFailed {
                        pass: number,
                        total,
                        source: Box::new(e),
                    });
                }
            }
        }

        progress.report(100, "Wipe completed successfully");
        Ok(format!("Successfully wiped {} using {} method", device, method))
    }
}

/// Share of the device written so far, capped at 99 while the pass runs.
pub fn pass_percentage(bytes: u64, size: u64) -> u8 {
    if size == 0 {
        return 0;
    }
    let pct = u128::from(bytes) * 100 / u128::from(size);
    pct.min(99) as u8
}

/// Overall progress with `index` passes finished and the current one at `pass_pct`.
pub fn overall_percentage(index: usize, total: usize, pass_pct: u8) -> u8 {
    if total == 0 {
        return 100;
    }
    let value = (index * 100 + usize::from(pass_pct.min(99))) / total;
    value.min(100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::test_utils::MockProbe;

    #[test]
    fn test_pass_percentage_clamps_below_completion() {
        assert_eq!(pass_percentage(0, 1000), 0);
        assert_eq!(pass_percentage(500, 1000), 50);
        assert_eq!(pass_percentage(1000, 1000), 99);
        assert_eq!(pass_percentage(5000, 1000), 99, "dd may overshoot the probed size");
        assert_eq!(pass_percentage(u64::MAX, u64::MAX / 2), 99);
    }

    #[test]
    fn test_overall_percentage_across_passes() {
        assert_eq!(overall_percentage(0, 1, 50), 50);
        assert_eq!(overall_percentage(0, 3, 99), 33);
        assert_eq!(overall_percentage(1, 3, 0), 33);
        assert_eq!(overall_percentage(1, 3, 50), 50);
        assert_eq!(overall_percentage(2, 3, 99), 99);
        assert_eq!(overall_percentage(34, 35, 99), 99);
    }

    #[test]
    fn test_overall_percentage_is_monotonic() {
        for total in [1usize, 3, 35] {
            let mut previous = 0;
            for index in 0..total {
                for pct in 0..=99u8 {
                    let value = overall_percentage(index, total, pct);
                    assert!(value >= previous, "{} < {} at pass {} of {}", value, previous, index, total);
                    assert!(value <= 100);
                    previous = value;
                }
            }
        }
    }

    #[tokio::test]
    async fn test_unknown_method_fails_before_probing() {
        let config = EngineConfig::default();
        // An empty probe would fail the size lookup; the method check must come first.
        let executor = WipeExecutor::new(
            PassPlanner::new(&config),
            ProcessRunner::new(&config),
            Arc::new(MockProbe::new()),
        );

        let result = executor
            .execute("/dev/sdb", "sparkle", &ProgressReporter::detached("/dev/sdb"), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(EngineError::UnknownMethod(_))));
    }

    #[tokio::test]
    async fn test_zero_sized_device_rejected() {
        let config = EngineConfig::default();
        let executor = WipeExecutor::new(
            PassPlanner::new(&config),
            ProcessRunner::new(&config),
            Arc::new(MockProbe::new().with_device("/dev/sdb", 0)),
        );

        let result = executor
            .execute("/dev/sdb", "zero", &ProgressReporter::detached("/dev/sdb"), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(EngineError::Probe(_))));
    }

    #[tokio::test]
    async fn test_cancelled_token_runs_no_pass() {
        let mut config = EngineConfig::default();
        config.tools.dd = "/nonexistent/dd".to_string();
        let executor = WipeExecutor::new(
            PassPlanner::new(&config),
            ProcessRunner::new(&config),
            Arc::new(MockProbe::new().with_device("/dev/sdb", 1 << 20)),
        );
        let token = CancellationToken::new();
        token.cancel();

        let result = executor
            .execute("/dev/sdb", "dod", &ProgressReporter::detached("/dev/sdb"), &token)
            .await;
        assert!(matches!(result, Err(EngineError::Cancelled)), "got {:?}", result);
    }
}
