//! Concurrent multi-device execution.
//!
//! [`OperationScheduler`] screens every request, registers a cancellation
//! handle per accepted device and runs each device on its own tokio task.
//! A semaphore caps how many devices run at once; the rest queue. Results
//! come back in submission order, one per submitted request.

use crate::cancel::CancellationToken;
use crate::config::EngineConfig;
use crate::format::FormatPipeline;
use crate::plan::PassPlanner;
use crate::process::ProcessRunner;
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::request::{Filesystem, OperationKind, OperationRequest, OperationResult, WipeMethod};
use crate::safety::{SafetyValidator, SafetyVerdict};
use crate::wipe::WipeExecutor;
use crate::{EngineError, SystemProbe};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Share of a wipe-then-format operation given to the wipe.
const WIPE_SHARE: u8 = 80;

/// Registry entry for one running or queued operation.
#[derive(Debug, Clone)]
pub struct OperationHandle {
    pub device: String,
    pub op_id: Uuid,
    pub token: CancellationToken,
    pub progress: Arc<AtomicU8>,
    pub started_at: DateTime<Utc>,
}

impl OperationHandle {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            op_id: Uuid::new_v4(),
            token: CancellationToken::new(),
            progress: Arc::new(AtomicU8::new(0)),
            started_at: Utc::now(),
        }
    }
}

/// Device → handle map. At most one operation per device.
///
/// A cancelled entry stays in the map until its task ends, so the device
/// cannot be registered again while the old process is still being
/// terminated. Lookups only see entries that have not been cancelled.
#[derive(Debug, Default)]
pub struct OperationRegistry {
    handles: Mutex<HashMap<String, OperationHandle>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, OperationHandle>> {
        // Entries stay consistent even if a holder panicked.
        self.handles.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(&self, handle: OperationHandle) -> Result<(), EngineError> {
        let mut handles = self.lock();
        if let Some(existing) = handles.get(&handle.device) {
            if existing.token.is_cancelled() {
                tracing::debug!("{} is still stopping operation {}", handle.device, existing.op_id);
            }
            return Err(EngineError::AlreadyInProgress(handle.device));
        }
        handles.insert(handle.device.clone(), handle);
        Ok(())
    }

    pub fn lookup(&self, device: &str) -> Option<OperationHandle> {
        self.lock().get(device).filter(|h| !h.token.is_cancelled()).cloned()
    }

    /// Cancel the live operation on `device`, returning its handle.
    pub fn cancel(&self, device: &str) -> Option<OperationHandle> {
        let handles = self.lock();
        let handle = handles.get(device).filter(|h| !h.token.is_cancelled())?;
        handle.token.cancel();
        Some(handle.clone())
    }

    /// Cancel every live operation, returning their handles.
    pub fn cancel_all(&self) -> Vec<OperationHandle> {
        self.lock()
            .values()
            .filter(|h| !h.token.is_cancelled())
            .map(|h| {
                h.token.cancel();
                h.clone()
            })
            .collect()
    }

    /// Remove the entry for `device` only if it still belongs to `op_id`.
    pub fn remove_if(&self, device: &str, op_id: Uuid) -> bool {
        let mut handles = self.lock();
        match handles.get(device) {
            Some(handle) if handle.op_id == op_id => {
                handles.remove(device);
                true
            }
            _ => false,
        }
    }

    pub fn devices(&self) -> Vec<String> {
        let mut devices: Vec<String> = self
            .lock()
            .values()
            .filter(|h| !h.token.is_cancelled())
            .map(|h| h.device.clone())
            .collect();
        devices.sort();
        devices
    }
}

/// Deregisters its operation when the device task ends, however it ends.
struct RegistrationGuard {
    registry: Arc<OperationRegistry>,
    device: String,
    op_id: Uuid,
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        if self.registry.remove_if(&self.device, self.op_id) {
            tracing::debug!("Deregistered operation {} on {}", self.op_id, self.device);
        }
    }
}

/// Dry-run view of a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationReport {
    pub device: String,
    pub verdict: SafetyVerdict,
    /// Commands in execution order.
    pub commands: Vec<String>,
    /// Programs that could not be found.
    pub missing_tools: Vec<String>,
    pub warnings: Vec<String>,
    pub will_erase_data: bool,
}

enum Slot {
    Done(OperationResult),
    Running(String, JoinHandle<OperationResult>),
}

/// Pending results of a submitted batch.
pub struct BatchResults {
    slots: Vec<Slot>,
}

impl BatchResults {
    /// Wait for every device and return one result per request, in
    /// submission order.
    pub async fn wait(self) -> Vec<OperationResult> {
        let mut results = Vec::with_capacity(self.slots.len());
        for slot in self.slots {
            match slot {
                Slot::Done(result) => results.push(result),
                Slot::Running(device, task) => match task.await {
                    Ok(result) => results.push(result),
                    Err(e) => {
                        tracing::error!("Task for {} ended abnormally: {}", device, e);
                        results.push(OperationResult::error(device, format!("Operation task failed: {}", e)));
                    }
                },
            }
        }
        results
    }
}

/// A submitted batch: a progress stream plus the eventual results.
pub struct Batch {
    progress: mpsc::UnboundedReceiver<ProgressEvent>,
    results: BatchResults,
}

impl Batch {
    /// Next progress event; `None` once every device task has finished.
    pub async fn next_progress(&mut self) -> Option<ProgressEvent> {
        self.progress.recv().await
    }

    pub async fn wait(self) -> Vec<OperationResult> {
        self.results.wait().await
    }

    /// Split so progress can be consumed while the results are awaited.
    pub fn into_parts(self) -> (mpsc::UnboundedReceiver<ProgressEvent>, BatchResults) {
        (self.progress, self.results)
    }
}

pub struct OperationScheduler {
    validator: SafetyValidator,
    planner: PassPlanner,
    wipe: Arc<WipeExecutor>,
    format: Arc<FormatPipeline>,
    permits: Arc<Semaphore>,
    registry: Arc<OperationRegistry>,
}

impl OperationScheduler {
    pub fn new(config: &EngineConfig, probe: Arc<dyn SystemProbe>) -> Self {
        let runner = ProcessRunner::new(config);
        Self::with_runner(config, probe, runner)
    }

    /// Build with a specific runner, e.g. one carrying a custom progress parser.
    pub fn with_runner(config: &EngineConfig, probe: Arc<dyn SystemProbe>, runner: ProcessRunner) -> Self {
        let planner = PassPlanner::new(config);
        Self {
            validator: SafetyValidator::new(probe.clone(), config),
            planner: planner.clone(),
            wipe: Arc::new(WipeExecutor::new(planner, runner.clone(), probe.clone())),
            format: Arc::new(FormatPipeline::new(runner, probe, config)),
            permits: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            registry: Arc::new(OperationRegistry::new()),
        }
    }

    /// Screen a request without running anything.
    pub async fn check(&self, request: &OperationRequest) -> SafetyVerdict {
        let verdict = self.validator.validate(request).await;
        if !verdict.safe {
            return verdict;
        }
        if let OperationKind::Wipe { method, .. } = &request.kind {
            if let Err(e) = method.parse::<WipeMethod>() {
                return SafetyVerdict::rejected(e.to_string());
            }
        }
        verdict
    }

    /// Screen, register and start every request.
    ///
    /// Rejected or duplicate requests get an error result without running
    /// anything. Accepted ones are registered before this returns, so they
    /// can be cancelled right away.
    pub async fn submit_batch(&self, requests: Vec<OperationRequest>) -> Batch {
        let total = requests.len();
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut slots = Vec::with_capacity(total);

        tracing::info!("Submitting batch of {} operation(s)", total);

        for mut request in requests {
            request.device = request.device.trim().to_string();
            let device = request.device.clone();

            let verdict = self.check(&request).await;
            if !verdict.safe {
                let reason = verdict.reason.unwrap_or_else(|| "Rejected by safety checks".to_string());
                slots.push(Slot::Done(OperationResult::error(device, reason)));
                continue;
            }

            let handle = OperationHandle::new(device.as_str());
            let op_id = handle.op_id;
            let token = handle.token.clone();
            let progress = handle.progress.clone();
            if let Err(e) = self.registry.register(handle) {
                tracing::warn!("Not starting {}: {}", device, e);
                slots.push(Slot::Done(OperationResult::error(device, e.to_string())));
                continue;
            }

            let guard = RegistrationGuard {
                registry: self.registry.clone(),
                device: device.clone(),
                op_id,
            };
            let reporter = ProgressReporter::new(device.as_str(), Some(total), sender.clone(), progress);
            let task = tokio::spawn(run_operation(
                self.wipe.clone(),
                self.format.clone(),
                self.permits.clone(),
                request,
                reporter,
                token,
                guard,
            ));
            tracing::debug!("Spawned operation {} for {}", op_id, device);
            slots.push(Slot::Running(device, task));
        }

        Batch {
            progress: receiver,
            results: BatchResults { slots },
        }
    }

    /// Cancel the operation registered for `device`.
    ///
    /// Returns once the token is triggered. The device stays reserved until
    /// its process has exited and the task has finished.
    pub fn cancel(&self, device: &str) -> Result<(), EngineError> {
        let device = device.trim();
        match self.registry.cancel(device) {
            Some(handle) => {
                tracing::info!("Cancelling operation {} on {}", handle.op_id, device);
                handle.token.cancel();
                Ok(())
            }
            None => Err(EngineError::NotFound(device.to_string())),
        }
    }

    /// Cancel every registered operation; returns how many were cancelled.
    pub fn shutdown(&self) -> usize {
        let handles = self.registry.cancel_all();
        if !handles.is_empty() {
            tracing::info!("Cancelled {} operation(s) on shutdown", handles.len());
        }
        handles.len()
    }

    pub fn progress_of(&self, device: &str) -> Option<u8> {
        self.registry
            .lookup(device.trim())
            .map(|handle| handle.progress.load(Ordering::SeqCst))
    }

    pub fn active_devices(&self) -> Vec<String> {
        self.registry.devices()
    }

    /// Describe what `request` would do without spawning anything.
    pub async fn simulate(&self, request: &OperationRequest) -> SimulationReport {
        let device = request.device.trim();
        let verdict = self.check(request).await;
        let mut warnings = Vec::new();

        let mut commands = Vec::new();
        match &request.kind {
            OperationKind::Wipe { method, then_format } => {
                if let Ok(passes) = self.planner.plan(method, device) {
                    if passes.len() > 3 {
                        warnings.push(format!("{} method runs {} full-device passes", method, passes.len()));
                    }
                    commands.extend(passes.into_iter().map(|p| p.command));
                }
                if let Some(target) = then_format {
                    if let Ok(fs) = target.filesystem.parse::<Filesystem>() {
                        commands.extend(
                            self.format
                                .commands(device, fs, target.label.as_deref())
                                .into_iter()
                                .map(|(_, c)| c),
                        );
                    }
                }
            }
            OperationKind::Format(target) => {
                if let Ok(fs) = target.filesystem.parse::<Filesystem>() {
                    commands.extend(
                        self.format
                            .commands(device, fs, target.label.as_deref())
                            .into_iter()
                            .map(|(_, c)| c),
                    );
                }
            }
        }

        let mut missing_tools: Vec<String> = Vec::new();
        for command in &commands {
            if !missing_tools.contains(&command.program) && which::which(&command.program).is_err() {
                missing_tools.push(command.program.clone());
            }
        }
        if !missing_tools.is_empty() {
            warnings.push(format!("Missing tools: {}", missing_tools.join(", ")));
        }

        SimulationReport {
            device: device.to_string(),
            verdict,
            commands: commands.iter().map(ToString::to_string).collect(),
            missing_tools,
            warnings,
            will_erase_data: true,
        }
    }
}

async fn run_operation(
    wipe: Arc<WipeExecutor>,
    format: Arc<FormatPipeline>,
    permits: Arc<Semaphore>,
    request: OperationRequest,
    progress: ProgressReporter,
    cancel: CancellationToken,
    _guard: RegistrationGuard,
) -> OperationResult {
    let device = request.device;

    let _permit = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            tracing::info!("{} cancelled while queued", device);
            return OperationResult::cancelled(device);
        }
        permit = permits.acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return OperationResult::error(device, "Scheduler is shut down"),
        },
    };

    progress.report(0, "Starting...");

    let result = match request.kind {
        OperationKind::Wipe { method, then_format: None } => {
            wipe.execute(&device, &method, &progress, &cancel).await
        }
        OperationKind::Wipe {
            method,
            then_format: Some(target),
        } => {
            let wiped = wipe
                .execute(&device, &method, &progress.window(0, WIPE_SHARE), &cancel)
                .await;
            match wiped {
                Ok(wiped) => format
                    .execute(
                        &device,
                        &target.filesystem,
                        target.label.as_deref(),
                        &progress.window(WIPE_SHARE, 100),
                        &cancel,
                    )
                    .await
                    .map(|formatted| format!("{}. {}", wiped, formatted)),
                Err(e) => Err(e),
            }
        }
        OperationKind::Format(target) => {
            format
                .execute(&device, &target.filesystem, target.label.as_deref(), &progress, &cancel)
                .await
        }
    };

    let result = OperationResult::from_execution(device, result);
    if result.is_success() {
        tracing::info!("Operation on {} succeeded", result.device);
    } else if result.is_cancelled() {
        tracing::info!("Operation on {} cancelled", result.device);
    } else {
        tracing::error!("Operation on {} failed: {}", result.device, result.reason().unwrap_or("unknown error"));
    }
    result
}
