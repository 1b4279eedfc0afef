pub mod cancel;
pub mod config;
pub mod device;
pub mod error;
pub mod format;
pub mod plan;
pub mod process;
pub mod progress;
pub mod request;
pub mod safety;
pub mod scheduler;
pub mod wipe;

// Test utilities - available for both unit and integration tests
pub mod test_utils;

pub use cancel::CancellationToken;
pub use config::{EngineConfig, ExitPolicy, OutOfSpaceRule, ToolPaths};
pub use device::{
    DeviceDescriptor, DeviceInfo, DeviceInventory, DeviceType, Partition, PermissionLevel, SystemProbe,
};
pub use error::EngineError;
pub use format::{FormatPipeline, FormatStage};
pub use plan::{FillPattern, PassPlanner, PassSpec};
pub use process::{CommandSpec, DdProgressParser, ExitReason, ProcessExit, ProcessRunner, ProgressParser};
pub use progress::{ProgressEvent, ProgressReporter};
pub use request::{
    Filesystem, FormatTarget, OperationKind, OperationRequest, OperationResult, Outcome, WipeMethod,
};
pub use safety::{SafetyValidator, SafetyVerdict};
pub use scheduler::{Batch, BatchResults, OperationScheduler, SimulationReport};
pub use wipe::WipeExecutor;
