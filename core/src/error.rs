use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Unknown wipe method: {0}")]
    UnknownMethod(String),

    #[error("Unsupported filesystem: {0}")]
    UnsupportedFilesystem(String),

    #[error("{program} exited with {}: {detail}", exit_code_display(.code))]
    ProcessFailure {
        program: String,
        code: Option<i32>,
        detail: String,
    },

    #[error("Wipe failed on pass {pass}/{total}: {source}")]
    PassFailed {
        pass: usize,
        total: usize,
        #[source]
        source: Box<EngineError>,
    },

    #[error("Format failed while {stage}: {source}")]
    StageFailed {
        stage: crate::format::FormatStage,
        #[source]
        source: Box<EngineError>,
    },

    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Operation cancelled by user")]
    Cancelled,

    #[error("An operation is already in progress for {0}")]
    AlreadyInProgress(String),

    #[error("No operation in progress for {0}")]
    NotFound(String),

    #[error("Probe failed: {0}")]
    Probe(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// True when the error, or the error it wraps, is a user cancellation.
    pub fn is_cancelled(&self) -> bool {
        match self {
            EngineError::Cancelled => true,
            EngineError::PassFailed { source, .. } | EngineError::StageFailed { source, .. } => {
                source.is_cancelled()
            }
            _ => false,
        }
    }
}

fn exit_code_display(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("code {}", code),
        None => "no exit code (terminated by signal)".to_string(),
    }
}
