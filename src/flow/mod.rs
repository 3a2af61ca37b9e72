//! Supervision of the external flow worker process.

pub mod messages;
pub mod supervisor;

pub use messages::{validate_flow, ControlMessage, FlowDefinition, FlowEdge, FlowNode, LogLevel, ProgressMessage};
pub use supervisor::{FlowEvent, FlowExecutionState, FlowLogEntry, FlowSupervisor, StopOutcome};

#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    #[error("A flow is already running")]
    AlreadyRunning,

    #[error("Invalid flow: {0}")]
    InvalidFlow(String),

    #[error("Failed to spawn flow worker '{program}': {source}")]
    Spawn { program: String, source: std::io::Error },

    #[error("Flow worker is not available: {0}")]
    WorkerUnavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FlowError>;
