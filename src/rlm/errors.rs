//! RLM-specific error taxonomy.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RlmError {
    /// The sandboxed child process is not on `PATH`.
    #[error("RLM container executable not found on PATH: {0}")]
    ContainerNotFound(String),

    #[error("RLM container process exited unexpectedly: {0}")]
    ContainerFailure(String),

    #[error("RLM IPC protocol error: {0}")]
    Ipc(String),

    #[error("RLM sub-LM query failed: {0}")]
    SubLmFailure(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type RlmResult<T> = Result<T, RlmError>;

/// Raised by REPL-executed code to declare the root loop's answer. Not a
/// failure — a control-flow-only signal, carrying the stringified result.
#[derive(Debug, Clone)]
pub struct FinalAnswer {
    pub answer: String,
}
