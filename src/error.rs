//! Typed error taxonomy. Kept distinct from `anyhow::Error`, which wraps
//! this at the CLI boundary the same way subprocess failures get wrapped
//! with `anyhow::Context` elsewhere in this crate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("missing skill: {0}")]
    MissingSkill(String),

    #[error("backend turn failed: {0}")]
    BackendTurnFailure(String),

    #[error("transport failure: {0}")]
    TransportFailure(String),

    #[error("failed to parse structured output: {0}")]
    ParseFailure(String),

    #[error("test suite failed after {retries} retries")]
    TestFailure { retries: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type OrchResult<T> = Result<T, OrchError>;
