use thiserror::Error;

use crate::storage::StoreError;

/// Errors surfaced by the orchestrator.
///
/// `Handler` is never returned from `execute_workflow`; handler failures are
/// recorded in the run state and reported through `ExecutionResult::success`.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("node '{node}' failed: {message}")]
    Handler { node: String, message: String },

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }
}
