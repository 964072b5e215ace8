//! Orchestrator error types.

use thiserror::Error;

/// Result type for orchestrator operations.
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The orchestrator has no such session. Terminal operations treat this as success.
    #[error("Orchestrator session not found: {0}")]
    NotFound(String),

    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    #[error("Orchestrator error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Orchestrator rejected credentials")]
    Unauthorized,

    #[error("Failed to parse orchestrator response: {0}")]
    ParseError(String),

    #[error("Orchestrator unavailable at {url}: {message}")]
    ConnectionFailed { url: String, message: String },
}

impl OrchestratorError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
