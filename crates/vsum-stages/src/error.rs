//! Stage error types.

use std::time::Duration;
use thiserror::Error;

pub type StageResult<T> = Result<T, StageError>;

#[derive(Debug, Error)]
pub enum StageError {
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    /// The collaborator refused the input (private video, no transcript, ...).
    #[error("Rejected: {0}")]
    Rejected(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// How the coordinator treats a failed stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageFailure {
    /// Deadline exceeded; retried only for stages marked retryable.
    Timeout,
    /// Worth trying again (bounded).
    Transient,
    /// Never retried.
    Permanent,
}

impl StageError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::ServiceUnavailable(msg.into())
    }

    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::Rejected(msg.into())
    }

    pub fn invalid_response(msg: impl Into<String>) -> Self {
        Self::InvalidResponse(msg.into())
    }

    pub fn failure(&self) -> StageFailure {
        match self {
            StageError::Timeout(_) => StageFailure::Timeout,
            StageError::Network(e) if e.is_timeout() => StageFailure::Timeout,
            StageError::ServiceUnavailable(_) | StageError::RequestFailed(_) | StageError::Network(_) => {
                StageFailure::Transient
            }
            StageError::Rejected(_) | StageError::InvalidResponse(_) | StageError::Json(_) => {
                StageFailure::Permanent
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.failure() == StageFailure::Transient
    }

    pub fn is_permanent(&self) -> bool {
        self.failure() == StageFailure::Permanent
    }

    pub fn is_timeout(&self) -> bool {
        self.failure() == StageFailure::Timeout
    }
}
