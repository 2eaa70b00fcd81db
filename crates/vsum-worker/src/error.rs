//! Worker error types.

use thiserror::Error;

use vsum_models::RequestError;
use vsum_queue::{RejectionReason, StoreError};
use vsum_stages::StageError;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Stage error: {0}")]
    Stage(#[from] StageError),
}

impl WorkerError {
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }
}

/// Why `submit` did not create a job.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// Admission control said no.
    #[error("Submission rejected: {0}")]
    Rejected(#[from] RejectionReason),

    /// The request itself is malformed; checked before admission.
    #[error("Invalid request: {0}")]
    Invalid(#[from] RequestError),

    #[error("User ID must not be empty")]
    MissingUser,

    #[error("Coordinator is shutting down")]
    ShuttingDown,
}

impl SubmitError {
    pub fn rejection(&self) -> Option<RejectionReason> {
        match self {
            SubmitError::Rejected(reason) => Some(*reason),
            _ => None,
        }
    }
}
