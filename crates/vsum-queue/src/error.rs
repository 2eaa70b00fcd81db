//! Queue error types.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use vsum_models::JobId;

pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by a [`JobStore`](crate::store::JobStore) backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Backend cannot be reached (connection refused, dropped, timed out).
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error("Store backend error: {0}")]
    Backend(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    /// Whether the failure is the backend being unreachable.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_refusal()
            || err.is_connection_dropped()
            || err.is_timeout()
        {
            StoreError::Unavailable(err.to_string())
        } else {
            StoreError::Backend(err.to_string())
        }
    }
}

/// Why a submission was not admitted.
///
/// Returned synchronously from submission and never retried automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    /// Too many submissions inside the rate window
    RateLimited,
    /// The user already has a queued or running job
    UserBusy,
    /// The queue holds its configured maximum of queued jobs
    QueueFull,
    /// The access gate refused the user
    AccessDenied,
}

impl RejectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionReason::RateLimited => "rate_limited",
            RejectionReason::UserBusy => "user_busy",
            RejectionReason::QueueFull => "queue_full",
            RejectionReason::AccessDenied => "access_denied",
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::error::Error for RejectionReason {}
