//! API error types.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use vsum_queue::{RejectionReason, StoreError};
use vsum_worker::SubmitError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Admission control turned the submission away.
    #[error("{}", rejection_message(.0))]
    Rejected(RejectionReason),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl ApiError {
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Rejected(reason) => match reason {
                RejectionReason::RateLimited => StatusCode::TOO_MANY_REQUESTS,
                RejectionReason::UserBusy => StatusCode::CONFLICT,
                RejectionReason::QueueFull => StatusCode::SERVICE_UNAVAILABLE,
                RejectionReason::AccessDenied => StatusCode::FORBIDDEN,
            },
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) | ApiError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> Option<&'static str> {
        match self {
            ApiError::Rejected(reason) => Some(reason.as_str()),
            _ => None,
        }
    }
}

fn rejection_message(reason: &RejectionReason) -> &'static str {
    match reason {
        RejectionReason::RateLimited => "Too many submissions, please wait before trying again",
        RejectionReason::UserBusy => "You already have a video being processed",
        RejectionReason::QueueFull => "The queue is full, please try again later",
        RejectionReason::AccessDenied => "An active subscription is required",
    }
}

impl From<SubmitError> for ApiError {
    fn from(err: SubmitError) -> Self {
        match err {
            SubmitError::Rejected(reason) => ApiError::Rejected(reason),
            SubmitError::Invalid(e) => ApiError::BadRequest(e.to_string()),
            SubmitError::MissingUser => ApiError::unauthorized("missing user"),
            SubmitError::ShuttingDown => ApiError::Unavailable("server is shutting down".to_string()),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Don't expose internal error details in production
        let detail = match &self {
            ApiError::Internal(_) | ApiError::Store(_) => {
                if std::env::var("ENVIRONMENT").unwrap_or_default() == "production" {
                    "An internal error occurred".to_string()
                } else {
                    self.to_string()
                }
            }
            _ => self.to_string(),
        };

        let body = ErrorResponse {
            detail,
            code: self.code(),
        };

        (status, Json(body)).into_response()
    }
}
