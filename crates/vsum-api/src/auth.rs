//! Caller identity.
//!
//! The chat front end that fronts this server has already identified the
//! user; it forwards the ID in a header. There is no authentication here.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::error::ApiError;

/// Header carrying the caller's user ID.
pub const USER_ID_HEADER: &str = "X-User-Id";

/// Longest accepted user ID.
const MAX_USER_ID_LEN: usize = 128;

/// Axum extractor for the calling user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserId(pub String);

impl UserId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for UserId
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ApiError::unauthorized(format!("Missing {USER_ID_HEADER} header")))?;

        if user_id.len() > MAX_USER_ID_LEN {
            return Err(ApiError::bad_request("User ID is too long"));
        }

        Ok(UserId(user_id.to_string()))
    }
}
