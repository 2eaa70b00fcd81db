//! Job submission, status and cancellation.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;

use vsum_models::{JobId, JobStatusView, OutputFormat};

use crate::auth::UserId;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Body of `POST /api/jobs`.
#[derive(Debug, Deserialize)]
pub struct SubmitJobRequest {
    /// YouTube URL in any of the usual shapes
    pub url: String,
    /// `txt`, `docx` or `pdf`; defaults to `txt`
    #[serde(default)]
    pub format: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SubmitJobResponse {
    pub job_id: JobId,
    pub status: JobStatusView,
}

#[derive(Debug, Serialize)]
pub struct CancelJobResponse {
    pub job_id: JobId,
    pub cancelled: bool,
}

/// Submit a video for summarization.
pub async fn submit_job(
    State(state): State<AppState>,
    user: UserId,
    Json(body): Json<SubmitJobRequest>,
) -> ApiResult<(StatusCode, Json<SubmitJobResponse>)> {
    let format = match body.format.as_deref() {
        Some(raw) => raw
            .parse::<OutputFormat>()
            .map_err(|e| ApiError::bad_request(e.to_string()))?,
        None => OutputFormat::default(),
    };

    let job_id = state
        .coordinator
        .submit(user.as_str(), &body.url, format)
        .await?;

    let status = state
        .coordinator
        .status()
        .status_of_job(&job_id)
        .ok_or_else(|| ApiError::internal("submitted job vanished from the registry"))?;

    info!(job_id = %job_id, user_id = %user.as_str(), "Accepted job via API");
    Ok((StatusCode::ACCEPTED, Json(SubmitJobResponse { job_id, status })))
}

/// Status of the caller's active or most recent job.
pub async fn get_my_status(State(state): State<AppState>, user: UserId) -> ApiResult<Json<JobStatusView>> {
    state
        .coordinator
        .status()
        .status_of(user.as_str())
        .map(Json)
        .ok_or_else(|| ApiError::not_found("No jobs for this user"))
}

/// Status of one of the caller's jobs.
pub async fn get_job(
    State(state): State<AppState>,
    user: UserId,
    Path(job_id): Path<String>,
) -> ApiResult<Json<JobStatusView>> {
    let job_id = JobId::from_string(job_id);
    let owned = state
        .coordinator
        .job(&job_id)
        .is_some_and(|job| job.user_id == user.as_str());
    if !owned {
        return Err(ApiError::not_found(format!("Job {job_id} not found")));
    }

    state
        .coordinator
        .status()
        .status_of_job(&job_id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("Job {job_id} not found")))
}

/// Cancel one of the caller's jobs.
pub async fn cancel_job(
    State(state): State<AppState>,
    user: UserId,
    Path(job_id): Path<String>,
) -> Json<CancelJobResponse> {
    let job_id = JobId::from_string(job_id);
    let cancelled = state.coordinator.cancel(&job_id, user.as_str());
    Json(CancelJobResponse { job_id, cancelled })
}
