//! Read-only projections of job and queue state.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::job::{FailureCategory, Job, JobId, JobState};

/// What a user sees when asking about their job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct JobStatusView {
    pub job_id: JobId,
    pub video_id: String,
    pub state: JobState,
    /// Progress percentage (0-100)
    pub progress: u8,
    /// Stage currently executing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    /// 1-based FIFO position while queued
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
    /// Rough wait until the job starts, while queued
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_wait_secs: Option<u64>,
    /// Failure category when failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureCategory>,
    /// Human-readable failure message when failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
    /// Artifact reference when completed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobStatusView {
    /// Project a job. Queue position and wait estimate are filled in by the caller.
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            video_id: job.video_id.clone(),
            state: job.state,
            progress: job.progress,
            stage: job.stage.clone(),
            position: None,
            estimated_wait_secs: None,
            failure: job.failure,
            failure_message: job.failure_message().map(str::to_string),
            result: job.result.clone(),
            submitted_at: job.submitted_at,
            updated_at: job.updated_at,
        }
    }
}

/// Aggregate queue view, recomputed from the registry on demand.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct QueueSnapshot {
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Age of the oldest queued job in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_queued_age_ms: Option<i64>,
    /// Active (queued or running) job count per user
    pub active_per_user: BTreeMap<String, usize>,
    /// Configured queue capacity
    pub capacity: usize,
    /// Configured worker slots
    pub workers: usize,
    pub generated_at: DateTime<Utc>,
}

impl QueueSnapshot {
    /// Number of jobs in the given state.
    pub fn count(&self, state: JobState) -> usize {
        match state {
            JobState::Queued => self.queued,
            JobState::Running => self.running,
            JobState::Completed => self.completed,
            JobState::Failed => self.failed,
            JobState::Cancelled => self.cancelled,
        }
    }

    /// Increment the counter for `state`.
    pub fn record(&mut self, state: JobState) {
        match state {
            JobState::Queued => self.queued += 1,
            JobState::Running => self.running += 1,
            JobState::Completed => self.completed += 1,
            JobState::Failed => self.failed += 1,
            JobState::Cancelled => self.cancelled += 1,
        }
    }

    /// Users with at least one active job.
    pub fn active_users(&self) -> usize {
        self.active_per_user.len()
    }
}
