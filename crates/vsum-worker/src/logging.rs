//! Structured job logging utilities.
//!
//! Keeps the job lifecycle lines consistent: every line carries the job ID,
//! the owning user and the operation.

use tracing::{error, info, warn, Span};

use vsum_models::{FailureCategory, Job};
use vsum_stages::StageKind;

/// Job logger for structured logging with consistent formatting.
#[derive(Debug, Clone)]
pub struct JobLogger {
    job_id: String,
    user_id: String,
    operation: &'static str,
}

impl JobLogger {
    pub fn new(job: &Job, operation: &'static str) -> Self {
        Self {
            job_id: job.id.to_string(),
            user_id: job.user_id.clone(),
            operation,
        }
    }

    pub fn log_start(&self, attempt: u32) {
        info!(
            job_id = %self.job_id,
            user_id = %self.user_id,
            operation = self.operation,
            attempt,
            "Job started"
        );
    }

    pub fn log_stage(&self, stage: StageKind, elapsed_ms: u64) {
        info!(
            job_id = %self.job_id,
            operation = self.operation,
            stage = %stage,
            elapsed_ms,
            "Stage finished"
        );
    }

    pub fn log_retry(&self, stage: StageKind, retry: u32, reason: &str) {
        warn!(
            job_id = %self.job_id,
            operation = self.operation,
            stage = %stage,
            retry,
            "Job requeued: {}", reason
        );
    }

    pub fn log_failure(&self, stage: StageKind, category: FailureCategory, detail: &str) {
        error!(
            job_id = %self.job_id,
            user_id = %self.user_id,
            operation = self.operation,
            stage = %stage,
            category = %category,
            "Job failed: {}", detail
        );
    }

    pub fn log_cancelled(&self) {
        info!(
            job_id = %self.job_id,
            user_id = %self.user_id,
            operation = self.operation,
            "Job cancelled"
        );
    }

    pub fn log_completion(&self, result: &str) {
        info!(
            job_id = %self.job_id,
            user_id = %self.user_id,
            operation = self.operation,
            result = %result,
            "Job completed"
        );
    }

    pub fn log_warning(&self, message: &str) {
        warn!(
            job_id = %self.job_id,
            operation = self.operation,
            "Job warning: {}", message
        );
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn operation(&self) -> &str {
        self.operation
    }

    /// Span wrapping everything a worker does for this job.
    pub fn create_span(&self) -> Span {
        tracing::info_span!(
            "job",
            job_id = %self.job_id,
            user_id = %self.user_id,
            operation = self.operation
        )
    }
}
