//! Queue and worker metrics.
//!
//! Recorded through the `metrics` facade; the server installs a Prometheus
//! recorder, everything else (tests included) records into the no-op default.

use metrics::{counter, gauge, histogram};

/// Metric names as constants for consistency.
pub mod names {
    // Submission
    pub const JOBS_SUBMITTED_TOTAL: &str = "vsum_jobs_submitted_total";
    pub const JOBS_REJECTED_TOTAL: &str = "vsum_jobs_rejected_total";

    // Lifecycle
    pub const JOBS_COMPLETED_TOTAL: &str = "vsum_jobs_completed_total";
    pub const JOBS_FAILED_TOTAL: &str = "vsum_jobs_failed_total";
    pub const JOBS_CANCELLED_TOTAL: &str = "vsum_jobs_cancelled_total";
    pub const JOBS_RETRIED_TOTAL: &str = "vsum_jobs_retried_total";
    pub const JOB_DURATION_SECONDS: &str = "vsum_job_duration_seconds";
    pub const STAGE_DURATION_SECONDS: &str = "vsum_stage_duration_seconds";
    pub const DELIVERY_FAILURES_TOTAL: &str = "vsum_delivery_failures_total";

    // Queue shape
    pub const QUEUE_LENGTH: &str = "vsum_queue_length";
    pub const JOBS_RUNNING: &str = "vsum_jobs_running";

    // Store
    pub const STORE_WRITE_FAILURES_TOTAL: &str = "vsum_store_write_failures_total";
    pub const STORE_PARKED_WRITES: &str = "vsum_store_parked_writes";
}

pub fn record_job_submitted() {
    counter!(names::JOBS_SUBMITTED_TOTAL).increment(1);
}

pub fn record_job_rejected(reason: &str) {
    let labels = [("reason", reason.to_string())];
    counter!(names::JOBS_REJECTED_TOTAL, &labels).increment(1);
}

pub fn record_job_completed(duration_secs: f64) {
    counter!(names::JOBS_COMPLETED_TOTAL).increment(1);
    histogram!(names::JOB_DURATION_SECONDS).record(duration_secs);
}

pub fn record_job_failed(category: &str) {
    let labels = [("category", category.to_string())];
    counter!(names::JOBS_FAILED_TOTAL, &labels).increment(1);
}

pub fn record_job_cancelled() {
    counter!(names::JOBS_CANCELLED_TOTAL).increment(1);
}

pub fn record_job_retried(stage: &str) {
    let labels = [("stage", stage.to_string())];
    counter!(names::JOBS_RETRIED_TOTAL, &labels).increment(1);
}

pub fn record_stage_duration(stage: &str, duration_secs: f64) {
    let labels = [("stage", stage.to_string())];
    histogram!(names::STAGE_DURATION_SECONDS, &labels).record(duration_secs);
}

pub fn record_delivery_failure() {
    counter!(names::DELIVERY_FAILURES_TOTAL).increment(1);
}

pub fn set_queue_length(length: usize) {
    gauge!(names::QUEUE_LENGTH).set(length as f64);
}

pub fn set_jobs_running(count: usize) {
    gauge!(names::JOBS_RUNNING).set(count as f64);
}

pub fn record_store_write_failure(op: &str) {
    let labels = [("op", op.to_string())];
    counter!(names::STORE_WRITE_FAILURES_TOTAL, &labels).increment(1);
}

pub fn set_store_parked_writes(count: usize) {
    gauge!(names::STORE_PARKED_WRITES).set(count as f64);
}
