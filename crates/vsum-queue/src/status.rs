//! Read-only status projections over the registry.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use vsum_models::{JobId, JobState, JobStatusView, QueueSnapshot};

use crate::registry::JobRegistry;

/// Answers "where is my job?" and "how busy is the queue?".
///
/// Never mutates the registry.
#[derive(Debug, Clone)]
pub struct StatusReporter {
    registry: Arc<JobRegistry>,
    workers: usize,
    estimated_job_duration: Duration,
}

impl StatusReporter {
    pub fn new(registry: Arc<JobRegistry>, workers: usize, estimated_job_duration: Duration) -> Self {
        Self {
            registry,
            workers: workers.max(1),
            estimated_job_duration,
        }
    }

    /// Status of the user's active job, or of their most recent one.
    pub fn status_of(&self, user_id: &str) -> Option<JobStatusView> {
        let job = self
            .registry
            .active_job(user_id)
            .or_else(|| self.registry.latest_job(user_id))?;
        Some(self.view(&job.id, JobStatusView::from_job(&job)))
    }

    /// Status of a specific job.
    pub fn status_of_job(&self, job_id: &JobId) -> Option<JobStatusView> {
        let job = self.registry.get(job_id)?;
        Some(self.view(job_id, JobStatusView::from_job(&job)))
    }

    fn view(&self, job_id: &JobId, mut view: JobStatusView) -> JobStatusView {
        if view.state == JobState::Queued {
            if let Some(position) = self.registry.queue_position(job_id) {
                view.position = Some(position);
                view.estimated_wait_secs = Some(self.estimated_wait(position).as_secs());
            }
        }
        view
    }

    /// Rough wait for the job at 1-based `position`:
    /// `position * estimated_job_duration / workers`.
    pub fn estimated_wait(&self, position: usize) -> Duration {
        self.estimated_job_duration
            .mul_f64(position as f64 / self.workers as f64)
    }

    /// Aggregate counts over every job the registry holds.
    pub fn snapshot(&self) -> QueueSnapshot {
        let now = Utc::now();
        let mut snapshot = QueueSnapshot {
            capacity: self.registry.capacity(),
            workers: self.workers,
            generated_at: now,
            ..QueueSnapshot::default()
        };

        for job in self.registry.jobs() {
            snapshot.record(job.state);
            if job.state.is_active() {
                *snapshot.active_per_user.entry(job.user_id.clone()).or_default() += 1;
            }
        }
        snapshot.oldest_queued_age_ms = self
            .registry
            .oldest_queued()
            .map(|job| (now - job.submitted_at).num_milliseconds().max(0));
        snapshot
    }
}
