//! Process-local store used for tests and as a fallback when Redis is down.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use vsum_models::{Job, JobId, JobState};

use super::{JobStore, RateWindowRecord};
use crate::config::StoreBackend;
use crate::error::{StoreError, StoreResult};

#[derive(Debug, Default)]
pub struct MemoryStore {
    jobs: Mutex<HashMap<JobId, Job>>,
    rate_windows: Mutex<HashMap<String, (RateWindowRecord, Instant)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored job records.
    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    fn backend(&self) -> StoreBackend {
        StoreBackend::Memory
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn put(&self, job: &Job) -> StoreResult<()> {
        self.jobs.lock().insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get(&self, job_id: &JobId) -> StoreResult<Job> {
        self.jobs
            .lock()
            .get(job_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(job_id.clone()))
    }

    async fn list_by_state(&self, state: JobState) -> StoreResult<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .jobs
            .lock()
            .values()
            .filter(|job| job.state == state)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| (a.submitted_at, &a.id).cmp(&(b.submitted_at, &b.id)));
        Ok(jobs)
    }

    async fn delete(&self, job_id: &JobId) -> StoreResult<()> {
        self.jobs.lock().remove(job_id);
        Ok(())
    }

    async fn put_rate_window(&self, record: &RateWindowRecord, ttl: Duration) -> StoreResult<()> {
        let mut windows = self.rate_windows.lock();
        if record.timestamps.is_empty() {
            windows.remove(&record.user_id);
        } else {
            windows.insert(record.user_id.clone(), (record.clone(), Instant::now() + ttl));
        }
        Ok(())
    }

    async fn list_rate_windows(&self) -> StoreResult<Vec<RateWindowRecord>> {
        let now = Instant::now();
        let mut windows = self.rate_windows.lock();
        windows.retain(|_, (_, expires_at)| *expires_at > now);
        Ok(windows.values().map(|(record, _)| record.clone()).collect())
    }
}
