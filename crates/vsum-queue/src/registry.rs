//! In-process job registry.
//!
//! The registry is the authoritative view of every job the process knows
//! about. All state changes go through [`JobRegistry::transition`] (or its
//! mutating sibling [`JobRegistry::transition_with`]), a compare-and-swap on
//! the job's current state: exactly one of several concurrent callers
//! racing on the same edge succeeds.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, warn};

use vsum_models::{Job, JobId, JobState};

use crate::error::RejectionReason;

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    /// FIFO index of queued jobs, keyed by original submission time.
    queued: BTreeSet<(DateTime<Utc>, JobId)>,
    /// The single non-terminal job per user.
    active: HashMap<String, JobId>,
    /// Most recently submitted job per user.
    latest: HashMap<String, JobId>,
}

impl Inner {
    fn insert(&mut self, job: Job) {
        if job.state == JobState::Queued {
            self.queued.insert((job.submitted_at, job.id.clone()));
        }
        if job.state.is_active() {
            self.active.insert(job.user_id.clone(), job.id.clone());
        }
        let newer = self
            .latest
            .get(&job.user_id)
            .and_then(|id| self.jobs.get(id))
            .map_or(true, |current| current.submitted_at <= job.submitted_at);
        if newer {
            self.latest.insert(job.user_id.clone(), job.id.clone());
        }
        self.jobs.insert(job.id.clone(), job);
    }
}

/// Thread-safe job table with per-user and FIFO indexes.
#[derive(Debug)]
pub struct JobRegistry {
    inner: RwLock<Inner>,
    capacity: usize,
}

impl JobRegistry {
    /// Create a registry that holds at most `capacity` queued jobs.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Register a freshly submitted job.
    ///
    /// Fails with [`RejectionReason::UserBusy`] if the user already has an
    /// active job, or [`RejectionReason::QueueFull`] if the queue is at
    /// capacity. Both checks and the insert happen under one lock.
    pub fn create(&self, mut job: Job) -> Result<JobId, RejectionReason> {
        let mut inner = self.inner.write();

        if inner.active.contains_key(&job.user_id) {
            return Err(RejectionReason::UserBusy);
        }
        if inner.queued.len() >= self.capacity {
            return Err(RejectionReason::QueueFull);
        }

        job.state = JobState::Queued;
        let id = job.id.clone();
        debug!(job_id = %id, user_id = %job.user_id, "Job registered");
        inner.insert(job);
        Ok(id)
    }

    /// Re-insert a job loaded from the store, bypassing the capacity check.
    ///
    /// Fails with [`RejectionReason::UserBusy`] when the job is active and
    /// its user already owns another active job.
    pub fn restore(&self, job: Job) -> Result<(), RejectionReason> {
        let mut inner = self.inner.write();
        if inner.jobs.contains_key(&job.id) {
            warn!(job_id = %job.id, "Ignoring duplicate restore");
            return Ok(());
        }
        if job.state.is_active() && inner.active.contains_key(&job.user_id) {
            return Err(RejectionReason::UserBusy);
        }
        inner.insert(job);
        Ok(())
    }

    pub fn get(&self, job_id: &JobId) -> Option<Job> {
        self.inner.read().jobs.get(job_id).cloned()
    }

    /// Compare-and-swap the job's state from `from` to `to`.
    ///
    /// Returns `false` if the job is missing, is not in `from`, or the edge
    /// is not part of the state machine.
    pub fn transition(&self, job_id: &JobId, from: JobState, to: JobState) -> bool {
        self.transition_with(job_id, from, to, |_| {}).is_some()
    }

    /// [`transition`](Self::transition) that also applies `mutate` to the
    /// job under the same lock, so readers never see the new state without
    /// the accompanying fields. Returns the updated job on success.
    pub fn transition_with<F>(&self, job_id: &JobId, from: JobState, to: JobState, mutate: F) -> Option<Job>
    where
        F: FnOnce(&mut Job),
    {
        if !from.can_transition_to(to) {
            return None;
        }

        let mut guard = self.inner.write();
        let inner = &mut *guard;
        let job = inner.jobs.get_mut(job_id)?;
        if job.state != from {
            return None;
        }

        if from == JobState::Queued {
            inner.queued.remove(&(job.submitted_at, job.id.clone()));
        }
        if to == JobState::Queued {
            inner.queued.insert((job.submitted_at, job.id.clone()));
        }
        if to.is_terminal() && inner.active.get(&job.user_id) == Some(&job.id) {
            inner.active.remove(&job.user_id);
        }

        job.set_state(to, Utc::now());
        mutate(job);
        debug!(job_id = %job_id, from = %from, to = %to, "Job transitioned");
        Some(job.clone())
    }

    /// Mutate non-state fields, provided the job is still in `expected`.
    pub fn update_if<F>(&self, job_id: &JobId, expected: JobState, mutate: F) -> Option<Job>
    where
        F: FnOnce(&mut Job),
    {
        let mut inner = self.inner.write();
        let job = inner.jobs.get_mut(job_id)?;
        if job.state != expected {
            return None;
        }
        let state = job.state;
        let submitted_at = job.submitted_at;
        mutate(job);
        // State and FIFO key are owned by transition().
        job.state = state;
        job.submitted_at = submitted_at;
        Some(job.clone())
    }

    /// Record progress on a running job.
    pub fn update_progress(&self, job_id: &JobId, progress: u8, stage: Option<&str>) -> Option<Job> {
        self.update_if(job_id, JobState::Running, |job| job.set_progress(progress, stage))
    }

    /// Oldest queued job by `(submitted_at, id)`.
    pub fn oldest_queued(&self) -> Option<Job> {
        let inner = self.inner.read();
        inner
            .queued
            .first()
            .and_then(|(_, id)| inner.jobs.get(id))
            .cloned()
    }

    /// 1-based position of a queued job in dispatch order.
    pub fn queue_position(&self, job_id: &JobId) -> Option<usize> {
        let inner = self.inner.read();
        inner
            .queued
            .iter()
            .position(|(_, id)| id == job_id)
            .map(|idx| idx + 1)
    }

    /// The user's queued or running job, if any.
    pub fn active_job(&self, user_id: &str) -> Option<Job> {
        let inner = self.inner.read();
        inner.active.get(user_id).and_then(|id| inner.jobs.get(id)).cloned()
    }

    /// The user's most recently submitted job still held in memory.
    pub fn latest_job(&self, user_id: &str) -> Option<Job> {
        let inner = self.inner.read();
        inner.latest.get(user_id).and_then(|id| inner.jobs.get(id)).cloned()
    }

    /// Point-in-time copy of every job.
    pub fn jobs(&self) -> Vec<Job> {
        self.inner.read().jobs.values().cloned().collect()
    }

    /// Queued job IDs in dispatch order.
    pub fn queued_ids(&self) -> Vec<JobId> {
        self.inner.read().queued.iter().map(|(_, id)| id.clone()).collect()
    }

    pub fn count_in(&self, state: JobState) -> usize {
        let inner = self.inner.read();
        match state {
            JobState::Queued => inner.queued.len(),
            _ => inner.jobs.values().filter(|job| job.state == state).count(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget terminal jobs that finished before `cutoff`.
    pub fn evict_finished(&self, cutoff: DateTime<Utc>) -> Vec<JobId> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;

        let expired: Vec<JobId> = inner
            .jobs
            .values()
            .filter(|job| job.is_terminal() && job.finished_at.unwrap_or(job.updated_at) < cutoff)
            .map(|job| job.id.clone())
            .collect();

        for id in &expired {
            if let Some(job) = inner.jobs.remove(id) {
                if inner.latest.get(&job.user_id) == Some(id) {
                    inner.latest.remove(&job.user_id);
                }
            }
        }
        expired
    }
}
