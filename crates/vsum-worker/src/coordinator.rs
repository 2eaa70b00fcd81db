//! Queue coordinator.
//!
//! Owns the registry, the rate limiter and the worker slots. `submit`
//! admits jobs without waiting on any processing; a single dispatch loop
//! hands the oldest queued job to a free slot, and each running job moves
//! through the pipeline on its own task. Every state change is a registry
//! CAS; the store only ever sees snapshots through the background writer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use tokio::sync::{watch, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn, Instrument};

use vsum_models::{FailureCategory, Job, JobId, JobRequest, JobState, OutputFormat};
use vsum_queue::{
    metrics, retry_async_if, JobRegistry, JobStore, QueueConfig, RateLimiter, RateWindowRecord,
    RejectionReason, RetryConfig, StatusReporter, StoreBackend, StoreWriter, WriterConfig,
};
use vsum_stages::{AccessGate, ArtifactRef, StageError, StageFailure, StageKind, StageSet};

use crate::config::{GatePolicy, WorkerConfig};
use crate::error::{SubmitError, WorkerResult};
use crate::logging::JobLogger;
use crate::pipeline::{PipelineOutcome, StagePipeline, PROGRESS_STARTED};

/// What [`Coordinator::rehydrate`] recovered from the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RehydrateReport {
    /// Jobs put back into the registry as `Queued`
    pub restored: usize,
    /// Of those, jobs that were `Running` when the process stopped
    pub requeued: usize,
    /// Jobs failed because their user already had an active job
    pub interrupted: usize,
    /// Rate windows loaded into the limiter
    pub rate_windows: usize,
}

/// Builds a [`Coordinator`].
pub struct CoordinatorBuilder {
    queue_config: QueueConfig,
    config: WorkerConfig,
    store: Arc<dyn JobStore>,
    stages: StageSet,
    gate: Option<Arc<dyn AccessGate>>,
    supported_formats: Vec<OutputFormat>,
}

impl CoordinatorBuilder {
    /// Consult `gate` before admitting a submission.
    pub fn access_gate(mut self, gate: Option<Arc<dyn AccessGate>>) -> Self {
        self.gate = gate;
        self
    }

    /// Formats accepted by `submit`. Defaults to every format.
    pub fn supported_formats(mut self, formats: Vec<OutputFormat>) -> Self {
        self.supported_formats = formats;
        self
    }

    /// Create the coordinator and spawn its store writer.
    ///
    /// Must be called inside a Tokio runtime. Dispatch does not begin until
    /// [`Coordinator::start`].
    pub fn build(self) -> Coordinator {
        let workers = self.config.max_concurrent_jobs.max(1);
        let registry = Arc::new(JobRegistry::new(self.queue_config.max_queue_size));
        let (writer, _writer_task) =
            StoreWriter::spawn(Arc::clone(&self.store), WriterConfig::from_queue_config(&self.queue_config));
        let (shutdown, _) = watch::channel(false);

        let inner = Inner {
            limiter: RateLimiter::new(self.queue_config.rate_limit_messages, self.queue_config.rate_limit_window),
            status: StatusReporter::new(Arc::clone(&registry), workers, self.config.estimated_job_duration),
            registry,
            store: self.store,
            writer,
            pipeline: StagePipeline::new(self.stages, self.config.stages.clone()),
            gate: self.gate,
            supported_formats: self.supported_formats,
            slots: Arc::new(Semaphore::new(workers)),
            wake: Notify::new(),
            running: Mutex::new(HashMap::new()),
            shutdown,
            tasks: TaskTracker::new(),
            loops: Mutex::new(Vec::new()),
            queue_config: self.queue_config,
            config: self.config,
        };
        Coordinator { inner: Arc::new(inner) }
    }
}

struct Inner {
    queue_config: QueueConfig,
    config: WorkerConfig,
    registry: Arc<JobRegistry>,
    limiter: RateLimiter,
    status: StatusReporter,
    store: Arc<dyn JobStore>,
    writer: StoreWriter,
    pipeline: StagePipeline,
    gate: Option<Arc<dyn AccessGate>>,
    supported_formats: Vec<OutputFormat>,
    slots: Arc<Semaphore>,
    wake: Notify,
    /// Cancellation tokens of running jobs. Claiming, cancelling and leaving
    /// `Running` all happen under this lock.
    running: Mutex<HashMap<JobId, CancellationToken>>,
    shutdown: watch::Sender<bool>,
    tasks: TaskTracker,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

/// The queue coordinator. Cheap to clone; clones share one queue.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    pub fn builder(
        queue_config: QueueConfig,
        config: WorkerConfig,
        store: Arc<dyn JobStore>,
        stages: StageSet,
    ) -> CoordinatorBuilder {
        CoordinatorBuilder {
            queue_config,
            config,
            store,
            stages,
            gate: None,
            supported_formats: OutputFormat::ALL.to_vec(),
        }
    }

    /// The in-memory job registry.
    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.inner.registry
    }

    /// Read-only queue and per-user status.
    pub fn status(&self) -> &StatusReporter {
        &self.inner.status
    }

    /// The persistence backend behind the writer.
    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.inner.store
    }

    /// Which backend the writer persists to.
    pub fn store_backend(&self) -> StoreBackend {
        self.inner.writer.backend()
    }

    /// Worker settings this coordinator was built with.
    pub fn config(&self) -> &WorkerConfig {
        &self.inner.config
    }

    /// Queue settings this coordinator was built with.
    pub fn queue_config(&self) -> &QueueConfig {
        &self.inner.queue_config
    }

    /// Current snapshot of a job, if the registry still holds it.
    pub fn job(&self, job_id: &JobId) -> Option<Job> {
        self.inner.registry.get(job_id)
    }

    /// True once [`shutdown`](Self::shutdown) has been called.
    pub fn is_shutting_down(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    /// Spawn the dispatch loop and the cleanup sweep. Calling it twice is a no-op.
    pub fn start(&self) {
        let mut loops = self.inner.loops.lock();
        if !loops.is_empty() || self.is_shutting_down() {
            return;
        }

        loops.push(tokio::spawn(self.clone().dispatch_loop(self.inner.shutdown.subscribe())));
        loops.push(tokio::spawn(self.clone().cleanup_loop(self.inner.shutdown.subscribe())));

        info!(
            workers = self.inner.config.max_concurrent_jobs,
            capacity = self.inner.registry.capacity(),
            store = %self.store_backend(),
            "Coordinator started"
        );
    }

    /// Admit a new job for `user_id`.
    ///
    /// Validation happens first, then the access gate, then the rate
    /// limiter, then the registry's per-user and capacity checks. Never
    /// waits on processing.
    pub async fn submit(&self, user_id: &str, reference: &str, format: OutputFormat) -> Result<JobId, SubmitError> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(SubmitError::MissingUser);
        }
        let request = JobRequest::new(reference, format)?.ensure_supported(&self.inner.supported_formats)?;
        if self.is_shutting_down() {
            return Err(SubmitError::ShuttingDown);
        }

        self.check_access(user_id).await.map_err(|reason| reject(user_id, reason))?;

        if !self.inner.limiter.admit(user_id, Utc::now()) {
            return Err(reject(user_id, RejectionReason::RateLimited));
        }
        self.persist_rate_window(user_id);

        let job = Job::new(user_id, request);
        let created = {
            // Claims take this lock too, so the Queued snapshot is queued on
            // the writer before any Running snapshot of the same job.
            let _claims = self.inner.running.lock();
            let created = self.inner.registry.create(job.clone());
            if created.is_ok() {
                self.inner.writer.put(&job);
            }
            created
        };
        let job_id = created.map_err(|reason| reject(user_id, reason))?;

        info!(
            job_id = %job_id,
            user_id = %user_id,
            video_id = %job.video_id,
            format = %job.format,
            "Job submitted"
        );
        metrics::record_job_submitted();
        self.update_gauges();
        self.inner.wake.notify_one();
        Ok(job_id)
    }

    /// Cancel a job on behalf of `user_id`.
    ///
    /// A queued job is cancelled immediately. A running job is flagged and
    /// becomes `Cancelled` at its next stage boundary. Returns `false` when
    /// the job is unknown, owned by someone else, or already finished.
    pub fn cancel(&self, job_id: &JobId, user_id: &str) -> bool {
        match self.inner.registry.get(job_id) {
            Some(job) if job.user_id == user_id => {}
            _ => return false,
        }

        let running = self.inner.running.lock();
        if let Some(job) = self
            .inner
            .registry
            .transition_with(job_id, JobState::Queued, JobState::Cancelled, |_| {})
        {
            drop(running);
            self.inner.writer.put(&job);
            metrics::record_job_cancelled();
            self.update_gauges();
            info!(job_id = %job_id, user_id = %user_id, "Queued job cancelled");
            return true;
        }

        match running.get(job_id) {
            Some(token) => {
                token.cancel();
                info!(job_id = %job_id, user_id = %user_id, "Cancellation requested for running job");
                true
            }
            None => false,
        }
    }

    /// Cancel whatever job `user_id` currently has active.
    pub fn cancel_active(&self, user_id: &str) -> Option<JobId> {
        let job = self.inner.registry.active_job(user_id)?;
        self.cancel(&job.id, user_id).then_some(job.id)
    }

    /// Rebuild the registry and the limiter from the store.
    ///
    /// Jobs that were running when the previous process stopped go back to
    /// the queue. If a user ends up with more than one active job, the
    /// oldest one wins and the rest fail as `Interrupted`.
    pub async fn rehydrate(&self) -> WorkerResult<RehydrateReport> {
        let mut report = RehydrateReport::default();
        let now = Utc::now();

        let mut jobs = self.inner.store.list_by_state(JobState::Running).await?;
        jobs.extend(self.inner.store.list_by_state(JobState::Queued).await?);
        jobs.sort_by(|a, b| (a.submitted_at, &a.id).cmp(&(b.submitted_at, &b.id)));

        for mut job in jobs {
            let was_running = job.state == JobState::Running;
            if was_running {
                job.set_state(JobState::Queued, now);
            }

            match self.inner.registry.restore(job.clone()) {
                Ok(()) => {
                    report.restored += 1;
                    if was_running {
                        report.requeued += 1;
                        self.inner.writer.put(&job);
                    }
                }
                Err(_) => {
                    warn!(job_id = %job.id, user_id = %job.user_id, "User already has an active job, failing duplicate");
                    job.set_state(JobState::Failed, now);
                    job.failure = Some(FailureCategory::Interrupted);
                    job.error_detail = Some("duplicate active job found on restart".to_string());
                    self.inner.writer.put(&job);
                    if self.inner.registry.restore(job).is_ok() {
                        report.interrupted += 1;
                    }
                }
            }
        }

        for record in self.inner.store.list_rate_windows().await? {
            self.inner.limiter.restore(&record.user_id, record.timestamps, now);
            report.rate_windows += 1;
        }

        info!(
            restored = report.restored,
            requeued = report.requeued,
            interrupted = report.interrupted,
            rate_windows = report.rate_windows,
            "Rehydrated from store"
        );
        self.update_gauges();
        self.inner.wake.notify_one();
        Ok(report)
    }

    /// Evict finished jobs older than the retention period and idle rate
    /// windows. Returns the number of evicted jobs.
    pub fn cleanup_once(&self, now: DateTime<Utc>) -> usize {
        let retention = TimeDelta::from_std(self.inner.queue_config.job_retention).unwrap_or(TimeDelta::hours(1));
        let cutoff = now.checked_sub_signed(retention).unwrap_or(DateTime::<Utc>::MIN_UTC);

        let evicted = self.inner.registry.evict_finished(cutoff);
        for job_id in &evicted {
            self.inner.writer.delete(job_id);
        }
        let idle = self.inner.limiter.purge_idle(now);

        if !evicted.is_empty() || idle > 0 {
            debug!(evicted = evicted.len(), idle_windows = idle, "Cleanup sweep");
        }
        evicted.len()
    }

    /// Stop dispatching and wait for running jobs.
    ///
    /// Jobs still running when the timeout elapses stay `Running` in the
    /// store and are requeued by the next [`rehydrate`](Self::rehydrate).
    /// Returns the number of store writes that could not be flushed.
    pub async fn shutdown(&self) -> usize {
        if self.inner.shutdown.send_replace(true) {
            return self.inner.writer.flush().await;
        }
        info!("Shutting down coordinator");

        let loops = std::mem::take(&mut *self.inner.loops.lock());
        for handle in loops {
            if let Err(e) = handle.await {
                warn!(error = %e, "Coordinator loop ended abnormally");
            }
        }

        self.inner.tasks.close();
        if tokio::time::timeout(self.inner.config.shutdown_timeout, self.inner.tasks.wait())
            .await
            .is_err()
        {
            warn!(
                running = self.inner.registry.count_in(JobState::Running),
                "Shutdown timeout elapsed, leaving running jobs for the next start"
            );
        }

        let parked = self.inner.writer.flush().await;
        if parked > 0 {
            warn!(parked, "Store writes still pending at shutdown");
        }
        info!("Coordinator stopped");
        parked
    }

    async fn check_access(&self, user_id: &str) -> Result<(), RejectionReason> {
        let Some(gate) = &self.inner.gate else {
            return Ok(());
        };

        match gate.allows(user_id).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(RejectionReason::AccessDenied),
            Err(e) => match self.inner.config.gate_policy {
                GatePolicy::FailOpen => {
                    warn!(user_id = %user_id, error = %e, "Access gate failed, admitting");
                    Ok(())
                }
                GatePolicy::FailClosed => {
                    warn!(user_id = %user_id, error = %e, "Access gate failed, rejecting");
                    Err(RejectionReason::AccessDenied)
                }
            },
        }
    }

    fn persist_rate_window(&self, user_id: &str) {
        let record = RateWindowRecord {
            user_id: user_id.to_string(),
            timestamps: self.inner.limiter.snapshot(user_id),
        };
        self.inner.writer.put_rate_window(record, self.inner.limiter.window());
    }

    fn update_gauges(&self) {
        metrics::set_queue_length(self.inner.registry.count_in(JobState::Queued));
        metrics::set_jobs_running(self.inner.registry.count_in(JobState::Running));
    }

    async fn dispatch_loop(self, mut shutdown_rx: watch::Receiver<bool>) {
        debug!("Dispatch loop started");
        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let permit = tokio::select! {
                _ = shutdown_rx.changed() => break,
                permit = Arc::clone(&self.inner.slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let claimed = loop {
                if let Some(claimed) = self.try_claim() {
                    break Some(claimed);
                }
                tokio::select! {
                    _ = shutdown_rx.changed() => break None,
                    _ = self.inner.wake.notified() => {}
                    _ = tokio::time::sleep(self.inner.config.poll_interval) => {}
                }
            };
            let Some((job, token)) = claimed else {
                break;
            };

            let this = self.clone();
            self.inner.tasks.spawn(async move { this.run_job(job, token, permit).await });
        }
        debug!("Dispatch loop stopped");
    }

    async fn cleanup_loop(self, mut shutdown_rx: watch::Receiver<bool>) {
        let period = self.inner.config.cleanup_interval.max(Duration::from_secs(1));
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = interval.tick() => {
                    self.cleanup_once(Utc::now());
                }
            }
        }
    }

    /// Move the oldest queued job to `Running` and register its token.
    fn try_claim(&self) -> Option<(Job, CancellationToken)> {
        let mut running = self.inner.running.lock();
        loop {
            let candidate = self.inner.registry.oldest_queued()?;
            let claimed = self.inner.registry.transition_with(
                &candidate.id,
                JobState::Queued,
                JobState::Running,
                |job| job.set_progress(PROGRESS_STARTED, Some(StageKind::Resolve.as_str())),
            );
            if let Some(job) = claimed {
                let token = CancellationToken::new();
                running.insert(job.id.clone(), token.clone());
                return Some((job, token));
            }
        }
    }

    async fn run_job(self, job: Job, token: CancellationToken, permit: OwnedSemaphorePermit) {
        let logger = JobLogger::new(&job, "summarize_video");
        let span = logger.create_span();

        async move {
            self.inner.writer.put(&job);
            self.update_gauges();
            logger.log_start(job.retry_count + 1);

            let outcome = self
                .inner
                .pipeline
                .run(&job, &token, &logger, |progress, stage| {
                    if let Some(updated) = self.inner.registry.update_progress(&job.id, progress, Some(stage.as_str())) {
                        self.inner.writer.put(&updated);
                    }
                })
                .await;

            let delivery = self.finish(&job, outcome, &logger);
            drop(permit);
            self.update_gauges();

            if let Some((completed, artifact)) = delivery {
                self.deliver(&completed, &artifact, &logger).await;
            }
        }
        .instrument(span)
        .await
    }

    /// Apply the pipeline outcome. Returns the completed job when delivery
    /// should run.
    fn finish(&self, job: &Job, outcome: PipelineOutcome, logger: &JobLogger) -> Option<(Job, ArtifactRef)> {
        match outcome {
            PipelineOutcome::Completed(artifact) => {
                let result = artifact.as_str().to_string();
                let done = self.leave_running(&job.id, JobState::Completed, |j| {
                    j.result = Some(result);
                    j.error_detail = None;
                })?;
                if done.state != JobState::Completed {
                    self.record_cancelled(logger);
                    return None;
                }
                let elapsed = (Utc::now() - job.started_at.unwrap_or(job.submitted_at))
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                metrics::record_job_completed(elapsed.as_secs_f64());
                logger.log_completion(artifact.as_str());
                Some((done, artifact))
            }
            PipelineOutcome::Cancelled => {
                if self.leave_running(&job.id, JobState::Cancelled, |_| {}).is_some() {
                    self.record_cancelled(logger);
                }
                None
            }
            PipelineOutcome::Failed { stage, error } => {
                self.handle_failure(job, stage, error, logger);
                None
            }
        }
    }

    fn handle_failure(&self, job: &Job, stage: StageKind, error: StageError, logger: &JobLogger) {
        let retries_left = job.retry_count < self.inner.config.max_retries;
        let (category, retry) = match error.failure() {
            StageFailure::Transient => (FailureCategory::Unavailable, retries_left),
            StageFailure::Timeout => (
                FailureCategory::Timeout,
                self.inner.pipeline.policy(stage).retryable && retries_left,
            ),
            StageFailure::Permanent => match error {
                StageError::Rejected(_) => (FailureCategory::Rejected, false),
                _ => (FailureCategory::Internal, false),
            },
        };
        let detail = format!("{stage}: {error}");

        if retry {
            let attempt = job.retry_count + 1;
            let requeued = self.leave_running(&job.id, JobState::Queued, |j| {
                j.retry_count = attempt;
                j.error_detail = Some(detail.clone());
            });
            match requeued {
                Some(requeued) if requeued.state == JobState::Queued => {
                    logger.log_retry(stage, attempt, &detail);
                    metrics::record_job_retried(stage.as_str());
                    self.inner.wake.notify_one();
                }
                Some(_) => self.record_cancelled(logger),
                None => {}
            }
            return;
        }

        let failed = self.leave_running(&job.id, JobState::Failed, |j| {
            j.failure = Some(category);
            j.error_detail = Some(detail.clone());
        });
        match failed {
            Some(failed) if failed.state == JobState::Failed => {
                logger.log_failure(stage, category, &detail);
                metrics::record_job_failed(category.as_str());
            }
            Some(_) => self.record_cancelled(logger),
            None => {}
        }
    }

    /// Leave `Running` for `to` and persist the result.
    ///
    /// If cancellation was requested while the job ran, the job becomes
    /// `Cancelled` instead and `mutate` is not applied.
    fn leave_running<F>(&self, job_id: &JobId, to: JobState, mutate: F) -> Option<Job>
    where
        F: FnOnce(&mut Job),
    {
        let mut running = self.inner.running.lock();
        let cancelled = running.remove(job_id).is_some_and(|token| token.is_cancelled());

        let updated = if cancelled && to != JobState::Cancelled {
            self.inner
                .registry
                .transition_with(job_id, JobState::Running, JobState::Cancelled, |_| {})
        } else {
            self.inner.registry.transition_with(job_id, JobState::Running, to, mutate)
        };
        drop(running);

        match &updated {
            Some(job) => self.inner.writer.put(job),
            None => warn!(job_id = %job_id, to = %to, "Job was no longer running"),
        }
        updated
    }

    fn record_cancelled(&self, logger: &JobLogger) {
        metrics::record_job_cancelled();
        logger.log_cancelled();
    }

    async fn deliver(&self, job: &Job, artifact: &ArtifactRef, logger: &JobLogger) {
        let retry = RetryConfig::new("delivery")
            .with_max_retries(self.inner.config.delivery_retries)
            .with_base_delay(self.inner.config.delivery_backoff);
        let pipeline = &self.inner.pipeline;
        let timeout_retryable = pipeline.policy(StageKind::Deliver).retryable;

        let result = retry_async_if(
            &retry,
            move || pipeline.deliver(job, artifact, logger),
            |e: &StageError| e.is_retryable() || (e.is_timeout() && timeout_retryable),
        )
        .await;

        match result.into_result() {
            Ok(()) => {
                if let Some(updated) = self
                    .inner
                    .registry
                    .update_if(&job.id, JobState::Completed, |j| j.delivered = true)
                {
                    self.inner.writer.put(&updated);
                }
                debug!(job_id = %job.id, "Artifact delivered");
            }
            Err(e) => {
                metrics::record_delivery_failure();
                logger.log_warning(&format!("delivery failed: {e}"));
            }
        }
    }
}

fn reject(user_id: &str, reason: RejectionReason) -> SubmitError {
    metrics::record_job_rejected(reason.as_str());
    info!(user_id = %user_id, reason = %reason, "Submission rejected");
    SubmitError::Rejected(reason)
}
