//! Coordinator scenarios against scripted in-process stages.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio_test::{assert_err, assert_ok};

use vsum_models::{FailureCategory, Job, JobId, JobRequest, JobState, OutputFormat};
use vsum_queue::{
    JobStore, MemoryStore, QueueConfig, RateWindowRecord, RejectionReason, StoreBackend, StoreError,
    StoreResult,
};
use vsum_stages::{
    AccessGate, ArtifactRef, DeliverySink, Renderer, ResolvedVideo, Resolver, StageContext, StageError,
    StageResult, StageSet, StructuredSummary, Summarizer, VideoMetadata,
};
use vsum_worker::{Coordinator, GatePolicy, StagePolicies, StagePolicy, SubmitError, WorkerConfig};

const VIDEO: &str = "https://www.youtube.com/watch?v=dQw4w9WgXcQ";

#[derive(Default)]
struct Script {
    /// Resolver answers "unavailable" this many times before succeeding.
    transient_failures: AtomicU32,
    /// Resolver refuses every video.
    reject: AtomicBool,
    resolve_delay: Duration,
    render_delay: Duration,
    /// When set, the resolver waits for a permit before returning.
    hold: Option<Arc<Semaphore>>,
    fail_delivery: bool,
    deliver_delay: Duration,
}

#[derive(Default)]
struct FakeStages {
    script: Script,
    resolved: Mutex<Vec<String>>,
    summarized: Mutex<Vec<String>>,
    delivered: Mutex<Vec<String>>,
    delivery_attempts: AtomicU32,
}

#[async_trait]
impl Resolver for FakeStages {
    async fn resolve(&self, ctx: &StageContext, _reference: &str) -> StageResult<ResolvedVideo> {
        self.resolved.lock().push(ctx.user_id.clone());
        if let Some(hold) = &self.script.hold {
            hold.acquire()
                .await
                .map_err(|_| StageError::unavailable("hold closed"))?
                .forget();
        }
        if !self.script.resolve_delay.is_zero() {
            tokio::time::sleep(self.script.resolve_delay).await;
        }
        if self.script.reject.load(Ordering::SeqCst) {
            return Err(StageError::rejected("video is private"));
        }
        if self
            .script
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StageError::unavailable("upstream 502"));
        }
        Ok(ResolvedVideo {
            transcript: "never gonna give you up".to_string(),
            metadata: VideoMetadata::default(),
        })
    }
}

#[async_trait]
impl Summarizer for FakeStages {
    async fn summarize(
        &self,
        ctx: &StageContext,
        transcript: &str,
        _metadata: &VideoMetadata,
    ) -> StageResult<StructuredSummary> {
        self.summarized.lock().push(ctx.user_id.clone());
        Ok(StructuredSummary {
            title: "Summary".to_string(),
            overview: transcript.to_string(),
            ..StructuredSummary::default()
        })
    }
}

#[async_trait]
impl Renderer for FakeStages {
    async fn render(
        &self,
        ctx: &StageContext,
        _summary: &StructuredSummary,
        format: OutputFormat,
    ) -> StageResult<ArtifactRef> {
        if !self.script.render_delay.is_zero() {
            tokio::time::sleep(self.script.render_delay).await;
        }
        Ok(ArtifactRef::new(format!("mem://{}.{}", ctx.job_id, format)))
    }
}

#[async_trait]
impl DeliverySink for FakeStages {
    async fn deliver(&self, _ctx: &StageContext, user_id: &str, _artifact: &ArtifactRef) -> StageResult<()> {
        self.delivery_attempts.fetch_add(1, Ordering::SeqCst);
        if !self.script.deliver_delay.is_zero() {
            tokio::time::sleep(self.script.deliver_delay).await;
        }
        if self.script.fail_delivery {
            return Err(StageError::rejected("chat not found"));
        }
        self.delivered.lock().push(user_id.to_string());
        Ok(())
    }
}

struct FixedGate(Option<bool>);

#[async_trait]
impl AccessGate for FixedGate {
    async fn allows(&self, _user_id: &str) -> StageResult<bool> {
        self.0.ok_or_else(|| StageError::unavailable("billing service down"))
    }
}

/// A store that is never reachable.
struct DownStore;

#[async_trait]
impl JobStore for DownStore {
    fn backend(&self) -> StoreBackend {
        StoreBackend::Redis
    }

    async fn ping(&self) -> StoreResult<()> {
        Err(StoreError::unavailable("connection refused"))
    }

    async fn put(&self, _job: &Job) -> StoreResult<()> {
        Err(StoreError::unavailable("connection refused"))
    }

    async fn get(&self, job_id: &JobId) -> StoreResult<Job> {
        Err(StoreError::NotFound(job_id.clone()))
    }

    async fn list_by_state(&self, _state: JobState) -> StoreResult<Vec<Job>> {
        Err(StoreError::unavailable("connection refused"))
    }

    async fn delete(&self, _job_id: &JobId) -> StoreResult<()> {
        Err(StoreError::unavailable("connection refused"))
    }

    async fn put_rate_window(&self, _record: &RateWindowRecord, _ttl: Duration) -> StoreResult<()> {
        Err(StoreError::unavailable("connection refused"))
    }

    async fn list_rate_windows(&self) -> StoreResult<Vec<RateWindowRecord>> {
        Err(StoreError::unavailable("connection refused"))
    }
}

/// A memory store that remembers the state of every job it was asked to put.
#[derive(Default)]
struct RecordingStore {
    inner: MemoryStore,
    puts: Mutex<Vec<(JobId, JobState)>>,
}

impl RecordingStore {
    fn states_of(&self, job_id: &JobId) -> Vec<JobState> {
        self.puts
            .lock()
            .iter()
            .filter(|(id, _)| id == job_id)
            .map(|(_, state)| *state)
            .collect()
    }
}

#[async_trait]
impl JobStore for RecordingStore {
    fn backend(&self) -> StoreBackend {
        self.inner.backend()
    }

    async fn ping(&self) -> StoreResult<()> {
        self.inner.ping().await
    }

    async fn put(&self, job: &Job) -> StoreResult<()> {
        self.puts.lock().push((job.id.clone(), job.state));
        self.inner.put(job).await
    }

    async fn get(&self, job_id: &JobId) -> StoreResult<Job> {
        self.inner.get(job_id).await
    }

    async fn list_by_state(&self, state: JobState) -> StoreResult<Vec<Job>> {
        self.inner.list_by_state(state).await
    }

    async fn delete(&self, job_id: &JobId) -> StoreResult<()> {
        self.inner.delete(job_id).await
    }

    async fn put_rate_window(&self, record: &RateWindowRecord, ttl: Duration) -> StoreResult<()> {
        self.inner.put_rate_window(record, ttl).await
    }

    async fn list_rate_windows(&self) -> StoreResult<Vec<RateWindowRecord>> {
        self.inner.list_rate_windows().await
    }
}

fn queue_config() -> QueueConfig {
    QueueConfig {
        store_retry_interval: Duration::from_millis(50),
        ..QueueConfig::in_memory()
    }
}

fn worker_config(workers: usize) -> WorkerConfig {
    WorkerConfig {
        max_concurrent_jobs: workers,
        stages: StagePolicies::uniform(Duration::from_secs(5)),
        poll_interval: Duration::from_millis(20),
        delivery_backoff: Duration::from_millis(10),
        shutdown_timeout: Duration::from_secs(5),
        ..WorkerConfig::default()
    }
}

fn stage_set(fake: &Arc<FakeStages>) -> StageSet {
    StageSet {
        resolver: fake.clone(),
        summarizer: fake.clone(),
        renderer: fake.clone(),
        delivery: fake.clone(),
    }
}

fn coordinator(fake: &Arc<FakeStages>, queue: QueueConfig, worker: WorkerConfig) -> Coordinator {
    Coordinator::builder(queue, worker, Arc::new(MemoryStore::new()), stage_set(fake)).build()
}

async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..3000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn wait_for_state(coordinator: &Coordinator, job_id: &JobId, state: JobState) -> Job {
    wait_until(&format!("job {job_id} to become {state}"), || {
        coordinator.job(job_id).is_some_and(|job| job.state == state)
    })
    .await;
    coordinator.job(job_id).unwrap()
}

#[tokio::test]
async fn test_fourth_submission_in_window_is_rate_limited() {
    let fake = Arc::new(FakeStages::default());
    let queue = QueueConfig {
        rate_limit_messages: 3,
        rate_limit_window: Duration::from_secs(60),
        ..queue_config()
    };
    let coordinator = coordinator(&fake, queue, worker_config(1));

    for _ in 0..3 {
        let job_id = assert_ok!(coordinator.submit("alice", VIDEO, OutputFormat::Txt).await);
        assert!(coordinator.cancel(&job_id, "alice"));
    }

    let err = assert_err!(coordinator.submit("alice", VIDEO, OutputFormat::Txt).await);
    assert_eq!(err.rejection(), Some(RejectionReason::RateLimited));

    // Other users have their own window.
    assert_ok!(coordinator.submit("bob", VIDEO, OutputFormat::Txt).await);
}

#[tokio::test]
async fn test_one_active_job_per_user_and_queue_capacity() {
    let fake = Arc::new(FakeStages::default());
    let queue = QueueConfig {
        max_queue_size: 1,
        ..queue_config()
    };
    let coordinator = coordinator(&fake, queue, worker_config(1));

    assert_ok!(coordinator.submit("alice", VIDEO, OutputFormat::Txt).await);

    let busy = assert_err!(coordinator.submit("alice", VIDEO, OutputFormat::Pdf).await);
    assert_eq!(busy.rejection(), Some(RejectionReason::UserBusy));

    let full = assert_err!(coordinator.submit("bob", VIDEO, OutputFormat::Txt).await);
    assert_eq!(full.rejection(), Some(RejectionReason::QueueFull));
}

#[tokio::test]
async fn test_invalid_requests_are_rejected_before_admission() {
    let fake = Arc::new(FakeStages::default());
    let coordinator = Coordinator::builder(
        queue_config(),
        worker_config(1),
        Arc::new(MemoryStore::new()),
        stage_set(&fake),
    )
    .supported_formats(vec![OutputFormat::Txt])
    .build();

    let err = assert_err!(coordinator.submit("alice", "https://example.com/video", OutputFormat::Txt).await);
    assert!(matches!(err, SubmitError::Invalid(_)));

    let err = assert_err!(coordinator.submit("alice", VIDEO, OutputFormat::Pdf).await);
    assert!(matches!(err, SubmitError::Invalid(_)));

    let err = assert_err!(coordinator.submit("  ", VIDEO, OutputFormat::Txt).await);
    assert!(matches!(err, SubmitError::MissingUser));

    assert!(coordinator.registry().is_empty());
}

#[tokio::test]
async fn test_single_worker_runs_jobs_one_after_another() {
    let fake = Arc::new(FakeStages {
        script: Script {
            render_delay: Duration::from_millis(30),
            ..Script::default()
        },
        ..FakeStages::default()
    });
    let coordinator = coordinator(&fake, queue_config(), worker_config(1));
    coordinator.start();

    let first = assert_ok!(coordinator.submit("alice", VIDEO, OutputFormat::Txt).await);
    let second = assert_ok!(coordinator.submit("bob", VIDEO, OutputFormat::Docx).await);

    let first = wait_for_state(&coordinator, &first, JobState::Completed).await;
    let second = wait_for_state(&coordinator, &second, JobState::Completed).await;

    assert!(second.started_at.unwrap() > first.finished_at.unwrap());
    assert_eq!(first.progress, 100);
    assert!(first.result.as_deref().unwrap().ends_with(".txt"));
    assert!(second.result.as_deref().unwrap().ends_with(".docx"));

    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_running_jobs_never_exceed_worker_count() {
    let hold = Arc::new(Semaphore::new(0));
    let fake = Arc::new(FakeStages {
        script: Script {
            hold: Some(hold.clone()),
            ..Script::default()
        },
        ..FakeStages::default()
    });
    let coordinator = coordinator(&fake, queue_config(), worker_config(2));
    coordinator.start();

    let mut ids = Vec::new();
    for user in ["u1", "u2", "u3", "u4"] {
        ids.push(assert_ok!(coordinator.submit(user, VIDEO, OutputFormat::Txt).await));
    }

    let registry = coordinator.registry();
    wait_until("two jobs to start", || fake.resolved.lock().len() == 2).await;
    // Give the dispatcher a chance to overshoot.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(registry.count_in(JobState::Running), 2);
    assert_eq!(registry.count_in(JobState::Queued), 2);
    assert_eq!(fake.resolved.lock().len(), 2);

    hold.add_permits(ids.len());
    for id in &ids {
        wait_for_state(&coordinator, id, JobState::Completed).await;
    }
    assert_eq!(fake.resolved.lock().len(), 4);

    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_dispatch_is_fifo() {
    let fake = Arc::new(FakeStages::default());
    let coordinator = coordinator(&fake, queue_config(), worker_config(1));

    let mut ids = Vec::new();
    for user in ["u1", "u2", "u3"] {
        ids.push(assert_ok!(coordinator.submit(user, VIDEO, OutputFormat::Txt).await));
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    coordinator.start();

    for id in &ids {
        wait_for_state(&coordinator, id, JobState::Completed).await;
    }
    assert_eq!(*fake.resolved.lock(), vec!["u1", "u2", "u3"]);

    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_transient_failures_are_retried_until_completion() {
    let fake = Arc::new(FakeStages {
        script: Script {
            transient_failures: AtomicU32::new(2),
            ..Script::default()
        },
        ..FakeStages::default()
    });
    let coordinator = coordinator(&fake, queue_config(), worker_config(1));
    coordinator.start();

    let job_id = assert_ok!(coordinator.submit("alice", VIDEO, OutputFormat::Pdf).await);
    let job = wait_for_state(&coordinator, &job_id, JobState::Completed).await;

    assert_eq!(job.retry_count, 2);
    assert!(job.result.is_some());
    assert_eq!(fake.resolved.lock().len(), 3);

    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_exhausted_retries_fail_as_unavailable() {
    let fake = Arc::new(FakeStages {
        script: Script {
            transient_failures: AtomicU32::new(10),
            ..Script::default()
        },
        ..FakeStages::default()
    });
    let coordinator = coordinator(&fake, queue_config(), worker_config(1));
    coordinator.start();

    let job_id = assert_ok!(coordinator.submit("alice", VIDEO, OutputFormat::Txt).await);
    let job = wait_for_state(&coordinator, &job_id, JobState::Failed).await;

    assert_eq!(job.retry_count, 2);
    assert_eq!(job.failure, Some(FailureCategory::Unavailable));
    assert!(job.result.is_none());

    let status = coordinator.status().status_of("alice").unwrap();
    let message = status.failure_message.unwrap();
    assert!(!message.contains("502"));

    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_permanent_failure_is_not_retried() {
    let fake = Arc::new(FakeStages {
        script: Script {
            reject: AtomicBool::new(true),
            ..Script::default()
        },
        ..FakeStages::default()
    });
    let coordinator = coordinator(&fake, queue_config(), worker_config(1));
    coordinator.start();

    let job_id = assert_ok!(coordinator.submit("alice", VIDEO, OutputFormat::Txt).await);
    let job = wait_for_state(&coordinator, &job_id, JobState::Failed).await;

    assert_eq!(job.retry_count, 0);
    assert_eq!(job.failure, Some(FailureCategory::Rejected));
    assert_eq!(fake.resolved.lock().len(), 1);

    // The user may submit again once the job is terminal.
    assert_ok!(coordinator.submit("alice", VIDEO, OutputFormat::Txt).await);

    coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_timeout_on_non_retryable_stage_fails_job() {
    let fake = Arc::new(FakeStages {
        script: Script {
            render_delay: Duration::from_secs(60),
            ..Script::default()
        },
        ..FakeStages::default()
    });
    let mut worker = worker_config(1);
    worker.stages = StagePolicies::uniform(Duration::from_secs(1));
    assert!(!worker.stages.render.retryable);
    let coordinator = coordinator(&fake, queue_config(), worker);
    coordinator.start();

    let job_id = assert_ok!(coordinator.submit("alice", VIDEO, OutputFormat::Txt).await);
    let job = wait_for_state(&coordinator, &job_id, JobState::Failed).await;

    assert_eq!(job.failure, Some(FailureCategory::Timeout));
    assert_eq!(job.retry_count, 0);

    coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_timeout_on_retryable_stage_requeues_up_to_bound() {
    let fake = Arc::new(FakeStages {
        script: Script {
            resolve_delay: Duration::from_secs(60),
            ..Script::default()
        },
        ..FakeStages::default()
    });
    let mut worker = worker_config(1);
    worker.stages = StagePolicies::uniform(Duration::from_secs(1));
    let coordinator = coordinator(&fake, queue_config(), worker);
    coordinator.start();

    let job_id = assert_ok!(coordinator.submit("alice", VIDEO, OutputFormat::Txt).await);
    let job = wait_for_state(&coordinator, &job_id, JobState::Failed).await;

    assert_eq!(job.failure, Some(FailureCategory::Timeout));
    assert_eq!(job.retry_count, 2);
    assert_eq!(fake.resolved.lock().len(), 3);

    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_cancelled_queued_job_never_runs() {
    let hold = Arc::new(Semaphore::new(0));
    let fake = Arc::new(FakeStages {
        script: Script {
            hold: Some(hold.clone()),
            ..Script::default()
        },
        ..FakeStages::default()
    });
    let coordinator = coordinator(&fake, queue_config(), worker_config(1));
    coordinator.start();

    let first = assert_ok!(coordinator.submit("alice", VIDEO, OutputFormat::Txt).await);
    wait_for_state(&coordinator, &first, JobState::Running).await;
    let second = assert_ok!(coordinator.submit("bob", VIDEO, OutputFormat::Txt).await);

    assert!(!coordinator.cancel(&second, "mallory"));
    assert!(coordinator.cancel(&second, "bob"));
    assert_eq!(coordinator.job(&second).unwrap().state, JobState::Cancelled);

    hold.add_permits(1);
    wait_for_state(&coordinator, &first, JobState::Completed).await;

    assert_eq!(*fake.resolved.lock(), vec!["alice"]);
    assert!(!coordinator.cancel(&second, "bob"));

    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_running_job_is_cancelled_at_next_stage_boundary() {
    let hold = Arc::new(Semaphore::new(0));
    let fake = Arc::new(FakeStages {
        script: Script {
            hold: Some(hold.clone()),
            ..Script::default()
        },
        ..FakeStages::default()
    });
    let coordinator = coordinator(&fake, queue_config(), worker_config(1));
    coordinator.start();

    let job_id = assert_ok!(coordinator.submit("alice", VIDEO, OutputFormat::Txt).await);
    wait_for_state(&coordinator, &job_id, JobState::Running).await;
    wait_until("resolver to be called", || !fake.resolved.lock().is_empty()).await;

    assert_eq!(coordinator.cancel_active("alice"), Some(job_id.clone()));
    // The stage in flight is not interrupted.
    assert_eq!(coordinator.job(&job_id).unwrap().state, JobState::Running);

    hold.add_permits(1);
    let job = wait_for_state(&coordinator, &job_id, JobState::Cancelled).await;

    assert!(job.result.is_none());
    assert!(fake.summarized.lock().is_empty());

    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_jobs_complete_while_store_is_down() {
    let fake = Arc::new(FakeStages::default());
    let queue = QueueConfig {
        store_write_retries: 0,
        ..queue_config()
    };
    let coordinator =
        Coordinator::builder(queue, worker_config(2), Arc::new(DownStore), stage_set(&fake)).build();
    coordinator.start();

    let first = assert_ok!(coordinator.submit("alice", VIDEO, OutputFormat::Txt).await);
    let second = assert_ok!(coordinator.submit("bob", VIDEO, OutputFormat::Pdf).await);

    wait_for_state(&coordinator, &first, JobState::Completed).await;
    wait_for_state(&coordinator, &second, JobState::Completed).await;

    let parked = coordinator.shutdown().await;
    assert!(parked > 0);
}

#[tokio::test]
async fn test_completed_job_is_delivered() {
    let fake = Arc::new(FakeStages::default());
    let coordinator = coordinator(&fake, queue_config(), worker_config(2));
    coordinator.start();

    let job_id = assert_ok!(coordinator.submit("alice", VIDEO, OutputFormat::Docx).await);
    wait_for_state(&coordinator, &job_id, JobState::Completed).await;
    wait_until("delivery", || coordinator.job(&job_id).is_some_and(|job| job.delivered)).await;

    assert_eq!(*fake.delivered.lock(), vec!["alice"]);

    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_delivery_failure_keeps_job_completed() {
    let fake = Arc::new(FakeStages {
        script: Script {
            fail_delivery: true,
            ..Script::default()
        },
        ..FakeStages::default()
    });
    let coordinator = coordinator(&fake, queue_config(), worker_config(1));
    coordinator.start();

    let job_id = assert_ok!(coordinator.submit("alice", VIDEO, OutputFormat::Txt).await);
    wait_for_state(&coordinator, &job_id, JobState::Completed).await;
    coordinator.shutdown().await;

    let job = coordinator.job(&job_id).unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert!(!job.delivered);
    assert!(job.result.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_delivery_timeout_is_not_retried_when_stage_is_not_retryable() {
    let fake = Arc::new(FakeStages {
        script: Script {
            deliver_delay: Duration::from_secs(60),
            ..Script::default()
        },
        ..FakeStages::default()
    });
    let mut worker = worker_config(1);
    worker.stages.deliver = StagePolicy {
        timeout: Duration::from_secs(1),
        retryable: false,
    };
    let coordinator = coordinator(&fake, queue_config(), worker);
    coordinator.start();

    let job_id = assert_ok!(coordinator.submit("alice", VIDEO, OutputFormat::Txt).await);
    wait_for_state(&coordinator, &job_id, JobState::Completed).await;
    coordinator.shutdown().await;

    assert_eq!(fake.delivery_attempts.load(Ordering::SeqCst), 1);
    let job = coordinator.job(&job_id).unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert!(!job.delivered);
}

#[tokio::test(start_paused = true)]
async fn test_delivery_timeout_is_retried_when_stage_is_retryable() {
    let fake = Arc::new(FakeStages {
        script: Script {
            deliver_delay: Duration::from_secs(60),
            ..Script::default()
        },
        ..FakeStages::default()
    });
    let mut worker = worker_config(1);
    worker.stages.deliver = StagePolicy {
        timeout: Duration::from_secs(1),
        retryable: true,
    };
    let attempts = worker.delivery_retries + 1;
    let coordinator = coordinator(&fake, queue_config(), worker);
    coordinator.start();

    let job_id = assert_ok!(coordinator.submit("alice", VIDEO, OutputFormat::Txt).await);
    wait_for_state(&coordinator, &job_id, JobState::Completed).await;
    coordinator.shutdown().await;

    assert_eq!(fake.delivery_attempts.load(Ordering::SeqCst), attempts);
    assert!(!coordinator.job(&job_id).unwrap().delivered);
}

#[tokio::test]
async fn test_completed_job_is_persisted_with_result() {
    let store = Arc::new(MemoryStore::new());
    let fake = Arc::new(FakeStages::default());
    let coordinator = Coordinator::builder(queue_config(), worker_config(1), store.clone(), stage_set(&fake)).build();
    coordinator.start();

    let job_id = assert_ok!(coordinator.submit("alice", VIDEO, OutputFormat::Pdf).await);
    let job = wait_for_state(&coordinator, &job_id, JobState::Completed).await;
    wait_until("delivery", || coordinator.job(&job_id).is_some_and(|job| job.delivered)).await;
    assert_eq!(coordinator.shutdown().await, 0);

    let stored = store.get(&job_id).await.unwrap();
    assert_eq!(stored.state, JobState::Completed);
    assert!(stored.result.is_some());
    assert_eq!(stored.result, job.result);
    assert!(stored.finished_at.is_some());
    assert!(stored.delivered);
}

#[tokio::test]
async fn test_store_sees_queued_before_running() {
    let store = Arc::new(RecordingStore::default());
    let fake = Arc::new(FakeStages::default());
    let coordinator = Coordinator::builder(queue_config(), worker_config(2), store.clone(), stage_set(&fake)).build();
    coordinator.start();

    let mut ids = Vec::new();
    for user in ["u1", "u2", "u3", "u4", "u5", "u6"] {
        ids.push(assert_ok!(coordinator.submit(user, VIDEO, OutputFormat::Txt).await));
    }
    for id in &ids {
        wait_for_state(&coordinator, id, JobState::Completed).await;
        wait_until("delivery", || coordinator.job(id).is_some_and(|job| job.delivered)).await;
    }
    assert_eq!(coordinator.shutdown().await, 0);

    for id in &ids {
        let states = store.states_of(id);
        assert_eq!(states.first(), Some(&JobState::Queued), "job {id}: {states:?}");
        assert_eq!(states.iter().filter(|s| **s == JobState::Queued).count(), 1, "job {id}: {states:?}");
        assert_eq!(states.last(), Some(&JobState::Completed), "job {id}: {states:?}");
        assert_eq!(store.get(id).await.unwrap().state, JobState::Completed);
    }
}

#[tokio::test]
async fn test_access_gate_policies() {
    let fake = Arc::new(FakeStages::default());
    let build = |gate: FixedGate, policy: GatePolicy| {
        let worker = WorkerConfig {
            gate_policy: policy,
            ..worker_config(1)
        };
        Coordinator::builder(queue_config(), worker, Arc::new(MemoryStore::new()), stage_set(&fake))
            .access_gate(Some(Arc::new(gate)))
            .build()
    };

    let open = build(FixedGate(None), GatePolicy::FailOpen);
    assert_ok!(open.submit("alice", VIDEO, OutputFormat::Txt).await);

    let closed = build(FixedGate(None), GatePolicy::FailClosed);
    let err = assert_err!(closed.submit("alice", VIDEO, OutputFormat::Txt).await);
    assert_eq!(err.rejection(), Some(RejectionReason::AccessDenied));

    let denied = build(FixedGate(Some(false)), GatePolicy::FailOpen);
    let err = assert_err!(denied.submit("alice", VIDEO, OutputFormat::Txt).await);
    assert_eq!(err.rejection(), Some(RejectionReason::AccessDenied));
}

#[tokio::test]
async fn test_queued_status_reports_position_and_wait() {
    let fake = Arc::new(FakeStages::default());
    let coordinator = coordinator(&fake, queue_config(), worker_config(2));

    assert_ok!(coordinator.submit("alice", VIDEO, OutputFormat::Txt).await);
    tokio::time::sleep(Duration::from_millis(2)).await;
    assert_ok!(coordinator.submit("bob", VIDEO, OutputFormat::Txt).await);

    let status = coordinator.status().status_of("bob").unwrap();
    assert_eq!(status.state, JobState::Queued);
    assert_eq!(status.position, Some(2));
    // 2 * 180s / 2 workers
    assert_eq!(status.estimated_wait_secs, Some(180));

    let snapshot = coordinator.status().snapshot();
    assert_eq!(snapshot.count(JobState::Queued), 2);
    assert_eq!(snapshot.active_users(), 2);
    assert!(coordinator.status().status_of("carol").is_none());
}

#[tokio::test]
async fn test_rehydrate_restores_queue_and_rate_windows() {
    let store = Arc::new(MemoryStore::new());
    let now = Utc::now();
    let request = || JobRequest::new(VIDEO, OutputFormat::Txt).unwrap();

    let mut was_running = Job::new("alice", request()).with_submitted_at(now - chrono::TimeDelta::seconds(30));
    was_running.set_state(JobState::Running, now - chrono::TimeDelta::seconds(20));
    let duplicate = Job::new("alice", request()).with_submitted_at(now - chrono::TimeDelta::seconds(10));
    let queued = Job::new("bob", request()).with_submitted_at(now - chrono::TimeDelta::seconds(5));
    for job in [&was_running, &duplicate, &queued] {
        store.put(job).await.unwrap();
    }
    store
        .put_rate_window(
            &RateWindowRecord {
                user_id: "carol".to_string(),
                timestamps: vec![now; 3],
            },
            Duration::from_secs(60),
        )
        .await
        .unwrap();

    let fake = Arc::new(FakeStages::default());
    let queue = QueueConfig {
        rate_limit_messages: 3,
        ..queue_config()
    };
    let coordinator = Coordinator::builder(queue, worker_config(1), store.clone(), stage_set(&fake)).build();

    let report = coordinator.rehydrate().await.unwrap();
    assert_eq!(report.restored, 2);
    assert_eq!(report.requeued, 1);
    assert_eq!(report.interrupted, 1);
    assert_eq!(report.rate_windows, 1);

    let failed = coordinator.job(&duplicate.id).unwrap();
    assert_eq!(failed.state, JobState::Failed);
    assert_eq!(failed.failure, Some(FailureCategory::Interrupted));
    assert_eq!(coordinator.registry().queued_ids(), vec![was_running.id.clone(), queued.id.clone()]);

    let err = assert_err!(coordinator.submit("carol", VIDEO, OutputFormat::Txt).await);
    assert_eq!(err.rejection(), Some(RejectionReason::RateLimited));

    coordinator.start();
    wait_for_state(&coordinator, &was_running.id, JobState::Completed).await;
    wait_for_state(&coordinator, &queued.id, JobState::Completed).await;

    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_job_running_at_shutdown_timeout_is_requeued_on_restart() {
    let store = Arc::new(MemoryStore::new());
    let hold = Arc::new(Semaphore::new(0));
    let fake = Arc::new(FakeStages {
        script: Script {
            hold: Some(hold.clone()),
            ..Script::default()
        },
        ..FakeStages::default()
    });
    let worker = WorkerConfig {
        shutdown_timeout: Duration::from_millis(100),
        ..worker_config(1)
    };
    let coordinator = Coordinator::builder(queue_config(), worker, store.clone(), stage_set(&fake)).build();
    coordinator.start();

    let job_id = assert_ok!(coordinator.submit("alice", VIDEO, OutputFormat::Txt).await);
    wait_for_state(&coordinator, &job_id, JobState::Running).await;
    wait_until("resolver to be called", || !fake.resolved.lock().is_empty()).await;

    // The resolver is still held when the timeout elapses.
    assert_eq!(coordinator.shutdown().await, 0);
    assert_eq!(store.get(&job_id).await.unwrap().state, JobState::Running);

    let restarted =
        Coordinator::builder(queue_config(), worker_config(1), store.clone(), stage_set(&fake)).build();
    let report = restarted.rehydrate().await.unwrap();
    assert_eq!(report.restored, 1);
    assert_eq!(report.requeued, 1);
    assert_eq!(report.interrupted, 0);

    assert_eq!(restarted.job(&job_id).unwrap().state, JobState::Queued);
    assert_eq!(restarted.registry().queued_ids(), vec![job_id.clone()]);
}

#[tokio::test]
async fn test_cleanup_evicts_finished_jobs() {
    let fake = Arc::new(FakeStages::default());
    let coordinator = coordinator(&fake, queue_config(), worker_config(1));

    let job_id = assert_ok!(coordinator.submit("alice", VIDEO, OutputFormat::Txt).await);
    assert!(coordinator.cancel(&job_id, "alice"));

    assert_eq!(coordinator.cleanup_once(Utc::now()), 0);
    let later = Utc::now() + chrono::TimeDelta::hours(2);
    assert_eq!(coordinator.cleanup_once(later), 1);
    assert!(coordinator.job(&job_id).is_none());
}

#[tokio::test]
async fn test_submit_after_shutdown_is_refused() {
    let fake = Arc::new(FakeStages::default());
    let coordinator = coordinator(&fake, queue_config(), worker_config(1));
    coordinator.start();

    assert_eq!(coordinator.shutdown().await, 0);
    assert!(coordinator.is_shutting_down());

    let err = assert_err!(coordinator.submit("alice", VIDEO, OutputFormat::Txt).await);
    assert!(matches!(err, SubmitError::ShuttingDown));
}
