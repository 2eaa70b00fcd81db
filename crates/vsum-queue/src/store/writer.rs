//! Background writer that persists jobs without blocking the caller.
//!
//! Writes are queued on an unbounded channel and applied in order by a
//! single task. A write that still fails with the store unavailable after
//! its retries is parked, keyed by record, and retried on an interval; a
//! newer write to the same record replaces the parked one. While parked
//! writes exist, new writes are parked straight away so the task does not
//! spend its time in backoff.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use vsum_models::{Job, JobId};

use super::{JobStore, RateWindowRecord};
use crate::config::{QueueConfig, StoreBackend};
use crate::error::StoreResult;
use crate::metrics;
use crate::retry::{retry_async_if, FailureTracker, RetryConfig};

#[derive(Debug, Clone)]
enum Write {
    Put(Box<Job>),
    Delete(JobId),
    RateWindow(RateWindowRecord, Duration),
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum WriteKey {
    Job(JobId),
    Rate(String),
}

impl Write {
    fn key(&self) -> WriteKey {
        match self {
            Write::Put(job) => WriteKey::Job(job.id.clone()),
            Write::Delete(id) => WriteKey::Job(id.clone()),
            Write::RateWindow(record, _) => WriteKey::Rate(record.user_id.clone()),
        }
    }

    fn op(&self) -> &'static str {
        match self {
            Write::Put(_) => "put",
            Write::Delete(_) => "delete",
            Write::RateWindow(..) => "rate_window",
        }
    }

    async fn apply(&self, store: &dyn JobStore) -> StoreResult<()> {
        match self {
            Write::Put(job) => store.put(job).await,
            Write::Delete(id) => store.delete(id).await,
            Write::RateWindow(record, ttl) => store.put_rate_window(record, *ttl).await,
        }
    }
}

enum Command {
    Write(Write),
    Flush(oneshot::Sender<usize>),
}

/// Writer tuning.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub retry: RetryConfig,
    pub retry_interval: Duration,
}

impl WriterConfig {
    pub fn from_queue_config(config: &QueueConfig) -> Self {
        Self {
            retry: RetryConfig::new("store_write").with_max_retries(config.store_write_retries),
            retry_interval: config.store_retry_interval,
        }
    }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self::from_queue_config(&QueueConfig::default())
    }
}

/// Handle used to enqueue store writes. Cheap to clone.
#[derive(Clone)]
pub struct StoreWriter {
    tx: mpsc::UnboundedSender<Command>,
    backend: StoreBackend,
}

/// Join handle of the writer task; finishes once every [`StoreWriter`] is dropped.
pub type WriterHandle = JoinHandle<()>;

impl StoreWriter {
    /// Start the writer task for `store`.
    pub fn spawn(store: Arc<dyn JobStore>, config: WriterConfig) -> (Self, WriterHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let backend = store.backend();
        let task = WriterTask {
            store,
            rx,
            retry: config.retry,
            retry_interval: config.retry_interval.max(Duration::from_millis(100)),
            parked: BTreeMap::new(),
            tracker: FailureTracker::new(3),
        };
        let handle = tokio::spawn(task.run());
        (Self { tx, backend }, handle)
    }

    pub fn backend(&self) -> StoreBackend {
        self.backend
    }

    /// Persist the job's current snapshot.
    pub fn put(&self, job: &Job) {
        self.send(Write::Put(Box::new(job.clone())));
    }

    pub fn delete(&self, job_id: &JobId) {
        self.send(Write::Delete(job_id.clone()));
    }

    pub fn put_rate_window(&self, record: RateWindowRecord, ttl: Duration) {
        self.send(Write::RateWindow(record, ttl));
    }

    /// Wait until every write queued so far has been attempted and parked
    /// writes have had one more try. Returns the number still parked.
    pub async fn flush(&self) -> usize {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(ack_tx)).is_err() {
            return 0;
        }
        ack_rx.await.unwrap_or(0)
    }

    fn send(&self, write: Write) {
        if self.tx.send(Command::Write(write)).is_err() {
            debug!("Store writer stopped, dropping write");
        }
    }
}

struct WriterTask {
    store: Arc<dyn JobStore>,
    rx: mpsc::UnboundedReceiver<Command>,
    retry: RetryConfig,
    retry_interval: Duration,
    parked: BTreeMap<WriteKey, Write>,
    tracker: FailureTracker,
}

impl WriterTask {
    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.retry_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.rx.recv() => match command {
                    Some(Command::Write(write)) => self.submit(write).await,
                    Some(Command::Flush(ack)) => {
                        self.drain_parked().await;
                        let _ = ack.send(self.parked.len());
                    }
                    None => break,
                },
                _ = ticker.tick(), if !self.parked.is_empty() => self.drain_parked().await,
            }
        }

        self.drain_parked().await;
        if !self.parked.is_empty() {
            warn!(parked = self.parked.len(), "Store writer stopping with unpersisted writes");
        }
    }

    async fn submit(&mut self, write: Write) {
        let key = write.key();
        self.parked.remove(&key);

        if self.tracker.is_failing() {
            self.park(key, write);
            return;
        }

        let store = self.store.as_ref();
        let write_ref = &write;
        let result = retry_async_if(
            &self.retry,
            move || write_ref.apply(store),
            |e| e.is_unavailable(),
        )
        .await
        .into_result();

        match result {
            Ok(()) => {
                self.tracker.record_success();
            }
            Err(e) if e.is_unavailable() => {
                metrics::record_store_write_failure(write.op());
                if self.tracker.record_failure() {
                    warn!(op = write.op(), error = %e, "Store unavailable, parking write");
                }
                self.park(key, write);
            }
            Err(e) => {
                metrics::record_store_write_failure(write.op());
                error!(op = write.op(), error = %e, "Dropping store write");
            }
        }
    }

    fn park(&mut self, key: WriteKey, write: Write) {
        self.parked.insert(key, write);
        metrics::set_store_parked_writes(self.parked.len());
    }

    async fn drain_parked(&mut self) {
        while let Some((key, write)) = self.parked.pop_first() {
            match write.apply(self.store.as_ref()).await {
                Ok(()) => {
                    if self.tracker.record_success() {
                        info!("Store reachable again, replaying parked writes");
                    }
                }
                Err(e) if e.is_unavailable() => {
                    self.tracker.record_failure();
                    self.parked.insert(key, write);
                    break;
                }
                Err(e) => {
                    error!(op = write.op(), error = %e, "Dropping parked store write");
                }
            }
        }
        metrics::set_store_parked_writes(self.parked.len());
    }
}
