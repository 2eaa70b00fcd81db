//! Durable job storage.
//!
//! A [`JobStore`] persists job records and per-user rate windows so a
//! restarted process can rebuild its registry. The coordinator never
//! blocks on it: writes go through the background [`StoreWriter`].

mod memory;
mod redis_store;
mod writer;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;
pub use self::writer::{StoreWriter, WriterConfig, WriterHandle};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use vsum_models::{Job, JobId, JobState};

use crate::config::{QueueConfig, StoreBackend};
use crate::error::StoreResult;

/// Persisted admission timestamps for one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateWindowRecord {
    pub user_id: String,
    pub timestamps: Vec<DateTime<Utc>>,
}

/// Key-value persistence for jobs and rate windows.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Which backend this is.
    fn backend(&self) -> StoreBackend;

    /// Check the backend is reachable.
    async fn ping(&self) -> StoreResult<()>;

    /// Insert or overwrite a job record and its state index entry.
    async fn put(&self, job: &Job) -> StoreResult<()>;

    /// Fetch a job; [`StoreError::NotFound`](crate::StoreError::NotFound) if absent.
    async fn get(&self, job_id: &JobId) -> StoreResult<Job>;

    /// Point-in-time list of jobs currently recorded in `state`.
    async fn list_by_state(&self, state: JobState) -> StoreResult<Vec<Job>>;

    /// Remove a job record. Deleting a missing job is not an error.
    async fn delete(&self, job_id: &JobId) -> StoreResult<()>;

    /// Replace a user's rate window, expiring after `ttl`.
    /// An empty window removes the record.
    async fn put_rate_window(&self, record: &RateWindowRecord, ttl: Duration) -> StoreResult<()>;

    /// Every unexpired rate window.
    async fn list_rate_windows(&self) -> StoreResult<Vec<RateWindowRecord>>;
}

/// Open the configured backend.
///
/// When Redis is selected but unreachable the process starts on the
/// in-memory backend instead of refusing to start.
pub async fn connect_store(config: &QueueConfig) -> Arc<dyn JobStore> {
    match config.backend {
        StoreBackend::Memory => {
            info!("Using in-memory job store");
            Arc::new(MemoryStore::new())
        }
        StoreBackend::Redis => match RedisStore::new(config) {
            Ok(store) => match store.ping().await {
                Ok(()) => {
                    info!(url = %redact_url(&config.redis_url), "Connected to Redis job store");
                    Arc::new(store)
                }
                Err(e) => {
                    warn!(error = %e, "Redis unreachable, falling back to in-memory job store");
                    Arc::new(MemoryStore::new())
                }
            },
            Err(e) => {
                warn!(error = %e, "Invalid Redis configuration, falling back to in-memory job store");
                Arc::new(MemoryStore::new())
            }
        },
    }
}

/// Strip credentials from a connection URL for logging.
fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}
