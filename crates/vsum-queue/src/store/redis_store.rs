//! Redis-backed job store.
//!
//! Key layout (all under the configured prefix):
//!
//! - `{prefix}:job:{id}`: job record as JSON
//! - `{prefix}:state:{state}`: set of job IDs currently in that state
//! - `{prefix}:rate:{user}`: rate window as JSON, with a TTL of one window

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use tracing::{debug, warn};

use vsum_models::{Job, JobId, JobState};

use super::{JobStore, RateWindowRecord};
use crate::config::{QueueConfig, StoreBackend};
use crate::error::{StoreError, StoreResult};

const SCAN_COUNT: usize = 200;

pub struct RedisStore {
    client: redis::Client,
    prefix: String,
    timeout: Duration,
}

impl RedisStore {
    /// Create a store. No connection is made until the first operation.
    pub fn new(config: &QueueConfig) -> StoreResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        Ok(Self {
            client,
            prefix: config.key_prefix.clone(),
            timeout: config.redis_timeout,
        })
    }

    fn job_key(&self, job_id: &JobId) -> String {
        format!("{}:job:{}", self.prefix, job_id)
    }

    fn state_key(&self, state: JobState) -> String {
        format!("{}:state:{}", self.prefix, state.as_str())
    }

    fn rate_key(&self, user_id: &str) -> String {
        format!("{}:rate:{}", self.prefix, user_id)
    }

    /// Bound an operation by the configured timeout.
    async fn timed<T, F>(&self, op: &'static str, fut: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::unavailable(format!(
                "redis {op} timed out after {:?}",
                self.timeout
            ))),
        }
    }

    async fn connection(&self) -> StoreResult<redis::aio::MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    async fn mget(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        keys: &[String],
    ) -> StoreResult<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let values: Vec<Option<String>> = redis::cmd("MGET").arg(keys).query_async(conn).await?;
        Ok(values)
    }
}

#[async_trait]
impl JobStore for RedisStore {
    fn backend(&self) -> StoreBackend {
        StoreBackend::Redis
    }

    async fn ping(&self) -> StoreResult<()> {
        self.timed("ping", async {
            let mut conn = self.connection().await?;
            redis::cmd("PING").query_async::<String>(&mut conn).await?;
            Ok(())
        })
        .await
    }

    async fn put(&self, job: &Job) -> StoreResult<()> {
        let payload = serde_json::to_string(job)?;
        self.timed("put", async {
            let mut conn = self.connection().await?;

            let mut pipe = redis::pipe();
            pipe.atomic();
            pipe.set(self.job_key(&job.id), payload).ignore();
            for state in JobState::ALL.into_iter().filter(|s| *s != job.state) {
                pipe.srem(self.state_key(state), job.id.as_str()).ignore();
            }
            pipe.sadd(self.state_key(job.state), job.id.as_str()).ignore();
            pipe.query_async::<()>(&mut conn).await?;

            debug!(job_id = %job.id, state = %job.state, "Stored job");
            Ok(())
        })
        .await
    }

    async fn get(&self, job_id: &JobId) -> StoreResult<Job> {
        self.timed("get", async {
            let mut conn = self.connection().await?;
            let payload: Option<String> = conn.get(self.job_key(job_id)).await?;
            match payload {
                Some(payload) => Ok(serde_json::from_str(&payload)?),
                None => Err(StoreError::NotFound(job_id.clone())),
            }
        })
        .await
    }

    async fn list_by_state(&self, state: JobState) -> StoreResult<Vec<Job>> {
        self.timed("list_by_state", async {
            let mut conn = self.connection().await?;
            let ids: Vec<String> = conn.smembers(self.state_key(state)).await?;
            let keys: Vec<String> = ids
                .iter()
                .map(|id| self.job_key(&JobId::from_string(id.as_str())))
                .collect();
            let payloads = self.mget(&mut conn, &keys).await?;

            let mut jobs = Vec::with_capacity(payloads.len());
            for (id, payload) in ids.iter().zip(payloads) {
                let Some(payload) = payload else {
                    debug!(job_id = %id, "State index points at a missing job");
                    continue;
                };
                match serde_json::from_str::<Job>(&payload) {
                    Ok(job) if job.state == state => jobs.push(job),
                    Ok(_) => debug!(job_id = %id, "Skipping job whose state changed mid-read"),
                    Err(e) => warn!(job_id = %id, error = %e, "Skipping unreadable job record"),
                }
            }
            jobs.sort_by(|a, b| (a.submitted_at, &a.id).cmp(&(b.submitted_at, &b.id)));
            Ok(jobs)
        })
        .await
    }

    async fn delete(&self, job_id: &JobId) -> StoreResult<()> {
        self.timed("delete", async {
            let mut conn = self.connection().await?;

            let mut pipe = redis::pipe();
            pipe.atomic();
            pipe.del(self.job_key(job_id)).ignore();
            for state in JobState::ALL {
                pipe.srem(self.state_key(state), job_id.as_str()).ignore();
            }
            pipe.query_async::<()>(&mut conn).await?;
            Ok(())
        })
        .await
    }

    async fn put_rate_window(&self, record: &RateWindowRecord, ttl: Duration) -> StoreResult<()> {
        let key = self.rate_key(&record.user_id);
        let payload = serde_json::to_string(record)?;
        self.timed("put_rate_window", async {
            let mut conn = self.connection().await?;
            if record.timestamps.is_empty() {
                conn.del::<_, ()>(&key).await?;
            } else {
                let ttl_secs = ttl.as_secs_f64().ceil().max(1.0) as u64;
                conn.set_ex::<_, _, ()>(&key, payload, ttl_secs).await?;
            }
            Ok(())
        })
        .await
    }

    async fn list_rate_windows(&self) -> StoreResult<Vec<RateWindowRecord>> {
        let pattern = format!("{}:rate:*", self.prefix);
        self.timed("list_rate_windows", async {
            let mut conn = self.connection().await?;

            let mut keys = Vec::new();
            let mut cursor: u64 = 0;
            loop {
                let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(SCAN_COUNT)
                    .query_async(&mut conn)
                    .await?;
                keys.extend(batch);
                if next == 0 {
                    break;
                }
                cursor = next;
            }

            let payloads = self.mget(&mut conn, &keys).await?;
            let mut records = Vec::with_capacity(payloads.len());
            for (key, payload) in keys.iter().zip(payloads) {
                let Some(payload) = payload else { continue };
                match serde_json::from_str::<RateWindowRecord>(&payload) {
                    Ok(record) => records.push(record),
                    Err(e) => warn!(key = %key, error = %e, "Skipping unreadable rate window"),
                }
            }
            Ok(records)
        })
        .await
    }
}
