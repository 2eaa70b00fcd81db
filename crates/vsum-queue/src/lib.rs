//! Job queue core for video summarization.
//!
//! This crate provides:
//! - The in-process job registry with compare-and-swap state transitions
//! - Per-user sliding-window rate limiting
//! - Durable job storage (Redis or in-memory) behind a background writer
//! - Read-only status and queue projections

pub mod config;
pub mod error;
pub mod metrics;
pub mod rate_limit;
pub mod registry;
pub mod retry;
pub mod status;
pub mod store;

pub use config::{QueueConfig, StoreBackend};
pub use error::{RejectionReason, StoreError, StoreResult};
pub use rate_limit::RateLimiter;
pub use registry::JobRegistry;
pub use retry::{retry_async, retry_async_if, FailureTracker, RetryConfig, RetryResult};
pub use status::StatusReporter;
pub use store::{
    connect_store, JobStore, MemoryStore, RateWindowRecord, RedisStore, StoreWriter, WriterConfig,
    WriterHandle,
};
