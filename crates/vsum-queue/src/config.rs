//! Queue configuration.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Which [`JobStore`](crate::store::JobStore) implementation to start with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreBackend {
    /// Networked Redis/Valkey backend
    #[default]
    Redis,
    /// Process-local backend; nothing survives a restart
    Memory,
}

impl StoreBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreBackend::Redis => "redis",
            StoreBackend::Memory => "memory",
        }
    }
}

impl fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "redis" | "valkey" => Ok(StoreBackend::Redis),
            "memory" | "in-memory" | "inmemory" => Ok(StoreBackend::Memory),
            other => Err(format!("unknown store backend: {other}")),
        }
    }
}

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Store backend selected at startup
    pub backend: StoreBackend,
    /// Redis URL
    pub redis_url: String,
    /// Prefix for every Redis key
    pub key_prefix: String,
    /// Per-operation Redis timeout
    pub redis_timeout: Duration,
    /// Maximum number of queued jobs
    pub max_queue_size: usize,
    /// Admitted submissions per user per window
    pub rate_limit_messages: usize,
    /// Sliding rate window
    pub rate_limit_window: Duration,
    /// How long finished jobs stay visible in the registry
    pub job_retention: Duration,
    /// Retries for a single store write before it is parked
    pub store_write_retries: u32,
    /// How often parked store writes are retried
    pub store_retry_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Redis,
            redis_url: "redis://localhost:6379".to_string(),
            key_prefix: "vsum".to_string(),
            redis_timeout: Duration::from_secs(5),
            max_queue_size: 100,
            rate_limit_messages: 10,
            rate_limit_window: Duration::from_secs(60),
            job_retention: Duration::from_secs(3600), // 1 hour
            store_write_retries: 3,
            store_retry_interval: Duration::from_secs(5),
        }
    }
}

impl QueueConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            backend: std::env::var("STORE_BACKEND")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or_default(),
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            key_prefix: std::env::var("QUEUE_KEY_PREFIX").unwrap_or_else(|_| "vsum".to_string()),
            redis_timeout: Duration::from_secs(
                std::env::var("REDIS_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(5),
            ),
            max_queue_size: std::env::var("MAX_QUEUE_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(100),
            rate_limit_messages: std::env::var("RATE_LIMIT_MESSAGES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),
            rate_limit_window: Duration::from_secs(
                std::env::var("RATE_LIMIT_WINDOW")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(60),
            ),
            job_retention: Duration::from_secs(
                std::env::var("JOB_RETENTION_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(3600),
            ),
            store_write_retries: std::env::var("STORE_WRITE_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(3),
            store_retry_interval: Duration::from_secs(
                std::env::var("STORE_RETRY_INTERVAL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(5),
            ),
        }
    }

    /// In-memory configuration, handy for tests and local runs.
    pub fn in_memory() -> Self {
        Self {
            backend: StoreBackend::Memory,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = QueueConfig::default();
        assert_eq!(config.backend, StoreBackend::Redis);
        assert_eq!(config.max_queue_size, 100);
        assert_eq!(config.rate_limit_messages, 10);
        assert_eq!(config.rate_limit_window, Duration::from_secs(60));
    }

    #[test]
    fn test_backend_parsing() {
        assert_eq!("Redis".parse::<StoreBackend>().unwrap(), StoreBackend::Redis);
        assert_eq!("memory".parse::<StoreBackend>().unwrap(), StoreBackend::Memory);
        assert!("postgres".parse::<StoreBackend>().is_err());
    }
}
