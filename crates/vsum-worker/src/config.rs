//! Worker configuration.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use vsum_stages::StageKind;

/// Deadline and retry eligibility for one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagePolicy {
    /// Stage deadline
    pub timeout: Duration,
    /// Whether a timeout sends the job back to the queue
    pub retryable: bool,
}

/// Per-stage policies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagePolicies {
    pub resolve: StagePolicy,
    pub summarize: StagePolicy,
    pub render: StagePolicy,
    pub deliver: StagePolicy,
}

impl StagePolicies {
    /// Same deadline for every stage.
    pub fn uniform(timeout: Duration) -> Self {
        Self {
            resolve: StagePolicy { timeout, retryable: true },
            summarize: StagePolicy { timeout, retryable: true },
            render: StagePolicy { timeout, retryable: false },
            deliver: StagePolicy { timeout, retryable: true },
        }
    }

    pub fn get(&self, stage: StageKind) -> StagePolicy {
        match stage {
            StageKind::Resolve => self.resolve,
            StageKind::Summarize => self.summarize,
            StageKind::Render => self.render,
            StageKind::Deliver => self.deliver,
        }
    }

    pub fn get_mut(&mut self, stage: StageKind) -> &mut StagePolicy {
        match stage {
            StageKind::Resolve => &mut self.resolve,
            StageKind::Summarize => &mut self.summarize,
            StageKind::Render => &mut self.render,
            StageKind::Deliver => &mut self.deliver,
        }
    }

    fn from_env(default_timeout: Duration) -> Self {
        let mut policies = Self::uniform(default_timeout);
        for stage in StageKind::ALL {
            let name = stage.as_str().to_ascii_uppercase();
            let policy = policies.get_mut(stage);
            if let Some(secs) = std::env::var(format!("STAGE_{name}_TIMEOUT"))
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
            {
                policy.timeout = Duration::from_secs(secs);
            }
            if let Some(retryable) = std::env::var(format!("STAGE_{name}_RETRYABLE"))
                .ok()
                .and_then(|s| parse_bool(&s))
            {
                policy.retryable = retryable;
            }
        }
        policies
    }
}

impl Default for StagePolicies {
    fn default() -> Self {
        Self::uniform(Duration::from_secs(300))
    }
}

/// What to do when the access gate itself errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GatePolicy {
    /// Admit the submission
    #[default]
    FailOpen,
    /// Reject with `AccessDenied`
    FailClosed,
}

impl fmt::Display for GatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatePolicy::FailOpen => f.write_str("fail_open"),
            GatePolicy::FailClosed => f.write_str("fail_closed"),
        }
    }
}

impl FromStr for GatePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "fail_open" | "open" => Ok(GatePolicy::FailOpen),
            "fail_closed" | "closed" => Ok(GatePolicy::FailClosed),
            other => Err(format!("unknown gate policy: {other}")),
        }
    }
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Worker slots (jobs running at once)
    pub max_concurrent_jobs: usize,
    /// Requeues allowed per job before it fails
    pub max_retries: u32,
    /// Stage deadlines and retry flags
    pub stages: StagePolicies,
    /// How long shutdown waits for running jobs
    pub shutdown_timeout: Duration,
    /// Dispatch re-check interval when nothing wakes it
    pub poll_interval: Duration,
    /// Interval of the stale-record sweep
    pub cleanup_interval: Duration,
    /// Typical job duration, for wait estimates
    pub estimated_job_duration: Duration,
    /// Delivery retries after the first attempt
    pub delivery_retries: u32,
    /// First delivery backoff; doubles per retry
    pub delivery_backoff: Duration,
    /// Behaviour when the access gate errors
    pub gate_policy: GatePolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 2,
            max_retries: 2,
            stages: StagePolicies::default(),
            shutdown_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(1000),
            cleanup_interval: Duration::from_secs(300), // 5 minutes
            estimated_job_duration: Duration::from_secs(180),
            delivery_retries: 2,
            delivery_backoff: Duration::from_millis(500),
            gate_policy: GatePolicy::FailOpen,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let stage_timeout = Duration::from_secs(
            std::env::var("PROCESSING_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(300),
        );

        Self {
            max_concurrent_jobs: std::env::var("WORKER_MAX_JOBS")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(2),
            max_retries: std::env::var("WORKER_MAX_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(2),
            stages: StagePolicies::from_env(stage_timeout),
            shutdown_timeout: Duration::from_secs(
                std::env::var("WORKER_SHUTDOWN_TIMEOUT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
            poll_interval: Duration::from_millis(
                std::env::var("WORKER_POLL_INTERVAL_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(1000),
            ),
            cleanup_interval: Duration::from_secs(
                std::env::var("WORKER_CLEANUP_INTERVAL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(300),
            ),
            estimated_job_duration: Duration::from_secs(
                std::env::var("ESTIMATED_JOB_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(180),
            ),
            delivery_retries: std::env::var("DELIVERY_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(2),
            delivery_backoff: Duration::from_millis(500),
            gate_policy: std::env::var("ACCESS_GATE_POLICY")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or_default(),
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
