//! Stage payloads and the per-invocation context.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use vsum_models::{Job, JobId};

/// The processing stages, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Resolve,
    Summarize,
    Render,
    Deliver,
}

impl StageKind {
    pub const ALL: [StageKind; 4] = [
        StageKind::Resolve,
        StageKind::Summarize,
        StageKind::Render,
        StageKind::Deliver,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Resolve => "resolve",
            StageKind::Summarize => "summarize",
            StageKind::Render => "render",
            StageKind::Deliver => "deliver",
        }
    }

    /// Job progress once this stage has finished.
    pub fn progress_after(&self) -> u8 {
        match self {
            StageKind::Resolve => 40,
            StageKind::Summarize => 75,
            StageKind::Render => 95,
            StageKind::Deliver => 100,
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Descriptive metadata returned by the resolver.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VideoMetadata {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<u64>,
    /// Transcript language code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
}

/// Resolver output: the transcript and what it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedVideo {
    pub transcript: String,
    pub metadata: VideoMetadata,
}

/// Summarizer output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructuredSummary {
    pub title: String,
    pub overview: String,
    #[serde(default)]
    pub key_points: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conclusion: Option<String>,
}

/// Location of a rendered document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactRef(pub String);

impl ArtifactRef {
    pub fn new(location: impl Into<String>) -> Self {
        Self(location.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Passed to every stage call.
///
/// Stages may use the deadline to bound their own I/O. The token is
/// observed by the coordinator at stage boundaries; a stage is never
/// interrupted because of it.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub job_id: JobId,
    pub user_id: String,
    pub stage: StageKind,
    pub deadline: Instant,
    pub cancel: CancellationToken,
}

impl StageContext {
    pub fn new(job: &Job, stage: StageKind, timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            job_id: job.id.clone(),
            user_id: job.user_id.clone(),
            stage,
            deadline: Instant::now() + timeout,
            cancel,
        }
    }

    /// Time left before the deadline.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
