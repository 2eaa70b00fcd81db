//! Job definitions and the job state machine.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::request::{JobRequest, OutputFormat};

/// Unique identifier for a job.
///
/// Ordering is lexicographic on the inner string; the dispatcher uses it
/// only to break ties between jobs submitted at the same instant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a job.
///
/// `Queued -> Running -> {Completed, Failed, Cancelled}`; `Running` may go
/// back to `Queued` for a retry. Terminal states have no outgoing edges.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for a worker slot
    #[default]
    Queued,
    /// Occupying a worker slot, stages executing
    Running,
    /// Pipeline finished and a result reference is attached
    Completed,
    /// Permanently failed
    Failed,
    /// Cancelled by the submitting user
    Cancelled,
}

impl JobState {
    /// All states, in lifecycle order.
    pub const ALL: [JobState; 5] = [
        JobState::Queued,
        JobState::Running,
        JobState::Completed,
        JobState::Failed,
        JobState::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    /// No transitions leave a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Cancelled)
    }

    /// Queued or running jobs count against the one-active-job-per-user rule.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Whether the state machine has an edge from `self` to `next`.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Cancelled)
                | (Queued, Failed)
                | (Running, Queued)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown job state: {s}"))
    }
}

/// User-facing reason a job ended in `Failed`.
///
/// Internal error detail stays on [`Job::error_detail`]; only the category
/// and its message are shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    /// A stage exceeded its deadline
    Timeout,
    /// A collaborator kept failing transiently until retries ran out
    Unavailable,
    /// The video cannot be processed (private, removed, unsupported...)
    Rejected,
    /// The process restarted while the job was active
    Interrupted,
    /// Anything else
    Internal,
}

impl FailureCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::Timeout => "timeout",
            FailureCategory::Unavailable => "unavailable",
            FailureCategory::Rejected => "rejected",
            FailureCategory::Interrupted => "interrupted",
            FailureCategory::Internal => "internal",
        }
    }

    /// Human-readable explanation suitable for end users.
    pub fn message(&self) -> &'static str {
        match self {
            FailureCategory::Timeout => "Processing took too long and was stopped.",
            FailureCategory::Unavailable => {
                "A processing service is temporarily unavailable. Please try again later."
            }
            FailureCategory::Rejected => "This video cannot be summarized.",
            FailureCategory::Interrupted => "Processing was interrupted. Please submit the video again.",
            FailureCategory::Internal => "An internal error occurred while processing the video.",
        }
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user-submitted summarization job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Job {
    /// Unique job ID
    pub id: JobId,

    /// Owning user
    pub user_id: String,

    /// Canonical video URL
    pub video_url: String,

    /// 11-character YouTube video ID
    pub video_id: String,

    /// Requested document format
    #[serde(default)]
    pub format: OutputFormat,

    /// Current state
    #[serde(default)]
    pub state: JobState,

    /// Submission timestamp (FIFO key)
    pub submitted_at: DateTime<Utc>,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,

    /// Most recent transition into `Running`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// Transition into a terminal state
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,

    /// Progress (0-100)
    #[serde(default)]
    pub progress: u8,

    /// Stage currently executing, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,

    /// Number of retries consumed so far
    #[serde(default)]
    pub retry_count: u32,

    /// Internal error detail of the last failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,

    /// User-facing failure category (set when `Failed`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureCategory>,

    /// Artifact reference (set when `Completed`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,

    /// Whether the delivery sink accepted the artifact
    #[serde(default)]
    pub delivered: bool,
}

impl Job {
    /// Create a new queued job for a validated request.
    pub fn new(user_id: impl Into<String>, request: JobRequest) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            user_id: user_id.into(),
            video_url: request.video_url,
            video_id: request.video_id,
            format: request.format,
            state: JobState::Queued,
            submitted_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            progress: 0,
            stage: None,
            retry_count: 0,
            error_detail: None,
            failure: None,
            result: None,
            delivered: false,
        }
    }

    /// Override the submission timestamp.
    pub fn with_submitted_at(mut self, at: DateTime<Utc>) -> Self {
        self.submitted_at = at;
        self.updated_at = at;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Apply the bookkeeping that accompanies a state change.
    ///
    /// Does not validate the edge; callers check
    /// [`JobState::can_transition_to`] first.
    pub fn set_state(&mut self, next: JobState, at: DateTime<Utc>) {
        self.state = next;
        self.updated_at = at;
        match next {
            JobState::Queued => {
                self.progress = 0;
                self.stage = None;
            }
            JobState::Running => {
                self.started_at = Some(at);
            }
            JobState::Completed => {
                self.finished_at = Some(at);
                self.progress = 100;
                self.stage = None;
            }
            JobState::Failed | JobState::Cancelled => {
                self.finished_at = Some(at);
                self.stage = None;
            }
        }
    }

    /// Update progress.
    pub fn set_progress(&mut self, progress: u8, stage: Option<&str>) {
        self.progress = progress.min(100);
        self.stage = stage.map(str::to_string);
        self.updated_at = Utc::now();
    }

    /// User-facing failure message, if the job failed.
    pub fn failure_message(&self) -> Option<&'static str> {
        self.failure.map(|category| category.message())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> JobRequest {
        JobRequest::new("https://youtu.be/dQw4w9WgXcQ", OutputFormat::Pdf).unwrap()
    }

    #[test]
    fn test_job_creation() {
        let job = Job::new("user123", request());

        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.video_id, "dQw4w9WgXcQ");
        assert_eq!(job.format, OutputFormat::Pdf);
        assert_eq!(job.progress, 0);
        assert!(job.result.is_none());
    }

    #[test]
    fn test_state_machine_edges() {
        assert!(JobState::Queued.can_transition_to(JobState::Running));
        assert!(JobState::Queued.can_transition_to(JobState::Cancelled));
        assert!(JobState::Running.can_transition_to(JobState::Queued));
        assert!(JobState::Running.can_transition_to(JobState::Completed));
        assert!(!JobState::Queued.can_transition_to(JobState::Completed));
        assert!(!JobState::Queued.can_transition_to(JobState::Queued));

        for terminal in [JobState::Completed, JobState::Failed, JobState::Cancelled] {
            assert!(terminal.is_terminal());
            for next in JobState::ALL {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_set_state_bookkeeping() {
        let mut job = Job::new("user123", request());
        let now = Utc::now();

        job.set_state(JobState::Running, now);
        assert_eq!(job.started_at, Some(now));

        job.set_progress(40, Some("resolve"));
        job.set_state(JobState::Queued, now);
        assert_eq!(job.progress, 0);
        assert!(job.stage.is_none());

        job.set_state(JobState::Running, now);
        job.set_state(JobState::Completed, now);
        assert_eq!(job.progress, 100);
        assert_eq!(job.finished_at, Some(now));
    }

    #[test]
    fn test_state_string_round_trip() {
        for state in JobState::ALL {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert!("processing".parse::<JobState>().is_err());
    }

    #[test]
    fn test_failure_message_hides_detail() {
        let mut job = Job::new("user123", request());
        job.error_detail = Some("upstream 502 from 10.0.0.4".into());
        job.failure = Some(FailureCategory::Unavailable);

        let message = job.failure_message().unwrap();
        assert!(!message.contains("10.0.0.4"));
    }
}
