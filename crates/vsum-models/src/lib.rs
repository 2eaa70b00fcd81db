//! Shared data models for the video summary job queue.
//!
//! This crate provides Serde-serializable types for:
//! - Jobs, their lifecycle states and failure categories
//! - Validated submission requests and output formats
//! - Status projections and queue snapshots
//! - YouTube URL normalisation

pub mod job;
pub mod request;
pub mod status;
pub mod video;

// Re-export common types
pub use job::{FailureCategory, Job, JobId, JobState};
pub use request::{JobRequest, OutputFormat, RequestError};
pub use status::{JobStatusView, QueueSnapshot};
pub use video::{canonical_watch_url, extract_youtube_id, YoutubeIdError, YoutubeIdResult};
