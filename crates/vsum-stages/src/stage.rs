//! Collaborator interfaces invoked by the worker.

use std::sync::Arc;

use async_trait::async_trait;

use vsum_models::OutputFormat;

use crate::error::StageResult;
use crate::types::{ArtifactRef, ResolvedVideo, StageContext, StructuredSummary, VideoMetadata};

/// Fetches the transcript and metadata for a video reference.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, ctx: &StageContext, reference: &str) -> StageResult<ResolvedVideo>;
}

/// Turns a transcript into a structured summary.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(
        &self,
        ctx: &StageContext,
        transcript: &str,
        metadata: &VideoMetadata,
    ) -> StageResult<StructuredSummary>;
}

/// Renders a summary into a document and returns where it lives.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(
        &self,
        ctx: &StageContext,
        summary: &StructuredSummary,
        format: OutputFormat,
    ) -> StageResult<ArtifactRef>;
}

/// Hands a finished artifact to the user.
#[async_trait]
pub trait DeliverySink: Send + Sync {
    async fn deliver(&self, ctx: &StageContext, user_id: &str, artifact: &ArtifactRef) -> StageResult<()>;
}

/// Decides whether a user may submit at all (subscription check).
///
/// `Ok(false)` is a definite refusal; an `Err` leaves the decision to the
/// caller's gate policy.
#[async_trait]
pub trait AccessGate: Send + Sync {
    async fn allows(&self, user_id: &str) -> StageResult<bool>;
}

/// The collaborators one pipeline run needs.
#[derive(Clone)]
pub struct StageSet {
    pub resolver: Arc<dyn Resolver>,
    pub summarizer: Arc<dyn Summarizer>,
    pub renderer: Arc<dyn Renderer>,
    pub delivery: Arc<dyn DeliverySink>,
}
