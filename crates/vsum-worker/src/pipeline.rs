//! Stage pipeline runner.
//!
//! Runs resolve, summarize and render for one job. Each stage is bounded by
//! its deadline; the cancellation token is checked before every stage and
//! once more after the last one. A stage that has started always runs to
//! completion or to its deadline.

use std::future::Future;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use vsum_models::Job;
use vsum_queue::metrics;
use vsum_stages::{ArtifactRef, StageContext, StageError, StageKind, StageResult, StageSet};

use crate::config::{StagePolicies, StagePolicy};
use crate::logging::JobLogger;

/// Progress reported when a job is picked up.
pub const PROGRESS_STARTED: u8 = 10;

/// How one pipeline run ended.
#[derive(Debug)]
pub enum PipelineOutcome {
    /// Every stage succeeded.
    Completed(ArtifactRef),
    /// The token was cancelled at a stage boundary.
    Cancelled,
    /// A stage failed or exceeded its deadline.
    Failed { stage: StageKind, error: StageError },
}

/// The ordered stages plus their policies.
#[derive(Clone)]
pub struct StagePipeline {
    stages: StageSet,
    policies: StagePolicies,
}

impl StagePipeline {
    pub fn new(stages: StageSet, policies: StagePolicies) -> Self {
        Self { stages, policies }
    }

    pub fn policy(&self, stage: StageKind) -> StagePolicy {
        self.policies.get(stage)
    }

    /// Run every stage for `job`.
    ///
    /// `progress(percent, stage)` is called when a stage starts and once
    /// more after the last stage.
    pub async fn run<P>(
        &self,
        job: &Job,
        cancel: &CancellationToken,
        logger: &JobLogger,
        progress: P,
    ) -> PipelineOutcome
    where
        P: Fn(u8, StageKind) + Send + Sync,
    {
        if cancel.is_cancelled() {
            return PipelineOutcome::Cancelled;
        }
        progress(PROGRESS_STARTED, StageKind::Resolve);
        let ctx = self.context(job, StageKind::Resolve, cancel);
        let resolved = match self
            .timed(&ctx, logger, self.stages.resolver.resolve(&ctx, &job.video_url))
            .await
        {
            Ok(resolved) => resolved,
            Err(error) => return failed(StageKind::Resolve, error),
        };

        if cancel.is_cancelled() {
            return PipelineOutcome::Cancelled;
        }
        progress(StageKind::Resolve.progress_after(), StageKind::Summarize);
        let ctx = self.context(job, StageKind::Summarize, cancel);
        let summary = match self
            .timed(
                &ctx,
                logger,
                self.stages
                    .summarizer
                    .summarize(&ctx, &resolved.transcript, &resolved.metadata),
            )
            .await
        {
            Ok(summary) => summary,
            Err(error) => return failed(StageKind::Summarize, error),
        };

        if cancel.is_cancelled() {
            return PipelineOutcome::Cancelled;
        }
        progress(StageKind::Summarize.progress_after(), StageKind::Render);
        let ctx = self.context(job, StageKind::Render, cancel);
        let artifact = match self
            .timed(&ctx, logger, self.stages.renderer.render(&ctx, &summary, job.format))
            .await
        {
            Ok(artifact) => artifact,
            Err(error) => return failed(StageKind::Render, error),
        };

        if cancel.is_cancelled() {
            return PipelineOutcome::Cancelled;
        }
        progress(StageKind::Render.progress_after(), StageKind::Render);
        PipelineOutcome::Completed(artifact)
    }

    /// One delivery attempt for a completed job.
    pub async fn deliver(&self, job: &Job, artifact: &ArtifactRef, logger: &JobLogger) -> StageResult<()> {
        let ctx = self.context(job, StageKind::Deliver, &CancellationToken::new());
        self.timed(&ctx, logger, self.stages.delivery.deliver(&ctx, &job.user_id, artifact))
            .await
    }

    fn context(&self, job: &Job, stage: StageKind, cancel: &CancellationToken) -> StageContext {
        StageContext::new(job, stage, self.policies.get(stage).timeout, cancel.clone())
    }

    async fn timed<T, F>(&self, ctx: &StageContext, logger: &JobLogger, stage_call: F) -> StageResult<T>
    where
        F: Future<Output = StageResult<T>>,
    {
        let timeout = self.policies.get(ctx.stage).timeout;
        let started = Instant::now();
        let result = match tokio::time::timeout(timeout, stage_call).await {
            Ok(result) => result,
            Err(_) => Err(StageError::Timeout(timeout)),
        };

        let elapsed = started.elapsed();
        metrics::record_stage_duration(ctx.stage.as_str(), elapsed.as_secs_f64());
        if result.is_ok() {
            logger.log_stage(ctx.stage, elapsed.as_millis() as u64);
        }
        result
    }
}

fn failed(stage: StageKind, error: StageError) -> PipelineOutcome {
    PipelineOutcome::Failed { stage, error }
}
