//! Processing stages for video summarization.
//!
//! The worker treats transcript resolution, summarization, rendering and
//! delivery as opaque collaborators behind the traits in [`stage`]. This
//! crate defines those traits, their payloads, the error classification the
//! coordinator retries on, and HTTP implementations for deployed services.

pub mod client;
pub mod error;
pub mod stage;
pub mod types;

pub use client::{
    HttpAccessGate, HttpDelivery, HttpRenderer, HttpResolver, HttpSummarizer, StageClientConfig,
};
pub use error::{StageError, StageFailure, StageResult};
pub use stage::{AccessGate, DeliverySink, Renderer, Resolver, StageSet, Summarizer};
pub use types::{
    ArtifactRef, ResolvedVideo, StageContext, StageKind, StructuredSummary, VideoMetadata,
};
