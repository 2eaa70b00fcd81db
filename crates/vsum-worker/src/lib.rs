//! Queue coordinator and stage pipeline runner.
//!
//! The [`Coordinator`] admits jobs, dispatches them FIFO onto a fixed
//! number of worker slots and drives each one through the
//! [`StagePipeline`]: resolve, summarize, render, then delivery.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod logging;
pub mod pipeline;

pub use config::{GatePolicy, StagePolicies, StagePolicy, WorkerConfig};
pub use coordinator::{Coordinator, CoordinatorBuilder, RehydrateReport};
pub use error::{SubmitError, WorkerError, WorkerResult};
pub use logging::JobLogger;
pub use pipeline::{PipelineOutcome, StagePipeline};
