//! Pipeline orchestration for the news feed.
//!
//! Search results flow through filter, enrich, and summarize stages into a
//! delivered report. Each stage reads its predecessor's artifact from disk
//! and commits its own atomically, so any stage can be re-run on its own.

pub mod artifacts;
pub mod context;
pub mod deliver;
pub mod enrich;
pub mod filter;
pub mod pipeline;
pub mod progress;
pub mod stage;
pub mod summarize;
pub mod transform;

#[cfg(test)]
pub(crate) mod fakes;

pub use artifacts::{ArtifactEnvelope, ArtifactStore};
pub use context::RunContext;
pub use deliver::{BrevoDelivery, DeliveryService, OutgoingEmail};
pub use pipeline::{PipelineCoordinator, RunPlan, Services};
pub use progress::{ProgressReporter, SilentProgress};
pub use stage::{StageOutcome, StageProcessor, StageSpec, Validate};
pub use transform::{OpenRouterService, TransformRequest, TransformService};
