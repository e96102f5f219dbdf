pub mod bundle;
pub mod checkpoint;
pub mod config;
mod orchestrator;
mod patched;
pub mod patches;
pub mod projection;
mod single;
pub mod types;

pub use bundle::{BundleStore, ResultBundle};
pub use checkpoint::{Checkpoint, CheckpointStore, ComponentOrder};
pub use config::{PipelineConfig, ProjectionKind, ReusePolicy};
pub use orchestrator::Extractor;
pub use patched::lift_patches;
pub use patches::{patch_grid, Patch};
pub use types::{ExtractionOutput, NoOpReporter, PipelineStage, ProgressReporter, RunMode};
