//! Repository traits and implementations.

pub mod build;
pub mod input_mapping;
pub mod lease;
pub mod pipeline;
pub mod version;

pub use build::{BuildRepo, PgBuildRepo};
pub use input_mapping::{InputMappingRepo, PgInputMappingRepo};
pub use lease::{LeaseRecord, LeaseRepo, PgLeaseRepo};
pub use pipeline::{
    PgPipelineRepo, PipelineRepo, SavedJob, SavedPipeline, SavedResource, SavedResourceType,
};
pub use version::{PgVersionRepo, SavedVersion, VersionRepo};
