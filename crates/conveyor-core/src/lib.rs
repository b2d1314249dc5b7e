//! Core domain types and traits for the Conveyor pipeline scheduler.
//!
//! This crate contains:
//! - Typed identifiers for pipelines, jobs, resources, versions and builds
//! - Pipeline configuration types (resources, resource types, jobs, inputs)
//! - Build records and statuses
//! - The version graph snapshot consumed by input resolution
//! - Collaborator traits for build execution and resource checking
//! - A clock abstraction for lease arbitration outside the database

pub mod build;
pub mod checker;
pub mod clock;
pub mod error;
pub mod executor;
pub mod id;
pub mod pipeline;
pub mod versions;

pub use build::{Build, BuildStatus};
pub use error::{Error, Result};
pub use id::{BuildId, JobId, PipelineId, ResourceId, ResourceTypeId, VersionId};
