//! Build executor trait.
//!
//! The scheduler never runs build steps itself. Once a build's inputs are
//! resolved it is handed to an executor, which reports back through
//! [`BuildExecutor::status`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::pipeline::{ResourceTypes, Source, Version};
use crate::{Build, Result, VersionId};

/// A resolved input, ready to be fetched by the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedInput {
    /// Input name within the job.
    pub name: String,
    /// Resource the version belongs to.
    pub resource: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub source: Source,
    pub version_id: VersionId,
    pub version: Version,
}

/// A version produced by a build (e.g. by a `put`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProducedVersion {
    pub resource: String,
    pub version: Version,
}

/// Execution state of a started build, as seen by the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ExecutionStatus {
    /// Accepted but not picked up yet.
    Queued,
    Running,
    Succeeded { outputs: Vec<ProducedVersion> },
    Failed { message: String },
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Succeeded { .. } | ExecutionStatus::Failed { .. }
        )
    }
}

/// Trait for build executors.
#[async_trait]
pub trait BuildExecutor: Send + Sync {
    /// Name of this executor.
    fn name(&self) -> &'static str;

    /// Accept a build that was just marked started. Must not block on execution.
    async fn start(
        &self,
        build: &Build,
        inputs: &[ResolvedInput],
        resource_types: &ResourceTypes,
    ) -> Result<()>;

    /// Current execution state of a started build.
    async fn status(&self, build: &Build) -> Result<ExecutionStatus>;
}
