//! The version graph snapshot and input mappings.
//!
//! A [`VersionsDb`] is loaded once per scheduling pass and is read-only for
//! the rest of the pass. It holds every version of every resource in the
//! pipeline together with the edges recording which builds consumed or
//! produced which versions.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::{BuildId, JobId, ResourceId, VersionId};

/// In-memory snapshot of a pipeline's version history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VersionsDb {
    pub resource_versions: Vec<ResourceVersion>,
    /// Inputs and outputs of succeeded builds.
    pub build_outputs: Vec<BuildOutput>,
    /// Inputs of every build, whatever its status.
    pub build_inputs: Vec<BuildInput>,
    pub job_ids: HashMap<String, JobId>,
    pub resource_ids: HashMap<String, ResourceId>,
}

impl VersionsDb {
    /// Whether `version_id` was ever used as the input named `input_name` of `job_id`.
    pub fn has_input(&self, job_id: JobId, input_name: &str, version_id: VersionId) -> bool {
        self.build_inputs.iter().any(|input| {
            input.job_id == job_id
                && input.version_id == version_id
                && input.input_name == input_name
        })
    }
}

/// One known version of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceVersion {
    pub resource_id: ResourceId,
    pub version_id: VersionId,
    /// Recency key, strictly increasing per resource in discovery order.
    pub check_order: i64,
    /// Discovered by a check rather than only recorded as a build output.
    pub checked: bool,
}

/// A version that flowed through a succeeded build of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BuildOutput {
    pub job_id: JobId,
    pub build_id: BuildId,
    pub resource_id: ResourceId,
    pub version_id: VersionId,
}

/// A version consumed by a build under a given input name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BuildInput {
    pub job_id: JobId,
    pub build_id: BuildId,
    pub resource_id: ResourceId,
    pub version_id: VersionId,
    pub input_name: String,
}

/// Resolved version for one input of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputVersion {
    pub version_id: VersionId,
    /// Never before used for this job under this input name.
    pub first_occurrence: bool,
}

/// Input name to resolved version. Empty when nothing satisfies the job.
pub type InputMapping = BTreeMap<String, InputVersion>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_input_matches_on_input_name() {
        let job_id = JobId::new();
        let version_id = VersionId::new();
        let db = VersionsDb {
            build_inputs: vec![BuildInput {
                job_id,
                build_id: BuildId::new(),
                resource_id: ResourceId::new(),
                version_id,
                input_name: "repo".to_string(),
            }],
            ..Default::default()
        };

        assert!(db.has_input(job_id, "repo", version_id));
        assert!(!db.has_input(job_id, "renamed", version_id));
        assert!(!db.has_input(JobId::new(), "repo", version_id));
    }
}
