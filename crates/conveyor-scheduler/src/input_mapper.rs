//! Resolves and stores the next input mapping of a job.

use async_trait::async_trait;
use conveyor_core::pipeline::JobConfig;
use conveyor_core::versions::{InputMapping, InputVersion, VersionsDb};
use conveyor_db::InputMappingRepo;
use std::sync::Arc;
use tracing::debug;

use crate::algorithm;
use crate::{SchedulerError, SchedulerResult};

#[async_trait]
pub trait InputMapper: Send + Sync {
    /// Resolve the job's inputs against `versions` and replace its stored
    /// mapping with the result. An unsatisfiable job yields (and stores) an
    /// empty mapping.
    async fn save_next_input_mapping(
        &self,
        versions: &VersionsDb,
        job: &JobConfig,
    ) -> SchedulerResult<InputMapping>;
}

/// Input mapper backed by the resolution algorithm and an [`InputMappingRepo`].
pub struct VersionInputMapper {
    input_mappings: Arc<dyn InputMappingRepo>,
}

impl VersionInputMapper {
    pub fn new(input_mappings: Arc<dyn InputMappingRepo>) -> Self {
        Self { input_mappings }
    }
}

#[async_trait]
impl InputMapper for VersionInputMapper {
    async fn save_next_input_mapping(
        &self,
        versions: &VersionsDb,
        job: &JobConfig,
    ) -> SchedulerResult<InputMapping> {
        let job_id = *versions
            .job_ids
            .get(&job.name)
            .ok_or_else(|| SchedulerError::UnknownJob(job.name.clone()))?;

        let mapping: InputMapping = match algorithm::resolve(versions, job) {
            Some(resolved) => resolved
                .into_iter()
                .map(|(name, version_id)| {
                    let first_occurrence = !versions.has_input(job_id, &name, version_id);
                    (
                        name,
                        InputVersion {
                            version_id,
                            first_occurrence,
                        },
                    )
                })
                .collect(),
            None => {
                debug!(job = %job.name, "No satisfiable inputs");
                InputMapping::new()
            }
        };

        self.input_mappings
            .save_next_input_mapping(job_id, &mapping)
            .await?;

        Ok(mapping)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::pipeline::JobInput;
    use conveyor_core::versions::{BuildInput, ResourceVersion};
    use conveyor_core::{BuildId, JobId, ResourceId, VersionId};
    use conveyor_db::MemoryStore;

    fn versions_db(job_id: JobId, resource_id: ResourceId, version_id: VersionId) -> VersionsDb {
        VersionsDb {
            resource_versions: vec![ResourceVersion {
                resource_id,
                version_id,
                check_order: 1,
                checked: true,
            }],
            job_ids: [("some-job".to_string(), job_id)].into(),
            resource_ids: [("repo".to_string(), resource_id)].into(),
            ..Default::default()
        }
    }

    fn job_config() -> JobConfig {
        JobConfig {
            name: "some-job".to_string(),
            inputs: vec![JobInput::new("repo").with_trigger(true)],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_new_version_is_first_occurrence() {
        let store = Arc::new(MemoryStore::new());
        let mapper = VersionInputMapper::new(store.clone());
        let (job_id, version_id) = (JobId::new(), VersionId::new());
        let versions = versions_db(job_id, ResourceId::new(), version_id);

        let mapping = mapper
            .save_next_input_mapping(&versions, &job_config())
            .await
            .unwrap();

        assert_eq!(
            mapping["repo"],
            InputVersion {
                version_id,
                first_occurrence: true
            }
        );
        assert_eq!(store.next_input_mapping(job_id).await.unwrap(), mapping);
    }

    #[tokio::test]
    async fn test_version_used_before_is_not_first_occurrence() {
        let store = Arc::new(MemoryStore::new());
        let mapper = VersionInputMapper::new(store.clone());
        let (job_id, resource_id, version_id) = (JobId::new(), ResourceId::new(), VersionId::new());
        let mut versions = versions_db(job_id, resource_id, version_id);
        versions.build_inputs.push(BuildInput {
            job_id,
            build_id: BuildId::new(),
            resource_id,
            version_id,
            input_name: "repo".to_string(),
        });

        let mapping = mapper
            .save_next_input_mapping(&versions, &job_config())
            .await
            .unwrap();

        assert!(!mapping["repo"].first_occurrence);
    }

    #[tokio::test]
    async fn test_unsatisfiable_job_clears_stored_mapping() {
        let store = Arc::new(MemoryStore::new());
        let mapper = VersionInputMapper::new(store.clone());
        let job_id = JobId::new();
        let versions = versions_db(job_id, ResourceId::new(), VersionId::new());
        mapper
            .save_next_input_mapping(&versions, &job_config())
            .await
            .unwrap();

        let mut job = job_config();
        job.inputs.push(JobInput::new("missing"));
        let mapping = mapper.save_next_input_mapping(&versions, &job).await.unwrap();

        assert!(mapping.is_empty());
        assert!(store.next_input_mapping(job_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_job_is_an_error() {
        let mapper = VersionInputMapper::new(Arc::new(MemoryStore::new()));

        let result = mapper
            .save_next_input_mapping(&VersionsDb::default(), &job_config())
            .await;

        assert!(matches!(result, Err(SchedulerError::UnknownJob(name)) if name == "some-job"));
    }
}
