//! Starts pending builds whose inputs are resolved.

use async_trait::async_trait;
use conveyor_core::executor::{BuildExecutor, ResolvedInput};
use conveyor_core::pipeline::{JobConfig, JobInput, ResourceConfigs, ResourceTypes};
use conveyor_core::versions::InputMapping;
use conveyor_core::{Build, BuildStatus, PipelineId, VersionId};
use conveyor_db::{BuildRepo, InputMappingRepo, PipelineRepo, Repos, VersionRepo};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::{SchedulerError, SchedulerResult};

#[async_trait]
pub trait BuildStarter: Send + Sync {
    /// Try to start every pending build of `job`, oldest first.
    ///
    /// Builds whose inputs are not resolved stay pending. A failure to start
    /// one build does not stop the others; the first error is returned once
    /// all were attempted.
    async fn try_start_all_pending_builds(
        &self,
        job: &JobConfig,
        resources: &ResourceConfigs,
        resource_types: &ResourceTypes,
    ) -> SchedulerResult<()>;
}

/// Starts builds from the job's stored input mapping and hands them to a [`BuildExecutor`].
pub struct PendingBuildStarter {
    pipeline_id: PipelineId,
    pipelines: Arc<dyn PipelineRepo>,
    builds: Arc<dyn BuildRepo>,
    versions: Arc<dyn VersionRepo>,
    input_mappings: Arc<dyn InputMappingRepo>,
    executor: Arc<dyn BuildExecutor>,
}

impl PendingBuildStarter {
    pub fn new(pipeline_id: PipelineId, repos: &Repos, executor: Arc<dyn BuildExecutor>) -> Self {
        Self {
            pipeline_id,
            pipelines: repos.pipelines.clone(),
            builds: repos.builds.clone(),
            versions: repos.versions.clone(),
            input_mappings: repos.input_mappings.clone(),
            executor,
        }
    }

    async fn try_start_build(
        &self,
        build: &Build,
        job: &JobConfig,
        mapping: &InputMapping,
        resources: &ResourceConfigs,
        resource_types: &ResourceTypes,
    ) -> SchedulerResult<bool> {
        let mut chosen: Vec<(&JobInput, VersionId)> = Vec::with_capacity(job.inputs.len());
        for input in &job.inputs {
            let Some(resolved) = mapping.get(&input.name) else {
                debug!(job = %job.name, build = build.name, input = %input.name, "Input not resolved");
                return Ok(false);
            };
            chosen.push((input, resolved.version_id));
        }

        if build.manually_triggered && !self.inputs_checked_since(build, job).await? {
            debug!(job = %job.name, build = build.name, "Waiting for inputs to be checked");
            return Ok(false);
        }

        let mut inputs = Vec::with_capacity(chosen.len());
        for (input, version_id) in chosen {
            let resource = resources
                .lookup(&input.resource)
                .ok_or_else(|| SchedulerError::UnknownResource(input.resource.clone()))?;
            let version = self.versions.get_version(version_id).await?;
            inputs.push(ResolvedInput {
                name: input.name.clone(),
                resource: resource.name.clone(),
                type_name: resource.type_name.clone(),
                source: resource.source.clone(),
                version_id,
                version: version.version,
            });
        }

        let pairs: Vec<(String, VersionId)> = inputs
            .iter()
            .map(|input| (input.name.clone(), input.version_id))
            .collect();
        if !self.builds.start_build(build.id, &pairs).await? {
            debug!(job = %job.name, build = build.name, "Build no longer pending");
            return Ok(false);
        }

        let started = self.builds.get(build.id).await?;
        if let Err(e) = self.executor.start(&started, &inputs, resource_types).await {
            error!(
                job = %job.name,
                build = build.name,
                executor = self.executor.name(),
                error = %e,
                "Executor rejected build"
            );
            self.builds
                .finish_build(build.id, BuildStatus::Errored, &[])
                .await?;
            return Err(e.into());
        }

        info!(
            job = %job.name,
            build = build.name,
            executor = self.executor.name(),
            "Started build"
        );
        Ok(true)
    }

    /// A manual build only runs on versions found by a check made after it was created.
    async fn inputs_checked_since(&self, build: &Build, job: &JobConfig) -> SchedulerResult<bool> {
        for input in &job.inputs {
            let resource = self
                .pipelines
                .get_resource(self.pipeline_id, &input.resource)
                .await?;
            if resource.last_checked.is_none_or(|at| at < build.created_at) {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[async_trait]
impl BuildStarter for PendingBuildStarter {
    async fn try_start_all_pending_builds(
        &self,
        job: &JobConfig,
        resources: &ResourceConfigs,
        resource_types: &ResourceTypes,
    ) -> SchedulerResult<()> {
        let saved_job = self.pipelines.get_job(self.pipeline_id, &job.name).await?;
        if saved_job.paused {
            debug!(job = %job.name, "Job paused, not starting builds");
            return Ok(());
        }

        let pending = self
            .builds
            .pending_builds(self.pipeline_id, &job.name)
            .await?;
        if pending.is_empty() {
            return Ok(());
        }

        let mapping = self.input_mappings.next_input_mapping(saved_job.id).await?;
        let mut first_error: Option<SchedulerError> = None;

        for build in &pending {
            if let Some(max_in_flight) = job.max_in_flight() {
                let running = match self
                    .builds
                    .running_builds_count(self.pipeline_id, &job.name)
                    .await
                {
                    Ok(running) => running,
                    Err(e) => {
                        first_error.get_or_insert(e.into());
                        break;
                    }
                };
                if running >= max_in_flight as usize {
                    debug!(job = %job.name, running, "Max in flight reached");
                    break;
                }
            }

            if let Err(e) = self
                .try_start_build(build, job, &mapping, resources, resource_types)
                .await
            {
                warn!(job = %job.name, build = build.name, error = %e, "Failed to start build");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeExecutor, pipeline_config};
    use conveyor_core::clock::ManualClock;
    use conveyor_core::pipeline::{PipelineConfig, Version};
    use conveyor_core::versions::InputVersion;
    use conveyor_db::MemoryStore;
    use std::time::Duration;

    struct Fixture {
        store: MemoryStore,
        clock: ManualClock,
        repos: Repos,
        config: PipelineConfig,
        pipeline_id: PipelineId,
    }

    impl Fixture {
        async fn new(config: PipelineConfig) -> Self {
            let clock = ManualClock::default();
            let store = MemoryStore::with_clock(Arc::new(clock.clone()));
            let pipeline = store.save_config(&config).await.unwrap();
            Self {
                repos: Repos::memory(store.clone()),
                store,
                clock,
                config,
                pipeline_id: pipeline.id,
            }
        }

        /// Check a version of `repo` and make it the job's next input.
        async fn resolve_repo(&self) {
            let resource = self
                .store
                .get_resource(self.pipeline_id, "repo")
                .await
                .unwrap();
            let version = Version::from([("ref".to_string(), "abc".to_string())]);
            self.store
                .save_resource_versions(resource.id, &[version])
                .await
                .unwrap();
            let saved = self.store.latest_version(resource.id).await.unwrap().unwrap();
            let job = self
                .store
                .get_job(self.pipeline_id, "some-job")
                .await
                .unwrap();
            let mapping = InputMapping::from([(
                "repo".to_string(),
                InputVersion {
                    version_id: saved.id,
                    first_occurrence: true,
                },
            )]);
            self.store
                .save_next_input_mapping(job.id, &mapping)
                .await
                .unwrap();
        }

        fn starter(&self, executor: Arc<FakeExecutor>) -> PendingBuildStarter {
            PendingBuildStarter::new(self.pipeline_id, &self.repos, executor)
        }

        async fn start_all(&self, starter: &PendingBuildStarter) -> SchedulerResult<()> {
            starter
                .try_start_all_pending_builds(
                    &self.config.jobs[0],
                    &self.config.resources,
                    &self.config.resource_types,
                )
                .await
        }

        async fn status(&self, build: &Build) -> BuildStatus {
            BuildRepo::get(&self.store, build.id).await.unwrap().status
        }
    }

    #[tokio::test]
    async fn test_starts_older_build_and_leaves_newer_pending() {
        let fixture = Fixture::new(pipeline_config()).await;
        fixture
            .store
            .ensure_pending_build_exists(fixture.pipeline_id, "some-job")
            .await
            .unwrap();
        fixture.resolve_repo().await;
        fixture.clock.advance(Duration::from_secs(1));
        let newer = fixture
            .store
            .create_job_build(fixture.pipeline_id, "some-job")
            .await
            .unwrap();
        let older = fixture
            .store
            .pending_builds(fixture.pipeline_id, "some-job")
            .await
            .unwrap()
            .remove(0);
        let executor = Arc::new(FakeExecutor::default());

        let result = fixture.start_all(&fixture.starter(executor.clone())).await;

        assert!(result.is_ok());
        assert_eq!(fixture.status(&older).await, BuildStatus::Started);
        assert_eq!(fixture.status(&newer).await, BuildStatus::Pending);

        let started = executor.started.lock().unwrap();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].0.id, older.id);
        assert_eq!(started[0].1[0].name, "repo");
        assert_eq!(started[0].1[0].type_name, "git");
    }

    #[tokio::test]
    async fn test_unresolved_inputs_leave_builds_pending() {
        let fixture = Fixture::new(pipeline_config()).await;
        let build = fixture
            .store
            .create_job_build(fixture.pipeline_id, "some-job")
            .await
            .unwrap();
        let executor = Arc::new(FakeExecutor::default());

        fixture
            .start_all(&fixture.starter(executor.clone()))
            .await
            .unwrap();

        assert_eq!(fixture.status(&build).await, BuildStatus::Pending);
        assert_eq!(executor.started_count(), 0);
    }

    #[tokio::test]
    async fn test_continues_past_executor_failures_and_returns_error() {
        let fixture = Fixture::new(pipeline_config()).await;
        let first = fixture
            .store
            .create_job_build(fixture.pipeline_id, "some-job")
            .await
            .unwrap();
        let second = fixture
            .store
            .create_job_build(fixture.pipeline_id, "some-job")
            .await
            .unwrap();
        fixture.resolve_repo().await;
        let executor = Arc::new(FakeExecutor::failing());

        let result = fixture.start_all(&fixture.starter(executor.clone())).await;

        assert!(matches!(result, Err(SchedulerError::Core(_))));
        assert_eq!(executor.started_count(), 2);
        assert_eq!(fixture.status(&first).await, BuildStatus::Errored);
        assert_eq!(fixture.status(&second).await, BuildStatus::Errored);
    }

    #[tokio::test]
    async fn test_paused_job_starts_nothing() {
        let fixture = Fixture::new(pipeline_config()).await;
        let build = fixture
            .store
            .create_job_build(fixture.pipeline_id, "some-job")
            .await
            .unwrap();
        fixture.resolve_repo().await;
        fixture
            .store
            .set_job_paused(fixture.pipeline_id, "some-job", true)
            .await
            .unwrap();
        let executor = Arc::new(FakeExecutor::default());

        fixture
            .start_all(&fixture.starter(executor.clone()))
            .await
            .unwrap();

        assert_eq!(fixture.status(&build).await, BuildStatus::Pending);
    }

    #[tokio::test]
    async fn test_serial_job_runs_one_build_at_a_time() {
        let mut config = pipeline_config();
        config.jobs[0].serial = true;
        let fixture = Fixture::new(config).await;
        let first = fixture
            .store
            .create_job_build(fixture.pipeline_id, "some-job")
            .await
            .unwrap();
        let second = fixture
            .store
            .create_job_build(fixture.pipeline_id, "some-job")
            .await
            .unwrap();
        fixture.resolve_repo().await;
        let executor = Arc::new(FakeExecutor::default());
        let starter = fixture.starter(executor.clone());

        fixture.start_all(&starter).await.unwrap();
        fixture.start_all(&starter).await.unwrap();

        assert_eq!(fixture.status(&first).await, BuildStatus::Started);
        assert_eq!(fixture.status(&second).await, BuildStatus::Pending);
        assert_eq!(executor.started_count(), 1);
    }
}
