//! Build tracking.
//!
//! Polls the executor for the state of started builds and records the ones
//! that finished, together with the versions they produced.

use conveyor_config::SystemConfig;
use conveyor_core::executor::{BuildExecutor, ExecutionStatus};
use conveyor_core::{Build, BuildStatus, PipelineId};
use conveyor_db::{BuildRepo, LeaseManager, Repos};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::{SchedulerResult, release_lease};

pub struct BuildTracker {
    pipeline_id: PipelineId,
    leases: LeaseManager,
    builds: Arc<dyn BuildRepo>,
    executor: Arc<dyn BuildExecutor>,
    interval: Duration,
}

impl BuildTracker {
    pub fn new(
        pipeline_id: PipelineId,
        repos: &Repos,
        executor: Arc<dyn BuildExecutor>,
        config: &SystemConfig,
    ) -> Self {
        Self {
            pipeline_id,
            leases: repos.lease_manager(),
            builds: repos.builds.clone(),
            executor,
            interval: config.tracking_interval,
        }
    }

    /// Poll every started build of the pipeline once. Per-build failures are logged.
    pub async fn track_started_builds(&self) -> SchedulerResult<()> {
        let builds = self.builds.started_builds(self.pipeline_id).await?;
        for build in builds {
            if let Err(e) = self.track(&build).await {
                warn!(build_id = %build.id, job = %build.job_name, error = %e, "Failed to track build");
            }
        }
        Ok(())
    }

    async fn track(&self, build: &Build) -> SchedulerResult<()> {
        let Some(lease) = self
            .leases
            .acquire_build_tracking_lease(build.id, self.interval)
            .await?
        else {
            debug!(build_id = %build.id, "Build tracked elsewhere");
            return Ok(());
        };

        let result = self.record_status(build).await;
        release_lease(&lease).await;
        result
    }

    async fn record_status(&self, build: &Build) -> SchedulerResult<()> {
        let (status, outputs) = match self.executor.status(build).await? {
            ExecutionStatus::Queued | ExecutionStatus::Running => return Ok(()),
            ExecutionStatus::Succeeded { outputs } => (BuildStatus::Succeeded, outputs),
            ExecutionStatus::Failed { message } => {
                info!(build_id = %build.id, job = %build.job_name, reason = %message, "Build failed");
                (BuildStatus::Failed, Vec::new())
            }
        };

        if self.builds.finish_build(build.id, status, &outputs).await? {
            info!(
                build_id = %build.id,
                job = %build.job_name,
                build = build.name,
                %status,
                outputs = outputs.len(),
                "Build finished"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeExecutor, pipeline_config};
    use conveyor_core::executor::ProducedVersion;
    use conveyor_core::pipeline::Version;
    use conveyor_db::{MemoryStore, PipelineRepo, VersionRepo};

    struct Fixture {
        store: MemoryStore,
        repos: Repos,
        pipeline_id: PipelineId,
        executor: Arc<FakeExecutor>,
    }

    impl Fixture {
        async fn new() -> Self {
            let store = MemoryStore::new();
            let pipeline = store.save_config(&pipeline_config()).await.unwrap();
            Self {
                repos: Repos::memory(store.clone()),
                store,
                pipeline_id: pipeline.id,
                executor: Arc::new(FakeExecutor::default()),
            }
        }

        fn tracker(&self) -> BuildTracker {
            BuildTracker::new(
                self.pipeline_id,
                &self.repos,
                self.executor.clone(),
                &SystemConfig::default(),
            )
        }

        async fn started_build(&self) -> Build {
            let build = self
                .store
                .create_job_build(self.pipeline_id, "some-job")
                .await
                .unwrap();
            assert!(self.store.start_build(build.id, &[]).await.unwrap());
            build
        }

        async fn status_of(&self, build: &Build) -> BuildStatus {
            BuildRepo::get(&self.store, build.id).await.unwrap().status
        }
    }

    #[tokio::test]
    async fn test_running_build_stays_started() {
        let fixture = Fixture::new().await;
        let build = fixture.started_build().await;

        fixture.tracker().track_started_builds().await.unwrap();

        assert_eq!(fixture.status_of(&build).await, BuildStatus::Started);
    }

    #[tokio::test]
    async fn test_succeeded_build_records_outputs() {
        let fixture = Fixture::new().await;
        let build = fixture.started_build().await;
        let version = Version::from([("ref".to_string(), "abc".to_string())]);
        fixture.executor.set_status(
            build.id,
            ExecutionStatus::Succeeded {
                outputs: vec![ProducedVersion {
                    resource: "repo".to_string(),
                    version: version.clone(),
                }],
            },
        );

        fixture.tracker().track_started_builds().await.unwrap();

        assert_eq!(fixture.status_of(&build).await, BuildStatus::Succeeded);
        let versions = fixture
            .store
            .load_versions_db(fixture.pipeline_id)
            .await
            .unwrap();
        assert_eq!(versions.build_outputs.len(), 1);
        assert_eq!(versions.build_outputs[0].build_id, build.id);
    }

    #[tokio::test]
    async fn test_failed_build_is_finished_as_failed() {
        let fixture = Fixture::new().await;
        let build = fixture.started_build().await;
        fixture.executor.set_status(
            build.id,
            ExecutionStatus::Failed {
                message: "exit status 1".to_string(),
            },
        );

        fixture.tracker().track_started_builds().await.unwrap();

        assert_eq!(fixture.status_of(&build).await, BuildStatus::Failed);
    }

    #[tokio::test]
    async fn test_build_tracked_elsewhere_is_skipped() {
        let fixture = Fixture::new().await;
        let build = fixture.started_build().await;
        fixture.executor.set_status(
            build.id,
            ExecutionStatus::Failed {
                message: "exit status 1".to_string(),
            },
        );
        let _held = fixture
            .repos
            .lease_manager()
            .acquire_build_tracking_lease(build.id, Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();

        fixture.tracker().track_started_builds().await.unwrap();

        assert_eq!(fixture.status_of(&build).await, BuildStatus::Started);
    }
}
