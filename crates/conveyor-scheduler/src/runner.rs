//! Per-pipeline loops.
//!
//! A [`PipelineRunner`] wires the radar, the scheduler and the build tracker
//! of one pipeline together and drives them on their intervals. Any number
//! of runners for the same pipeline may run in different processes; leases
//! keep their work from overlapping.

use conveyor_config::SystemConfig;
use conveyor_core::PipelineId;
use conveyor_core::checker::ResourceChecker;
use conveyor_core::executor::BuildExecutor;
use conveyor_db::{LeaseManager, PipelineRepo, Repos, VersionRepo};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::build_starter::PendingBuildStarter;
use crate::input_mapper::VersionInputMapper;
use crate::radar::Radar;
use crate::scheduler::Scheduler;
use crate::tracker::BuildTracker;
use crate::{SchedulerResult, release_lease};

pub struct PipelineRunner {
    pipeline_id: PipelineId,
    leases: LeaseManager,
    pipelines: Arc<dyn PipelineRepo>,
    versions: Arc<dyn VersionRepo>,
    scheduler: Scheduler,
    radar: Arc<Radar>,
    tracker: BuildTracker,
    scheduling_interval: Duration,
    check_interval: Duration,
    tracking_interval: Duration,
}

impl PipelineRunner {
    pub fn new(
        pipeline_id: PipelineId,
        repos: &Repos,
        checker: Arc<dyn ResourceChecker>,
        executor: Arc<dyn BuildExecutor>,
        config: &SystemConfig,
    ) -> Self {
        let radar = Arc::new(Radar::new(pipeline_id, repos, checker, config));
        let scheduler = Scheduler::new(
            pipeline_id,
            repos.lease_manager(),
            repos.versions.clone(),
            repos.builds.clone(),
            Arc::new(VersionInputMapper::new(repos.input_mappings.clone())),
            Arc::new(PendingBuildStarter::new(pipeline_id, repos, executor.clone())),
            radar.clone(),
        )
        .with_job_checking_lease(config.job_checking_lease);

        Self {
            pipeline_id,
            leases: repos.lease_manager(),
            pipelines: repos.pipelines.clone(),
            versions: repos.versions.clone(),
            scheduler,
            radar,
            tracker: BuildTracker::new(pipeline_id, repos, executor, config),
            scheduling_interval: config.scheduling_interval,
            check_interval: config.check_interval,
            tracking_interval: config.tracking_interval,
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn radar(&self) -> &Radar {
        &self.radar
    }

    pub fn tracker(&self) -> &BuildTracker {
        &self.tracker
    }

    /// Schedule every job of the pipeline once, if no other instance did so
    /// within the last scheduling interval. Returns whether it ran.
    ///
    /// Every job is scheduled against the same version graph snapshot. A job
    /// failing to schedule does not stop the others.
    pub async fn run_once(&self) -> SchedulerResult<bool> {
        let pipeline = self.pipelines.get(self.pipeline_id).await?;
        if pipeline.paused {
            debug!(pipeline = %pipeline.name, "Pipeline paused, not scheduling");
            return Ok(false);
        }

        let Some(lease) = self
            .leases
            .acquire_scheduling_lease(self.pipeline_id, self.scheduling_interval)
            .await?
        else {
            debug!(pipeline = %pipeline.name, "Scheduled elsewhere");
            return Ok(false);
        };

        let result = self.schedule_jobs(&pipeline.config).await;
        release_lease(&lease).await;
        result.map(|()| true)
    }

    async fn schedule_jobs(
        &self,
        config: &conveyor_core::pipeline::PipelineConfig,
    ) -> SchedulerResult<()> {
        let versions = self.versions.load_versions_db(self.pipeline_id).await?;
        for job in &config.jobs {
            if let Err(e) = self
                .scheduler
                .schedule(&versions, job, &config.resources, &config.resource_types)
                .await
            {
                warn!(pipeline = %config.name, job = %job.name, error = %e, "Failed to schedule job");
            }
        }
        Ok(())
    }

    /// Drive checking, scheduling and tracking until the future is dropped.
    pub async fn run(&self) {
        info!(pipeline = %self.pipeline_id, "Starting pipeline runner");

        let mut scheduling = every(self.scheduling_interval);
        let mut checking = every(self.check_interval.min(self.scheduling_interval));
        let mut tracking = every(self.tracking_interval);

        loop {
            tokio::select! {
                _ = checking.tick() => {
                    if let Err(e) = self.radar.check_all().await {
                        warn!(pipeline = %self.pipeline_id, error = %e, "Failed to check resources");
                    }
                }
                _ = scheduling.tick() => {
                    if let Err(e) = self.run_once().await {
                        warn!(pipeline = %self.pipeline_id, error = %e, "Failed to schedule pipeline");
                    }
                }
                _ = tracking.tick() => {
                    if let Err(e) = self.tracker.track_started_builds().await {
                        warn!(pipeline = %self.pipeline_id, error = %e, "Failed to track builds");
                    }
                }
            }
        }
    }
}

fn every(period: Duration) -> tokio::time::Interval {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeChecker, FakeExecutor, pipeline_config};
    use conveyor_core::pipeline::Version;
    use conveyor_db::MemoryStore;

    struct Fixture {
        store: MemoryStore,
        executor: Arc<FakeExecutor>,
        runner: PipelineRunner,
        pipeline_id: PipelineId,
    }

    impl Fixture {
        async fn new() -> Self {
            let store = MemoryStore::new();
            let pipeline = store.save_config(&pipeline_config()).await.unwrap();
            let executor = Arc::new(FakeExecutor::default());
            let checker = Arc::new(FakeChecker::returning(vec![Version::from([(
                "ref".to_string(),
                "abc".to_string(),
            )])]));
            let runner = PipelineRunner::new(
                pipeline.id,
                &Repos::memory(store.clone()),
                checker,
                executor.clone(),
                &SystemConfig::default(),
            );
            Self {
                store,
                executor,
                runner,
                pipeline_id: pipeline.id,
            }
        }
    }

    #[tokio::test]
    async fn test_new_version_is_built_once() {
        let fixture = Fixture::new().await;
        fixture.runner.radar().check_all().await.unwrap();

        assert!(fixture.runner.run_once().await.unwrap());

        assert_eq!(fixture.executor.started_count(), 1);
        let (build, inputs) = fixture.executor.started.lock().unwrap()[0].clone();
        assert_eq!(build.job_name, "some-job");
        assert!(!build.manually_triggered);
        assert_eq!(inputs[0].name, "repo");
        assert_eq!(inputs[0].version["ref"], "abc");
    }

    #[tokio::test]
    async fn test_run_once_waits_for_scheduling_interval() {
        let fixture = Fixture::new().await;

        assert!(fixture.runner.run_once().await.unwrap());
        assert!(!fixture.runner.run_once().await.unwrap());
    }

    #[tokio::test]
    async fn test_paused_pipeline_is_not_scheduled() {
        let fixture = Fixture::new().await;
        fixture.runner.radar().check_all().await.unwrap();
        fixture
            .store
            .set_paused(fixture.pipeline_id, true)
            .await
            .unwrap();

        assert!(!fixture.runner.run_once().await.unwrap());
        assert_eq!(fixture.executor.started_count(), 0);
    }
}
