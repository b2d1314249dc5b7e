//! The per-pipeline scheduler.
//!
//! Ties resolution, pending build creation and build starting together for
//! one job at a time, either as part of a periodic pass ([`Scheduler::schedule`])
//! or on demand ([`Scheduler::trigger_immediately`]).

use conveyor_core::pipeline::{JobConfig, ResourceConfigs, ResourceTypes};
use conveyor_core::versions::{InputMapping, VersionsDb};
use conveyor_core::{Build, PipelineId};
use conveyor_db::{BuildRepo, LeaseManager, VersionRepo};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::build_starter::BuildStarter;
use crate::input_mapper::InputMapper;
use crate::radar::Scanner;
use crate::{SchedulerResult, release_lease};

const DEFAULT_JOB_CHECKING_LEASE: Duration = Duration::from_secs(5 * 60);

#[derive(Clone)]
pub struct Scheduler {
    pipeline_id: PipelineId,
    leases: LeaseManager,
    versions: Arc<dyn VersionRepo>,
    builds: Arc<dyn BuildRepo>,
    input_mapper: Arc<dyn InputMapper>,
    build_starter: Arc<dyn BuildStarter>,
    scanner: Arc<dyn Scanner>,
    job_checking_lease: Duration,
}

/// Completion handle for the background work of a manual trigger.
#[derive(Debug)]
pub struct Waiter {
    handle: JoinHandle<()>,
}

impl Waiter {
    /// Wait until inputs were checked and pending builds were tried.
    pub async fn wait(self) {
        if let Err(e) = self.handle.await {
            error!(error = %e, "Trigger task failed");
        }
    }
}

impl Scheduler {
    pub fn new(
        pipeline_id: PipelineId,
        leases: LeaseManager,
        versions: Arc<dyn VersionRepo>,
        builds: Arc<dyn BuildRepo>,
        input_mapper: Arc<dyn InputMapper>,
        build_starter: Arc<dyn BuildStarter>,
        scanner: Arc<dyn Scanner>,
    ) -> Self {
        Self {
            pipeline_id,
            leases,
            versions,
            builds,
            input_mapper,
            build_starter,
            scanner,
            job_checking_lease: DEFAULT_JOB_CHECKING_LEASE,
        }
    }

    /// How long a manual trigger may hold the job's checking lease.
    pub fn with_job_checking_lease(mut self, duration: Duration) -> Self {
        self.job_checking_lease = duration;
        self
    }

    pub fn pipeline_id(&self) -> PipelineId {
        self.pipeline_id
    }

    /// One scheduling pass for `job`.
    ///
    /// Resolves and stores the next input mapping. If a `trigger` input
    /// resolved to a version the job has never used, makes sure a pending
    /// build exists. Then tries to start the job's pending builds, which may
    /// include builds left pending by earlier passes.
    pub async fn schedule(
        &self,
        versions: &VersionsDb,
        job: &JobConfig,
        resources: &ResourceConfigs,
        resource_types: &ResourceTypes,
    ) -> SchedulerResult<()> {
        let mapping = self
            .input_mapper
            .save_next_input_mapping(versions, job)
            .await?;

        let triggered = job.inputs.iter().any(|input| {
            input.trigger
                && mapping
                    .get(&input.name)
                    .is_some_and(|resolved| resolved.first_occurrence)
        });
        if triggered {
            self.builds
                .ensure_pending_build_exists(self.pipeline_id, &job.name)
                .await?;
        }

        self.build_starter
            .try_start_all_pending_builds(job, resources, resource_types)
            .await
    }

    /// Create a build of `job` now, regardless of its trigger policy.
    ///
    /// If this instance gets the job's checking lease, the job's inputs are
    /// checked and its mapping re-resolved in the background before pending
    /// builds are tried; otherwise another trigger is already doing that and
    /// pending builds are tried straight away. Background failures are logged.
    pub async fn trigger_immediately(
        &self,
        job: &JobConfig,
        resources: &ResourceConfigs,
        resource_types: &ResourceTypes,
    ) -> SchedulerResult<(Build, Waiter)> {
        let lease = self
            .leases
            .acquire_job_checking_lease(self.pipeline_id, &job.name, self.job_checking_lease)
            .await?;

        let build = match self
            .builds
            .create_job_build(self.pipeline_id, &job.name)
            .await
        {
            Ok(build) => build,
            Err(e) => {
                if let Some(lease) = &lease {
                    release_lease(lease).await;
                }
                return Err(e.into());
            }
        };

        info!(
            pipeline = %self.pipeline_id,
            job = %job.name,
            build = build.name,
            checking = lease.is_some(),
            "Triggered build"
        );

        let scheduler = self.clone();
        let job = job.clone();
        let resources = resources.clone();
        let resource_types = resource_types.clone();

        let handle = tokio::spawn(async move {
            if let Some(lease) = lease {
                let result = scheduler.check_and_resolve(&job).await;
                release_lease(&lease).await;
                if let Err(e) = result {
                    warn!(job = %job.name, error = %e, "Failed to check inputs of triggered build");
                    return;
                }
            }

            if let Err(e) = scheduler
                .build_starter
                .try_start_all_pending_builds(&job, &resources, &resource_types)
                .await
            {
                error!(job = %job.name, error = %e, "Failed to start pending builds");
            }
        });

        Ok((build, Waiter { handle }))
    }

    /// Resolve and store the job's next input mapping without touching its builds.
    pub async fn save_next_input_mapping(&self, job: &JobConfig) -> SchedulerResult<InputMapping> {
        let versions = self.versions.load_versions_db(self.pipeline_id).await?;
        self.input_mapper
            .save_next_input_mapping(&versions, job)
            .await
    }

    async fn check_and_resolve(&self, job: &JobConfig) -> SchedulerResult<()> {
        for input in &job.inputs {
            self.scanner.scan(&input.resource).await?;
        }
        let versions = self.versions.load_versions_db(self.pipeline_id).await?;
        self.input_mapper
            .save_next_input_mapping(&versions, job)
            .await?;
        Ok(())
    }
}
