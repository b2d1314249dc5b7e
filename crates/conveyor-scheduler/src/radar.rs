//! Resource checking.
//!
//! The radar asks a [`ResourceChecker`] for new versions of a pipeline's
//! resources and resource types and records them. Every check runs under the
//! resource's checking lease, so at most one scheduler instance checks a
//! given resource at a time.

use async_trait::async_trait;
use conveyor_config::SystemConfig;
use conveyor_core::PipelineId;
use conveyor_core::checker::ResourceChecker;
use conveyor_core::pipeline::{PipelineConfig, ResourceConfig, ResourceType};
use conveyor_db::{
    Lease, LeaseManager, PipelineRepo, Repos, SavedResource, SavedResourceType, VersionRepo,
};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::{SchedulerError, SchedulerResult, release_lease};

/// On-demand resource checking.
#[async_trait]
pub trait Scanner: Send + Sync {
    /// Check `resource` for new versions now. If another check of it is in
    /// progress, wait for that one to finish first.
    async fn scan(&self, resource: &str) -> SchedulerResult<()>;
}

pub struct Radar {
    pipeline_id: PipelineId,
    leases: LeaseManager,
    pipelines: Arc<dyn PipelineRepo>,
    versions: Arc<dyn VersionRepo>,
    checker: Arc<dyn ResourceChecker>,
    check_interval: Duration,
    scan_lease: Duration,
    scan_retry: Duration,
}

impl Radar {
    pub fn new(
        pipeline_id: PipelineId,
        repos: &Repos,
        checker: Arc<dyn ResourceChecker>,
        config: &SystemConfig,
    ) -> Self {
        Self {
            pipeline_id,
            leases: repos.lease_manager(),
            pipelines: repos.pipelines.clone(),
            versions: repos.versions.clone(),
            checker,
            check_interval: config.check_interval,
            scan_lease: config.scan_lease,
            scan_retry: config.scan_retry,
        }
    }

    /// Periodic pass: check every resource type, then every unpaused resource
    /// whose interval has elapsed, concurrently. Individual failures are logged.
    pub async fn check_all(&self) -> SchedulerResult<()> {
        let pipeline = self.pipelines.get(self.pipeline_id).await?;
        if pipeline.paused {
            debug!(pipeline = %pipeline.name, "Pipeline paused, not checking");
            return Ok(());
        }
        let config = &pipeline.config;

        for resource_type in config.resource_types.iter() {
            if let Err(e) = self.check_resource_type(config, resource_type).await {
                warn!(
                    pipeline = %pipeline.name,
                    resource_type = %resource_type.name,
                    error = %e,
                    "Resource type check failed"
                );
            }
        }

        let checks = config.resources.iter().map(|resource| async move {
            (resource, self.check_periodically(config, resource).await)
        });
        for (resource, result) in join_all(checks).await {
            if let Err(e) = result {
                warn!(
                    pipeline = %pipeline.name,
                    resource = %resource.name,
                    error = %e,
                    "Resource check failed"
                );
            }
        }

        Ok(())
    }

    async fn check_periodically(
        &self,
        config: &PipelineConfig,
        resource: &ResourceConfig,
    ) -> SchedulerResult<()> {
        let saved = self
            .pipelines
            .get_resource(self.pipeline_id, &resource.name)
            .await?;
        if saved.paused {
            debug!(resource = %resource.name, "Resource paused, not checking");
            return Ok(());
        }

        let interval = resource.check_every.unwrap_or(self.check_interval);
        let Some(lease) = self
            .leases
            .acquire_resource_checking_lease(self.pipeline_id, &resource.name, interval, false)
            .await?
        else {
            return Ok(());
        };

        let result = self.check_resource(config, resource, &saved).await;
        release_lease(&lease).await;
        result
    }

    async fn check_resource(
        &self,
        config: &PipelineConfig,
        resource: &ResourceConfig,
        saved: &SavedResource,
    ) -> SchedulerResult<()> {
        let from = self
            .versions
            .latest_version(saved.id)
            .await?
            .map(|v| v.version);

        let found = match self
            .checker
            .check(
                &resource.type_name,
                &resource.source,
                from.as_ref(),
                &config.resource_types,
            )
            .await
        {
            Ok(found) => found,
            Err(e) => {
                let message = e.to_string();
                self.pipelines
                    .set_resource_check_error(saved.id, Some(&message))
                    .await?;
                return Err(SchedulerError::Scan {
                    resource: resource.name.clone(),
                    message,
                });
            }
        };

        self.versions
            .save_resource_versions(saved.id, &found)
            .await?;
        if saved.check_error.is_some() {
            self.pipelines
                .set_resource_check_error(saved.id, None)
                .await?;
        }

        debug!(resource = %resource.name, versions = found.len(), "Checked resource");
        Ok(())
    }

    async fn check_resource_type(
        &self,
        config: &PipelineConfig,
        resource_type: &ResourceType,
    ) -> SchedulerResult<()> {
        let saved = self
            .pipelines
            .get_resource_type(self.pipeline_id, &resource_type.name)
            .await?;

        let Some(lease) = self
            .leases
            .acquire_resource_type_checking_lease(
                self.pipeline_id,
                &resource_type.name,
                self.check_interval,
                false,
            )
            .await?
        else {
            return Ok(());
        };

        let result = self
            .record_resource_type_check(config, resource_type, &saved)
            .await;
        release_lease(&lease).await;
        result
    }

    async fn record_resource_type_check(
        &self,
        config: &PipelineConfig,
        resource_type: &ResourceType,
        saved: &SavedResourceType,
    ) -> SchedulerResult<()> {
        let found = match self
            .checker
            .check(
                &resource_type.type_name,
                &resource_type.source,
                saved.version.as_ref(),
                &config.resource_types,
            )
            .await
        {
            Ok(found) => found,
            Err(e) => {
                let message = e.to_string();
                self.pipelines
                    .set_resource_type_check_error(saved.id, Some(&message))
                    .await?;
                return Err(SchedulerError::Scan {
                    resource: resource_type.name.clone(),
                    message,
                });
            }
        };

        if let Some(latest) = found.last() {
            self.pipelines
                .save_resource_type_version(saved.id, latest)
                .await?;
        }
        if saved.check_error.is_some() {
            self.pipelines
                .set_resource_type_check_error(saved.id, None)
                .await?;
        }
        Ok(())
    }

    /// Take the resource's checking lease as soon as it is free, giving up
    /// after one lease duration.
    async fn acquire_for_scan(&self, resource: &str) -> SchedulerResult<Lease> {
        let deadline = Instant::now() + self.scan_lease;
        loop {
            if let Some(lease) = self
                .leases
                .acquire_resource_checking_lease(self.pipeline_id, resource, self.scan_lease, true)
                .await?
            {
                return Ok(lease);
            }

            if Instant::now() >= deadline {
                return Err(SchedulerError::Scan {
                    resource: resource.to_string(),
                    message: "timed out waiting for a check in progress".to_string(),
                });
            }

            debug!(resource, "Check in progress, waiting");
            sleep(self.scan_retry).await;
        }
    }
}

#[async_trait]
impl Scanner for Radar {
    async fn scan(&self, resource_name: &str) -> SchedulerResult<()> {
        let pipeline = self.pipelines.get(self.pipeline_id).await?;
        let resource = pipeline
            .config
            .resources
            .lookup(resource_name)
            .ok_or_else(|| SchedulerError::UnknownResource(resource_name.to_string()))?;
        let saved = self
            .pipelines
            .get_resource(self.pipeline_id, resource_name)
            .await?;

        let lease = self.acquire_for_scan(resource_name).await?;
        let result = self.check_resource(&pipeline.config, resource, &saved).await;
        release_lease(&lease).await;

        if result.is_ok() {
            info!(pipeline = %pipeline.name, resource = resource_name, "Scanned resource");
        }
        result
    }
}
