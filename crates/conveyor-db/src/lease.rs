//! Named, time-bounded mutual exclusion across scheduler instances.
//!
//! A lease is claimed through [`LeaseRepo::try_acquire`], which arbitrates
//! with the store's clock in a single atomic statement. Not acquiring a lease
//! is an expected outcome and is reported as `Ok(None)`.

use chrono::{DateTime, Utc};
use conveyor_core::{BuildId, PipelineId};
use derive_more::Display;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::DbResult;
use crate::repo::LeaseRepo;

/// Lock domains. The display form is the key stored in the lease table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display)]
pub enum LeaseKey {
    #[display("scheduling:{pipeline}")]
    Scheduling { pipeline: PipelineId },
    #[display("checking:resource:{pipeline}:{resource}")]
    ResourceChecking {
        pipeline: PipelineId,
        resource: String,
    },
    #[display("checking:resource-type:{pipeline}:{resource_type}")]
    ResourceTypeChecking {
        pipeline: PipelineId,
        resource_type: String,
    },
    #[display("checking:job:{pipeline}:{job}")]
    JobChecking { pipeline: PipelineId, job: String },
    #[display("tracking:build:{build}")]
    BuildTracking { build: BuildId },
}

/// Hands out leases in the scheduler's lock domains.
#[derive(Clone)]
pub struct LeaseManager {
    repo: Arc<dyn LeaseRepo>,
}

impl LeaseManager {
    pub fn new(repo: Arc<dyn LeaseRepo>) -> Self {
        Self { repo }
    }

    /// Try to claim `key` for `duration`.
    ///
    /// With `immediate = false` a key cannot be claimed again until
    /// `duration` has passed since its last claim, even if that claim was
    /// released early. With `immediate = true` a released or expired lease
    /// can be claimed right away.
    pub async fn acquire(
        &self,
        key: &LeaseKey,
        duration: Duration,
        immediate: bool,
    ) -> DbResult<Option<Lease>> {
        let key = key.to_string();
        let holder = Uuid::new_v4();

        let Some(record) = self
            .repo
            .try_acquire(&key, holder, duration, immediate)
            .await?
        else {
            debug!(lease = %key, "Lease not acquired");
            return Ok(None);
        };

        debug!(lease = %key, valid_until = %record.valid_until, "Lease acquired");
        Ok(Some(Lease {
            repo: self.repo.clone(),
            key,
            holder,
            acquired_at: record.acquired_at,
            valid_until: record.valid_until,
            released: AtomicBool::new(false),
        }))
    }

    /// The per-pipeline scheduling lease. Held for at most one pass per `interval`.
    pub async fn acquire_scheduling_lease(
        &self,
        pipeline: PipelineId,
        interval: Duration,
    ) -> DbResult<Option<Lease>> {
        self.acquire(&LeaseKey::Scheduling { pipeline }, interval, false)
            .await
    }

    pub async fn acquire_resource_checking_lease(
        &self,
        pipeline: PipelineId,
        resource: &str,
        interval: Duration,
        immediate: bool,
    ) -> DbResult<Option<Lease>> {
        let key = LeaseKey::ResourceChecking {
            pipeline,
            resource: resource.to_string(),
        };
        self.acquire(&key, interval, immediate).await
    }

    pub async fn acquire_resource_type_checking_lease(
        &self,
        pipeline: PipelineId,
        resource_type: &str,
        interval: Duration,
        immediate: bool,
    ) -> DbResult<Option<Lease>> {
        let key = LeaseKey::ResourceTypeChecking {
            pipeline,
            resource_type: resource_type.to_string(),
        };
        self.acquire(&key, interval, immediate).await
    }

    /// The per-job lease guarding a manual trigger's checks. Reclaimable as
    /// soon as the previous trigger releases it.
    pub async fn acquire_job_checking_lease(
        &self,
        pipeline: PipelineId,
        job: &str,
        duration: Duration,
    ) -> DbResult<Option<Lease>> {
        let key = LeaseKey::JobChecking {
            pipeline,
            job: job.to_string(),
        };
        self.acquire(&key, duration, true).await
    }

    pub async fn acquire_build_tracking_lease(
        &self,
        build: BuildId,
        interval: Duration,
    ) -> DbResult<Option<Lease>> {
        self.acquire(&LeaseKey::BuildTracking { build }, interval, false)
            .await
    }
}

/// A held lease. Dropping it without releasing leaves it to expire.
pub struct Lease {
    repo: Arc<dyn LeaseRepo>,
    key: String,
    holder: Uuid,
    acquired_at: DateTime<Utc>,
    valid_until: DateTime<Utc>,
    released: AtomicBool,
}

impl Lease {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    pub fn valid_until(&self) -> DateTime<Utc> {
        self.valid_until
    }

    /// Give the lease up. Once a release succeeds, later calls are no-ops;
    /// a failed release can be retried.
    pub async fn release(&self) -> DbResult<()> {
        if self.released.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.repo.release(&self.key, self.holder).await?;
        self.released.store(true, Ordering::SeqCst);
        debug!(lease = %self.key, "Lease released");
        Ok(())
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("key", &self.key)
            .field("holder", &self.holder)
            .field("valid_until", &self.valid_until)
            .finish()
    }
}
