//! Build scheduling for Conveyor.
//!
//! Resolves job inputs against the version graph, decides when builds are
//! created, starts them, checks resources for new versions and tracks running
//! builds. Coordination between scheduler instances goes through leases.

pub mod algorithm;
pub mod build_starter;
pub mod error;
pub mod input_mapper;
pub mod queue;
pub mod radar;
pub mod runner;
pub mod scheduler;
pub mod tracker;

#[cfg(test)]
mod testing;

pub use build_starter::{BuildStarter, PendingBuildStarter};
pub use error::{SchedulerError, SchedulerResult};
pub use input_mapper::{InputMapper, VersionInputMapper};
pub use queue::{BuildQueue, QueueExecutor, QueuePayload, QueuedBuild};
pub use radar::{Radar, Scanner};
pub use runner::PipelineRunner;
pub use scheduler::{Scheduler, Waiter};
pub use tracker::BuildTracker;

use conveyor_db::Lease;
use tracing::warn;

/// Release a lease, logging instead of failing. An unreleased lease expires on its own.
pub(crate) async fn release_lease(lease: &Lease) {
    if let Err(e) = lease.release().await {
        warn!(key = %lease.key(), error = %e, "Failed to release lease");
    }
}
