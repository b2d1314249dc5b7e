//! Scheduler error types.

use conveyor_db::DbError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Core(#[from] conveyor_core::Error),

    #[error("checking {resource} failed: {message}")]
    Scan { resource: String, message: String },

    #[error("unknown job: {0}")]
    UnknownJob(String),

    #[error("unknown resource: {0}")]
    UnknownResource(String),
}

pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;
