//! Builds of jobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{BuildId, Error, JobId, PipelineId};

/// A build of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Build {
    pub id: BuildId,
    pub pipeline_id: PipelineId,
    pub job_id: JobId,
    pub job_name: String,
    /// Per-job sequence number, starting at 1.
    pub name: i64,
    pub status: BuildStatus,
    /// Created by an explicit trigger rather than the trigger policy.
    pub manually_triggered: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Lifecycle state of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    /// Created, waiting for satisfiable inputs.
    Pending,
    /// Handed to the build executor.
    Started,
    Succeeded,
    Failed,
    /// Could not be run (e.g. the executor rejected it).
    Errored,
    Aborted,
}

impl BuildStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuildStatus::Succeeded
                | BuildStatus::Failed
                | BuildStatus::Errored
                | BuildStatus::Aborted
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Pending => "pending",
            BuildStatus::Started => "started",
            BuildStatus::Succeeded => "succeeded",
            BuildStatus::Failed => "failed",
            BuildStatus::Errored => "errored",
            BuildStatus::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BuildStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BuildStatus::Pending),
            "started" => Ok(BuildStatus::Started),
            "succeeded" => Ok(BuildStatus::Succeeded),
            "failed" => Ok(BuildStatus::Failed),
            "errored" => Ok(BuildStatus::Errored),
            "aborted" => Ok(BuildStatus::Aborted),
            other => Err(Error::InvalidInput(format!("unknown build status: {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parses_its_own_display() {
        for status in [
            BuildStatus::Pending,
            BuildStatus::Started,
            BuildStatus::Succeeded,
            BuildStatus::Failed,
            BuildStatus::Errored,
            BuildStatus::Aborted,
        ] {
            assert_eq!(status.to_string().parse::<BuildStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_only_finished_statuses_are_terminal() {
        assert!(!BuildStatus::Pending.is_terminal());
        assert!(!BuildStatus::Started.is_terminal());
        assert!(BuildStatus::Errored.is_terminal());
    }
}
