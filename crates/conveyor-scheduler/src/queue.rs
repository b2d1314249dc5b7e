//! Build queue backed by PostgreSQL.
//!
//! The queue executor hands started builds to external workers through the
//! `build_queue` table. Workers live outside this repo: they claim rows with
//! `FOR UPDATE SKIP LOCKED`, run them and write back `succeeded` with the
//! produced versions, or `failed` with an error.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conveyor_core::executor::{BuildExecutor, ExecutionStatus, ProducedVersion, ResolvedInput};
use conveyor_core::pipeline::ResourceTypes;
use conveyor_core::{Build, BuildId, Error, Result};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use sqlx::types::Json;
use tracing::info;

/// Everything a worker needs to run a build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuePayload {
    pub build: Build,
    pub inputs: Vec<ResolvedInput>,
    pub resource_types: ResourceTypes,
}

/// A queue entry.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct QueuedBuild {
    pub id: uuid::Uuid,
    pub build_id: uuid::Uuid,
    pub payload: Json<QueuePayload>,
    pub status: String,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub outputs: Option<Json<Vec<ProducedVersion>>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl QueuedBuild {
    fn execution_status(&self) -> Result<ExecutionStatus> {
        match self.status.as_str() {
            "queued" => Ok(ExecutionStatus::Queued),
            "claimed" => Ok(ExecutionStatus::Running),
            "succeeded" => Ok(ExecutionStatus::Succeeded {
                outputs: self
                    .outputs
                    .as_ref()
                    .map(|outputs| outputs.0.clone())
                    .unwrap_or_default(),
            }),
            "failed" => Ok(ExecutionStatus::Failed {
                message: self.error.clone().unwrap_or_default(),
            }),
            other => Err(Error::Internal(format!("unknown queue status: {}", other))),
        }
    }
}

pub struct BuildQueue {
    pool: PgPool,
}

impl BuildQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Enqueue a started build. Enqueueing the same build twice is a no-op.
    pub async fn enqueue(&self, payload: &QueuePayload) -> std::result::Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO build_queue (id, build_id, payload, status, created_at)
            VALUES ($1, $2, $3, 'queued', NOW())
            ON CONFLICT (build_id) DO NOTHING
            "#,
        )
        .bind(uuid::Uuid::now_v7())
        .bind(payload.build.id.as_uuid())
        .bind(Json(payload))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(
        &self,
        build_id: BuildId,
    ) -> std::result::Result<Option<QueuedBuild>, sqlx::Error> {
        sqlx::query_as::<_, QueuedBuild>("SELECT * FROM build_queue WHERE build_id = $1")
            .bind(build_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
    }
}

fn queue_error(e: sqlx::Error) -> Error {
    Error::ExecutionFailed(format!("build queue: {}", e))
}

/// Executor that only enqueues builds; workers do the running.
pub struct QueueExecutor {
    queue: BuildQueue,
}

impl QueueExecutor {
    pub fn new(pool: PgPool) -> Self {
        Self {
            queue: BuildQueue::new(pool),
        }
    }
}

#[async_trait]
impl BuildExecutor for QueueExecutor {
    fn name(&self) -> &'static str {
        "queue"
    }

    async fn start(
        &self,
        build: &Build,
        inputs: &[ResolvedInput],
        resource_types: &ResourceTypes,
    ) -> Result<()> {
        let payload = QueuePayload {
            build: build.clone(),
            inputs: inputs.to_vec(),
            resource_types: resource_types.clone(),
        };
        self.queue.enqueue(&payload).await.map_err(queue_error)?;
        info!(build_id = %build.id, job = %build.job_name, "Enqueued build");
        Ok(())
    }

    async fn status(&self, build: &Build) -> Result<ExecutionStatus> {
        match self.queue.get(build.id).await.map_err(queue_error)? {
            Some(entry) => entry.execution_status(),
            None => Err(Error::NotFound(format!("queued build {}", build.id))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::pipeline::Version;

    fn entry(status: &str) -> QueuedBuild {
        QueuedBuild {
            id: uuid::Uuid::now_v7(),
            build_id: uuid::Uuid::now_v7(),
            payload: Json(QueuePayload {
                build: Build {
                    id: BuildId::new(),
                    pipeline_id: Default::default(),
                    job_id: Default::default(),
                    job_name: "some-job".to_string(),
                    name: 1,
                    status: conveyor_core::BuildStatus::Started,
                    manually_triggered: false,
                    created_at: Utc::now(),
                    started_at: Some(Utc::now()),
                    finished_at: None,
                },
                inputs: Vec::new(),
                resource_types: ResourceTypes::default(),
            }),
            status: status.to_string(),
            claimed_by: None,
            claimed_at: None,
            outputs: None,
            error: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_claimed_entry_is_running() {
        assert_eq!(
            entry("claimed").execution_status().unwrap(),
            ExecutionStatus::Running
        );
    }

    #[test]
    fn test_succeeded_entry_reports_outputs() {
        let mut entry = entry("succeeded");
        let output = ProducedVersion {
            resource: "repo".to_string(),
            version: Version::from([("ref".to_string(), "abc".to_string())]),
        };
        entry.outputs = Some(Json(vec![output.clone()]));

        assert_eq!(
            entry.execution_status().unwrap(),
            ExecutionStatus::Succeeded {
                outputs: vec![output]
            }
        );
    }

    #[test]
    fn test_failed_entry_reports_error() {
        let mut entry = entry("failed");
        entry.error = Some("exit status 1".to_string());

        assert_eq!(
            entry.execution_status().unwrap(),
            ExecutionStatus::Failed {
                message: "exit status 1".to_string()
            }
        );
    }

    #[test]
    fn test_unknown_status_is_an_error() {
        assert!(entry("exploded").execution_status().is_err());
    }
}
