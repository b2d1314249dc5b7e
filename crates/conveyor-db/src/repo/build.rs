//! Build repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conveyor_core::executor::ProducedVersion;
use conveyor_core::{Build, BuildId, BuildStatus, PipelineId, VersionId};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::{DbError, DbResult};

#[async_trait]
pub trait BuildRepo: Send + Sync {
    /// Create a new pending, manually triggered build of a job.
    async fn create_job_build(&self, pipeline_id: PipelineId, job_name: &str) -> DbResult<Build>;

    /// Create a pending build of a job unless a non-manual pending build
    /// already exists. Safe to call concurrently.
    async fn ensure_pending_build_exists(
        &self,
        pipeline_id: PipelineId,
        job_name: &str,
    ) -> DbResult<()>;

    /// Pending builds of a job, oldest first.
    async fn pending_builds(&self, pipeline_id: PipelineId, job_name: &str)
    -> DbResult<Vec<Build>>;

    /// Number of started builds of a job.
    async fn running_builds_count(&self, pipeline_id: PipelineId, job_name: &str)
    -> DbResult<usize>;

    /// Record the build's inputs and move it from pending to started.
    ///
    /// Returns `false` (and records nothing) if the build is no longer pending.
    async fn start_build(&self, id: BuildId, inputs: &[(String, VersionId)]) -> DbResult<bool>;

    /// Move a started build to a terminal status, recording its outputs.
    ///
    /// Outputs naming versions that were never checked are stored unchecked.
    /// Returns `false` if the build was not in the started state.
    async fn finish_build(
        &self,
        id: BuildId,
        status: BuildStatus,
        outputs: &[ProducedVersion],
    ) -> DbResult<bool>;

    /// Started builds of every job of a pipeline.
    async fn started_builds(&self, pipeline_id: PipelineId) -> DbResult<Vec<Build>>;

    async fn get(&self, id: BuildId) -> DbResult<Build>;
}

const BUILD_COLUMNS: &str = r#"
    b.id, j.pipeline_id, b.job_id, j.name AS job_name, b.name, b.status,
    b.manually_triggered, b.created_at, b.started_at, b.finished_at
"#;

#[derive(sqlx::FromRow)]
struct BuildRow {
    id: Uuid,
    pipeline_id: Uuid,
    job_id: Uuid,
    job_name: String,
    name: i64,
    status: String,
    manually_triggered: bool,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<BuildRow> for Build {
    type Error = DbError;

    fn try_from(row: BuildRow) -> DbResult<Self> {
        let status = row
            .status
            .parse()
            .map_err(|e: conveyor_core::Error| DbError::Corrupt(e.to_string()))?;
        Ok(Build {
            id: row.id.into(),
            pipeline_id: row.pipeline_id.into(),
            job_id: row.job_id.into(),
            job_name: row.job_name,
            name: row.name,
            status,
            manually_triggered: row.manually_triggered,
            created_at: row.created_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
        })
    }
}

/// PostgreSQL implementation of BuildRepo.
pub struct PgBuildRepo {
    pool: PgPool,
}

impl PgBuildRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Lock the job row, serializing build creation per job.
    async fn lock_job(
        tx: &mut Transaction<'_, Postgres>,
        pipeline_id: PipelineId,
        job_name: &str,
    ) -> DbResult<Uuid> {
        let job_id: Option<Uuid> = sqlx::query_scalar(
            "SELECT id FROM jobs WHERE pipeline_id = $1 AND name = $2 AND active FOR UPDATE",
        )
        .bind(pipeline_id.as_uuid())
        .bind(job_name)
        .fetch_optional(&mut **tx)
        .await?;
        job_id.ok_or_else(|| DbError::NotFound(format!("job {}", job_name)))
    }

    async fn insert_build(
        tx: &mut Transaction<'_, Postgres>,
        job_id: Uuid,
        manually_triggered: bool,
    ) -> DbResult<Uuid> {
        let number: i64 = sqlx::query_scalar(
            "UPDATE jobs SET build_number_seq = build_number_seq + 1 WHERE id = $1 RETURNING build_number_seq",
        )
        .bind(job_id)
        .fetch_one(&mut **tx)
        .await?;

        let id = Uuid::now_v7();
        sqlx::query(
            r#"
            INSERT INTO builds (id, job_id, name, status, manually_triggered, created_at)
            VALUES ($1, $2, $3, 'pending', $4, NOW())
            "#,
        )
        .bind(id)
        .bind(job_id)
        .bind(number)
        .bind(manually_triggered)
        .execute(&mut **tx)
        .await?;
        Ok(id)
    }
}

#[async_trait]
impl BuildRepo for PgBuildRepo {
    async fn create_job_build(&self, pipeline_id: PipelineId, job_name: &str) -> DbResult<Build> {
        let mut tx = self.pool.begin().await?;
        let job_id = Self::lock_job(&mut tx, pipeline_id, job_name).await?;
        let id = Self::insert_build(&mut tx, job_id, true).await?;
        tx.commit().await?;
        self.get(id.into()).await
    }

    async fn ensure_pending_build_exists(
        &self,
        pipeline_id: PipelineId,
        job_name: &str,
    ) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;
        let job_id = Self::lock_job(&mut tx, pipeline_id, job_name).await?;

        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM builds
                WHERE job_id = $1 AND status = 'pending' AND NOT manually_triggered
            )
            "#,
        )
        .bind(job_id)
        .fetch_one(&mut *tx)
        .await?;

        if !exists {
            Self::insert_build(&mut tx, job_id, false).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn pending_builds(
        &self,
        pipeline_id: PipelineId,
        job_name: &str,
    ) -> DbResult<Vec<Build>> {
        sqlx::query_as::<_, BuildRow>(&format!(
            r#"
            SELECT {BUILD_COLUMNS}
            FROM builds b JOIN jobs j ON j.id = b.job_id
            WHERE j.pipeline_id = $1 AND j.name = $2 AND b.status = 'pending'
            ORDER BY b.name ASC
            "#
        ))
        .bind(pipeline_id.as_uuid())
        .bind(job_name)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(TryInto::try_into)
        .collect()
    }

    async fn running_builds_count(
        &self,
        pipeline_id: PipelineId,
        job_name: &str,
    ) -> DbResult<usize> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM builds b JOIN jobs j ON j.id = b.job_id
            WHERE j.pipeline_id = $1 AND j.name = $2 AND b.status = 'started'
            "#,
        )
        .bind(pipeline_id.as_uuid())
        .bind(job_name)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as usize)
    }

    async fn start_build(&self, id: BuildId, inputs: &[(String, VersionId)]) -> DbResult<bool> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE builds SET status = 'started', started_at = NOW() WHERE id = $1 AND status = 'pending'",
        )
        .bind(id.as_uuid())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        for (input_name, version_id) in inputs {
            sqlx::query(
                "INSERT INTO build_inputs (build_id, version_id, input_name) VALUES ($1, $2, $3)",
            )
            .bind(id.as_uuid())
            .bind(version_id.as_uuid())
            .bind(input_name)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn finish_build(
        &self,
        id: BuildId,
        status: BuildStatus,
        outputs: &[ProducedVersion],
    ) -> DbResult<bool> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE builds SET status = $2, finished_at = NOW() WHERE id = $1 AND status = 'started'",
        )
        .bind(id.as_uuid())
        .bind(status.as_str())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        for output in outputs {
            let resource_id: Option<Uuid> = sqlx::query_scalar(
                r#"
                SELECT r.id
                FROM builds b
                JOIN jobs j ON j.id = b.job_id
                JOIN resources r ON r.pipeline_id = j.pipeline_id AND r.name = $2 AND r.active
                WHERE b.id = $1
                "#,
            )
            .bind(id.as_uuid())
            .bind(&output.resource)
            .fetch_optional(&mut *tx)
            .await?;
            let resource_id = resource_id
                .ok_or_else(|| DbError::NotFound(format!("resource {}", output.resource)))?;

            let version_id: Uuid = sqlx::query_scalar(
                r#"
                INSERT INTO versions (id, resource_id, version, check_order, checked, created_at)
                VALUES ($1, $2, $3, 0, FALSE, NOW())
                ON CONFLICT (resource_id, version) DO UPDATE SET version = EXCLUDED.version
                RETURNING id
                "#,
            )
            .bind(Uuid::now_v7())
            .bind(resource_id)
            .bind(serde_json::to_value(&output.version)?)
            .fetch_one(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT INTO build_outputs (build_id, version_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
            )
            .bind(id.as_uuid())
            .bind(version_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn started_builds(&self, pipeline_id: PipelineId) -> DbResult<Vec<Build>> {
        sqlx::query_as::<_, BuildRow>(&format!(
            r#"
            SELECT {BUILD_COLUMNS}
            FROM builds b JOIN jobs j ON j.id = b.job_id
            WHERE j.pipeline_id = $1 AND b.status = 'started'
            ORDER BY b.started_at ASC
            "#
        ))
        .bind(pipeline_id.as_uuid())
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(TryInto::try_into)
        .collect()
    }

    async fn get(&self, id: BuildId) -> DbResult<Build> {
        sqlx::query_as::<_, BuildRow>(&format!(
            r#"
            SELECT {BUILD_COLUMNS}
            FROM builds b JOIN jobs j ON j.id = b.job_id
            WHERE b.id = $1
            "#
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("build {}", id)))?
        .try_into()
    }
}
