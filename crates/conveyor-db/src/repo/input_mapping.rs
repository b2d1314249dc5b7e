//! Next build inputs: the latest resolved input mapping of each job.

use async_trait::async_trait;
use conveyor_core::JobId;
use conveyor_core::versions::{InputMapping, InputVersion};
use sqlx::PgPool;
use uuid::Uuid;

use crate::DbResult;

#[async_trait]
pub trait InputMappingRepo: Send + Sync {
    /// Replace the job's stored mapping. An empty mapping clears it.
    async fn save_next_input_mapping(&self, job_id: JobId, mapping: &InputMapping)
    -> DbResult<()>;

    /// The job's stored mapping, empty if none was saved.
    async fn next_input_mapping(&self, job_id: JobId) -> DbResult<InputMapping>;
}

#[derive(sqlx::FromRow)]
struct NextInputRow {
    input_name: String,
    version_id: Uuid,
    first_occurrence: bool,
}

/// PostgreSQL implementation of InputMappingRepo.
pub struct PgInputMappingRepo {
    pool: PgPool,
}

impl PgInputMappingRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InputMappingRepo for PgInputMappingRepo {
    async fn save_next_input_mapping(
        &self,
        job_id: JobId,
        mapping: &InputMapping,
    ) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM next_build_inputs WHERE job_id = $1")
            .bind(job_id.as_uuid())
            .execute(&mut *tx)
            .await?;

        for (input_name, input) in mapping {
            sqlx::query(
                r#"
                INSERT INTO next_build_inputs (job_id, input_name, version_id, first_occurrence)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(job_id.as_uuid())
            .bind(input_name)
            .bind(input.version_id.as_uuid())
            .bind(input.first_occurrence)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn next_input_mapping(&self, job_id: JobId) -> DbResult<InputMapping> {
        let rows = sqlx::query_as::<_, NextInputRow>(
            "SELECT input_name, version_id, first_occurrence FROM next_build_inputs WHERE job_id = $1",
        )
        .bind(job_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                (
                    row.input_name,
                    InputVersion {
                        version_id: row.version_id.into(),
                        first_occurrence: row.first_occurrence,
                    },
                )
            })
            .collect())
    }
}
