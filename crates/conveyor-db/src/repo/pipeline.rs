//! Pipeline repository: pipelines and the jobs, resources and resource types
//! synced from their configuration.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conveyor_core::pipeline::{PipelineConfig, Version};
use conveyor_core::{JobId, PipelineId, ResourceId, ResourceTypeId};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::{DbError, DbResult};

/// A pipeline with its current configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedPipeline {
    pub id: PipelineId,
    pub name: String,
    pub config: PipelineConfig,
    pub paused: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedJob {
    pub id: JobId,
    pub pipeline_id: PipelineId,
    pub name: String,
    pub paused: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedResource {
    pub id: ResourceId,
    pub pipeline_id: PipelineId,
    pub name: String,
    pub paused: bool,
    pub check_error: Option<String>,
    pub last_checked: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedResourceType {
    pub id: ResourceTypeId,
    pub pipeline_id: PipelineId,
    pub name: String,
    /// Latest version reported by a check of the type's own source.
    pub version: Option<Version>,
    pub check_error: Option<String>,
}

#[async_trait]
pub trait PipelineRepo: Send + Sync {
    /// Create or update a pipeline by name and sync its jobs, resources and
    /// resource types. Entities missing from `config` are deactivated, not deleted.
    async fn save_config(&self, config: &PipelineConfig) -> DbResult<SavedPipeline>;
    async fn get(&self, id: PipelineId) -> DbResult<SavedPipeline>;
    async fn get_by_name(&self, name: &str) -> DbResult<SavedPipeline>;
    async fn list(&self) -> DbResult<Vec<SavedPipeline>>;
    async fn set_paused(&self, id: PipelineId, paused: bool) -> DbResult<()>;

    async fn get_job(&self, pipeline_id: PipelineId, name: &str) -> DbResult<SavedJob>;
    async fn set_job_paused(&self, pipeline_id: PipelineId, name: &str, paused: bool)
    -> DbResult<()>;

    async fn get_resource(&self, pipeline_id: PipelineId, name: &str) -> DbResult<SavedResource>;
    async fn set_resource_paused(
        &self,
        pipeline_id: PipelineId,
        name: &str,
        paused: bool,
    ) -> DbResult<()>;
    async fn set_resource_check_error(&self, id: ResourceId, error: Option<&str>)
    -> DbResult<()>;

    async fn get_resource_type(
        &self,
        pipeline_id: PipelineId,
        name: &str,
    ) -> DbResult<SavedResourceType>;
    async fn save_resource_type_version(&self, id: ResourceTypeId, version: &Version)
    -> DbResult<()>;
    async fn set_resource_type_check_error(
        &self,
        id: ResourceTypeId,
        error: Option<&str>,
    ) -> DbResult<()>;
}

#[derive(sqlx::FromRow)]
struct PipelineRow {
    id: Uuid,
    name: String,
    config: serde_json::Value,
    paused: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PipelineRow> for SavedPipeline {
    type Error = DbError;

    fn try_from(row: PipelineRow) -> DbResult<Self> {
        Ok(SavedPipeline {
            id: row.id.into(),
            name: row.name,
            config: serde_json::from_value(row.config)?,
            paused: row.paused,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    pipeline_id: Uuid,
    name: String,
    paused: bool,
}

impl From<JobRow> for SavedJob {
    fn from(row: JobRow) -> Self {
        SavedJob {
            id: row.id.into(),
            pipeline_id: row.pipeline_id.into(),
            name: row.name,
            paused: row.paused,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ResourceRow {
    id: Uuid,
    pipeline_id: Uuid,
    name: String,
    paused: bool,
    check_error: Option<String>,
    last_checked: Option<DateTime<Utc>>,
}

impl From<ResourceRow> for SavedResource {
    fn from(row: ResourceRow) -> Self {
        SavedResource {
            id: row.id.into(),
            pipeline_id: row.pipeline_id.into(),
            name: row.name,
            paused: row.paused,
            check_error: row.check_error,
            last_checked: row.last_checked,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ResourceTypeRow {
    id: Uuid,
    pipeline_id: Uuid,
    name: String,
    version: Option<serde_json::Value>,
    check_error: Option<String>,
}

impl TryFrom<ResourceTypeRow> for SavedResourceType {
    type Error = DbError;

    fn try_from(row: ResourceTypeRow) -> DbResult<Self> {
        Ok(SavedResourceType {
            id: row.id.into(),
            pipeline_id: row.pipeline_id.into(),
            name: row.name,
            version: row.version.map(serde_json::from_value).transpose()?,
            check_error: row.check_error,
        })
    }
}

/// PostgreSQL implementation of PipelineRepo.
pub struct PgPipelineRepo {
    pool: PgPool,
}

impl PgPipelineRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn sync_names(
        tx: &mut Transaction<'_, Postgres>,
        table: &str,
        pipeline_id: Uuid,
        names: &[&str],
    ) -> DbResult<()> {
        sqlx::query(&format!(
            "UPDATE {table} SET active = FALSE WHERE pipeline_id = $1"
        ))
        .bind(pipeline_id)
        .execute(&mut **tx)
        .await?;

        for name in names {
            sqlx::query(&format!(
                r#"
                INSERT INTO {table} (id, pipeline_id, name, active)
                VALUES ($1, $2, $3, TRUE)
                ON CONFLICT (pipeline_id, name) DO UPDATE SET active = TRUE
                "#
            ))
            .bind(Uuid::now_v7())
            .bind(pipeline_id)
            .bind(*name)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl PipelineRepo for PgPipelineRepo {
    async fn save_config(&self, config: &PipelineConfig) -> DbResult<SavedPipeline> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, PipelineRow>(
            r#"
            INSERT INTO pipelines (id, name, config, created_at, updated_at)
            VALUES ($1, $2, $3, NOW(), NOW())
            ON CONFLICT (name) DO UPDATE SET config = EXCLUDED.config, updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(&config.name)
        .bind(serde_json::to_value(config)?)
        .fetch_one(&mut *tx)
        .await?;

        let jobs: Vec<&str> = config.jobs.iter().map(|j| j.name.as_str()).collect();
        let resources: Vec<&str> = config.resources.iter().map(|r| r.name.as_str()).collect();
        let types: Vec<&str> = config.resource_types.iter().map(|t| t.name.as_str()).collect();
        Self::sync_names(&mut tx, "jobs", row.id, &jobs).await?;
        Self::sync_names(&mut tx, "resources", row.id, &resources).await?;
        Self::sync_names(&mut tx, "resource_types", row.id, &types).await?;

        tx.commit().await?;
        row.try_into()
    }

    async fn get(&self, id: PipelineId) -> DbResult<SavedPipeline> {
        sqlx::query_as::<_, PipelineRow>("SELECT * FROM pipelines WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("pipeline {}", id)))?
            .try_into()
    }

    async fn get_by_name(&self, name: &str) -> DbResult<SavedPipeline> {
        sqlx::query_as::<_, PipelineRow>("SELECT * FROM pipelines WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("pipeline {}", name)))?
            .try_into()
    }

    async fn list(&self) -> DbResult<Vec<SavedPipeline>> {
        sqlx::query_as::<_, PipelineRow>("SELECT * FROM pipelines ORDER BY name")
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(TryInto::try_into)
            .collect()
    }

    async fn set_paused(&self, id: PipelineId, paused: bool) -> DbResult<()> {
        let result = sqlx::query("UPDATE pipelines SET paused = $2 WHERE id = $1")
            .bind(id.as_uuid())
            .bind(paused)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("pipeline {}", id)));
        }
        Ok(())
    }

    async fn get_job(&self, pipeline_id: PipelineId, name: &str) -> DbResult<SavedJob> {
        let row = sqlx::query_as::<_, JobRow>(
            "SELECT id, pipeline_id, name, paused FROM jobs WHERE pipeline_id = $1 AND name = $2 AND active",
        )
        .bind(pipeline_id.as_uuid())
        .bind(name)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("job {}", name)))?;
        Ok(row.into())
    }

    async fn set_job_paused(
        &self,
        pipeline_id: PipelineId,
        name: &str,
        paused: bool,
    ) -> DbResult<()> {
        let result = sqlx::query(
            "UPDATE jobs SET paused = $3 WHERE pipeline_id = $1 AND name = $2 AND active",
        )
        .bind(pipeline_id.as_uuid())
        .bind(name)
        .bind(paused)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("job {}", name)));
        }
        Ok(())
    }

    async fn get_resource(&self, pipeline_id: PipelineId, name: &str) -> DbResult<SavedResource> {
        let row = sqlx::query_as::<_, ResourceRow>(
            r#"
            SELECT id, pipeline_id, name, paused, check_error, last_checked
            FROM resources
            WHERE pipeline_id = $1 AND name = $2 AND active
            "#,
        )
        .bind(pipeline_id.as_uuid())
        .bind(name)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("resource {}", name)))?;
        Ok(row.into())
    }

    async fn set_resource_paused(
        &self,
        pipeline_id: PipelineId,
        name: &str,
        paused: bool,
    ) -> DbResult<()> {
        let result = sqlx::query(
            "UPDATE resources SET paused = $3 WHERE pipeline_id = $1 AND name = $2 AND active",
        )
        .bind(pipeline_id.as_uuid())
        .bind(name)
        .bind(paused)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("resource {}", name)));
        }
        Ok(())
    }

    async fn set_resource_check_error(
        &self,
        id: ResourceId,
        error: Option<&str>,
    ) -> DbResult<()> {
        sqlx::query("UPDATE resources SET check_error = $2 WHERE id = $1")
            .bind(id.as_uuid())
            .bind(error)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_resource_type(
        &self,
        pipeline_id: PipelineId,
        name: &str,
    ) -> DbResult<SavedResourceType> {
        sqlx::query_as::<_, ResourceTypeRow>(
            r#"
            SELECT id, pipeline_id, name, version, check_error
            FROM resource_types
            WHERE pipeline_id = $1 AND name = $2 AND active
            "#,
        )
        .bind(pipeline_id.as_uuid())
        .bind(name)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("resource type {}", name)))?
        .try_into()
    }

    async fn save_resource_type_version(
        &self,
        id: ResourceTypeId,
        version: &Version,
    ) -> DbResult<()> {
        sqlx::query("UPDATE resource_types SET version = $2, last_checked = NOW() WHERE id = $1")
            .bind(id.as_uuid())
            .bind(serde_json::to_value(version)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_resource_type_check_error(
        &self,
        id: ResourceTypeId,
        error: Option<&str>,
    ) -> DbResult<()> {
        sqlx::query("UPDATE resource_types SET check_error = $2 WHERE id = $1")
            .bind(id.as_uuid())
            .bind(error)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
