//! Version repository: resource version history and the version graph snapshot.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conveyor_core::pipeline::Version;
use conveyor_core::versions::{BuildInput, BuildOutput, ResourceVersion, VersionsDb};
use conveyor_core::{PipelineId, ResourceId, VersionId};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::{DbError, DbResult};

/// A stored version of a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedVersion {
    pub id: VersionId,
    pub resource_id: ResourceId,
    pub version: Version,
    pub check_order: i64,
    pub checked: bool,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait VersionRepo: Send + Sync {
    /// Load the version graph of every active job and resource of a pipeline.
    async fn load_versions_db(&self, pipeline_id: PipelineId) -> DbResult<VersionsDb>;

    /// Record versions reported by a check, oldest first. New versions (and
    /// versions previously only seen as build outputs) get increasing
    /// check orders and are marked checked. Also stamps the resource's last check.
    async fn save_resource_versions(
        &self,
        resource_id: ResourceId,
        versions: &[Version],
    ) -> DbResult<()>;

    /// Most recent checked version of a resource.
    async fn latest_version(&self, resource_id: ResourceId) -> DbResult<Option<SavedVersion>>;

    async fn get_version(&self, id: VersionId) -> DbResult<SavedVersion>;
}

#[derive(sqlx::FromRow)]
struct VersionRow {
    id: Uuid,
    resource_id: Uuid,
    version: serde_json::Value,
    check_order: i64,
    checked: bool,
    created_at: DateTime<Utc>,
}

impl TryFrom<VersionRow> for SavedVersion {
    type Error = DbError;

    fn try_from(row: VersionRow) -> DbResult<Self> {
        Ok(SavedVersion {
            id: row.id.into(),
            resource_id: row.resource_id.into(),
            version: serde_json::from_value(row.version)?,
            check_order: row.check_order,
            checked: row.checked,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ResourceVersionRow {
    id: Uuid,
    resource_id: Uuid,
    check_order: i64,
    checked: bool,
}

#[derive(sqlx::FromRow)]
struct EdgeRow {
    job_id: Uuid,
    build_id: Uuid,
    resource_id: Uuid,
    version_id: Uuid,
}

#[derive(sqlx::FromRow)]
struct InputEdgeRow {
    job_id: Uuid,
    build_id: Uuid,
    resource_id: Uuid,
    version_id: Uuid,
    input_name: String,
}

#[derive(sqlx::FromRow)]
struct NamedIdRow {
    id: Uuid,
    name: String,
}

/// PostgreSQL implementation of VersionRepo.
pub struct PgVersionRepo {
    pool: PgPool,
}

impl PgVersionRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VersionRepo for PgVersionRepo {
    async fn load_versions_db(&self, pipeline_id: PipelineId) -> DbResult<VersionsDb> {
        // One snapshot for the whole graph
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await?;

        let resource_versions = sqlx::query_as::<_, ResourceVersionRow>(
            r#"
            SELECT v.id, v.resource_id, v.check_order, v.checked
            FROM versions v
            JOIN resources r ON r.id = v.resource_id
            WHERE r.pipeline_id = $1 AND r.active
            "#,
        )
        .bind(pipeline_id.as_uuid())
        .fetch_all(&mut *tx)
        .await?;

        let build_outputs = sqlx::query_as::<_, EdgeRow>(
            r#"
            SELECT b.job_id, b.id AS build_id, v.resource_id, o.version_id
            FROM build_outputs o
            JOIN builds b ON b.id = o.build_id
            JOIN jobs j ON j.id = b.job_id
            JOIN versions v ON v.id = o.version_id
            WHERE j.pipeline_id = $1 AND b.status = 'succeeded'
            UNION
            SELECT b.job_id, b.id AS build_id, v.resource_id, i.version_id
            FROM build_inputs i
            JOIN builds b ON b.id = i.build_id
            JOIN jobs j ON j.id = b.job_id
            JOIN versions v ON v.id = i.version_id
            WHERE j.pipeline_id = $1 AND b.status = 'succeeded'
            "#,
        )
        .bind(pipeline_id.as_uuid())
        .fetch_all(&mut *tx)
        .await?;

        let build_inputs = sqlx::query_as::<_, InputEdgeRow>(
            r#"
            SELECT b.job_id, b.id AS build_id, v.resource_id, i.version_id, i.input_name
            FROM build_inputs i
            JOIN builds b ON b.id = i.build_id
            JOIN jobs j ON j.id = b.job_id
            JOIN versions v ON v.id = i.version_id
            WHERE j.pipeline_id = $1
            "#,
        )
        .bind(pipeline_id.as_uuid())
        .fetch_all(&mut *tx)
        .await?;

        let jobs = sqlx::query_as::<_, NamedIdRow>(
            "SELECT id, name FROM jobs WHERE pipeline_id = $1 AND active",
        )
        .bind(pipeline_id.as_uuid())
        .fetch_all(&mut *tx)
        .await?;

        let resources = sqlx::query_as::<_, NamedIdRow>(
            "SELECT id, name FROM resources WHERE pipeline_id = $1 AND active",
        )
        .bind(pipeline_id.as_uuid())
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(VersionsDb {
            resource_versions: resource_versions
                .into_iter()
                .map(|row| ResourceVersion {
                    resource_id: row.resource_id.into(),
                    version_id: row.id.into(),
                    check_order: row.check_order,
                    checked: row.checked,
                })
                .collect(),
            build_outputs: build_outputs
                .into_iter()
                .map(|row| BuildOutput {
                    job_id: row.job_id.into(),
                    build_id: row.build_id.into(),
                    resource_id: row.resource_id.into(),
                    version_id: row.version_id.into(),
                })
                .collect(),
            build_inputs: build_inputs
                .into_iter()
                .map(|row| BuildInput {
                    job_id: row.job_id.into(),
                    build_id: row.build_id.into(),
                    resource_id: row.resource_id.into(),
                    version_id: row.version_id.into(),
                    input_name: row.input_name,
                })
                .collect(),
            job_ids: jobs.into_iter().map(|row| (row.name, row.id.into())).collect(),
            resource_ids: resources
                .into_iter()
                .map(|row| (row.name, row.id.into()))
                .collect(),
        })
    }

    async fn save_resource_versions(
        &self,
        resource_id: ResourceId,
        versions: &[Version],
    ) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;

        // Serializes check order allocation per resource
        sqlx::query("SELECT id FROM resources WHERE id = $1 FOR UPDATE")
            .bind(resource_id.as_uuid())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("resource {}", resource_id)))?;

        let mut next_order: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(check_order), 0) + 1 FROM versions WHERE resource_id = $1",
        )
        .bind(resource_id.as_uuid())
        .fetch_one(&mut *tx)
        .await?;

        for version in versions {
            let result = sqlx::query(
                r#"
                INSERT INTO versions (id, resource_id, version, check_order, checked, created_at)
                VALUES ($1, $2, $3, $4, TRUE, NOW())
                ON CONFLICT (resource_id, version) DO UPDATE
                SET checked = TRUE, check_order = EXCLUDED.check_order
                WHERE NOT versions.checked
                "#,
            )
            .bind(Uuid::now_v7())
            .bind(resource_id.as_uuid())
            .bind(serde_json::to_value(version)?)
            .bind(next_order)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() > 0 {
                next_order += 1;
            }
        }

        sqlx::query("UPDATE resources SET last_checked = NOW() WHERE id = $1")
            .bind(resource_id.as_uuid())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn latest_version(&self, resource_id: ResourceId) -> DbResult<Option<SavedVersion>> {
        sqlx::query_as::<_, VersionRow>(
            r#"
            SELECT * FROM versions
            WHERE resource_id = $1 AND checked
            ORDER BY check_order DESC
            LIMIT 1
            "#,
        )
        .bind(resource_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?
        .map(TryInto::try_into)
        .transpose()
    }

    async fn get_version(&self, id: VersionId) -> DbResult<SavedVersion> {
        sqlx::query_as::<_, VersionRow>("SELECT * FROM versions WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("version {}", id)))?
            .try_into()
    }
}
