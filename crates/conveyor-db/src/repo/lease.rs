//! Lease repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

use crate::DbResult;

/// A lease row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct LeaseRecord {
    pub key: String,
    pub holder: Uuid,
    pub acquired_at: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
}

#[async_trait]
pub trait LeaseRepo: Send + Sync {
    /// Claim `key` for `holder` if the claim rules allow it, in one atomic step.
    ///
    /// A claim is allowed when there is no row, or when the row has expired
    /// (`valid_until <= now`) and, unless `immediate`, at least `duration`
    /// has passed since the row's `acquired_at`. Returns `None` when not allowed.
    async fn try_acquire(
        &self,
        key: &str,
        holder: Uuid,
        duration: Duration,
        immediate: bool,
    ) -> DbResult<Option<LeaseRecord>>;

    /// Make `holder`'s claim on `key` immediately expired. No-op if `holder`
    /// no longer holds it.
    async fn release(&self, key: &str, holder: Uuid) -> DbResult<()>;
}

/// PostgreSQL implementation of LeaseRepo.
pub struct PgLeaseRepo {
    pool: PgPool,
}

impl PgLeaseRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LeaseRepo for PgLeaseRepo {
    async fn try_acquire(
        &self,
        key: &str,
        holder: Uuid,
        duration: Duration,
        immediate: bool,
    ) -> DbResult<Option<LeaseRecord>> {
        // The expiry comparison runs under the row lock taken by ON CONFLICT,
        // so two contenders can never both see the row as claimable.
        let record = sqlx::query_as::<_, LeaseRecord>(
            r#"
            INSERT INTO leases (key, holder, acquired_at, valid_until)
            VALUES ($1, $2, NOW(), NOW() + make_interval(secs => $3))
            ON CONFLICT (key) DO UPDATE
            SET holder = EXCLUDED.holder,
                acquired_at = EXCLUDED.acquired_at,
                valid_until = EXCLUDED.valid_until
            WHERE leases.valid_until <= NOW()
              AND ($4 OR leases.acquired_at + make_interval(secs => $3) <= NOW())
            RETURNING key, holder, acquired_at, valid_until
            "#,
        )
        .bind(key)
        .bind(holder)
        .bind(duration.as_secs_f64())
        .bind(immediate)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn release(&self, key: &str, holder: Uuid) -> DbResult<()> {
        sqlx::query(
            "UPDATE leases SET valid_until = NOW() WHERE key = $1 AND holder = $2 AND valid_until > NOW()",
        )
        .bind(key)
        .bind(holder)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
