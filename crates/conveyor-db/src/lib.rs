//! Persistence for the Conveyor pipeline scheduler.
//!
//! Repository traits with PostgreSQL implementations, the lease manager
//! built on top of them, and an in-memory store with the same semantics.

pub mod error;
pub mod lease;
pub mod memory;
pub mod repo;

pub use error::{DbError, DbResult};
pub use lease::{Lease, LeaseKey, LeaseManager};
pub use memory::MemoryStore;
pub use repo::*;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;

/// Create a new database connection pool.
pub async fn create_pool(database_url: &str) -> DbResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> DbResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Every repository, behind trait objects.
#[derive(Clone)]
pub struct Repos {
    pub leases: Arc<dyn LeaseRepo>,
    pub pipelines: Arc<dyn PipelineRepo>,
    pub versions: Arc<dyn VersionRepo>,
    pub builds: Arc<dyn BuildRepo>,
    pub input_mappings: Arc<dyn InputMappingRepo>,
}

impl Repos {
    pub fn postgres(pool: PgPool) -> Self {
        Self {
            leases: Arc::new(PgLeaseRepo::new(pool.clone())),
            pipelines: Arc::new(PgPipelineRepo::new(pool.clone())),
            versions: Arc::new(PgVersionRepo::new(pool.clone())),
            builds: Arc::new(PgBuildRepo::new(pool.clone())),
            input_mappings: Arc::new(PgInputMappingRepo::new(pool)),
        }
    }

    pub fn memory(store: MemoryStore) -> Self {
        let store = Arc::new(store);
        Self {
            leases: store.clone(),
            pipelines: store.clone(),
            versions: store.clone(),
            builds: store.clone(),
            input_mappings: store,
        }
    }

    pub fn lease_manager(&self) -> LeaseManager {
        LeaseManager::new(self.leases.clone())
    }
}
