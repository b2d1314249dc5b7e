//! CLI command implementations.

pub mod pipelines;
pub mod run;
pub mod trigger;

use anyhow::{Context, Result};
use conveyor_config::{SystemConfig, parse_system_config};
use conveyor_db::{Repos, create_pool, run_migrations};
use sqlx::PgPool;
use std::path::Path;
use tracing::info;

/// Read the system configuration, if any, and apply command line overrides.
pub fn load_config(path: Option<&Path>, database_url: Option<String>) -> Result<SystemConfig> {
    let mut config = match path {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            parse_system_config(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        }
        None => SystemConfig::default(),
    };
    if database_url.is_some() {
        config.database_url = database_url;
    }
    Ok(config)
}

/// Connect to the database and bring its schema up to date.
pub async fn connect(config: &SystemConfig) -> Result<(PgPool, Repos)> {
    let url = config
        .database_url
        .as_deref()
        .context("No database configured: set DATABASE_URL or database-url")?;

    info!("Connecting to database...");
    let pool = create_pool(url)
        .await
        .context("Failed to connect to database")?;
    run_migrations(&pool)
        .await
        .context("Failed to run migrations")?;

    Ok((pool.clone(), Repos::postgres(pool)))
}
