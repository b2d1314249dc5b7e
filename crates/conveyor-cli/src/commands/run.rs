//! The host process.

use anyhow::Result;
use conveyor_config::SystemConfig;
use conveyor_core::PipelineId;
use conveyor_scheduler::{PipelineRunner, QueueExecutor};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::connect;
use crate::checker::ScriptChecker;

/// Run a [`PipelineRunner`] for every pipeline until interrupted.
///
/// Pipelines saved while running are picked up on the next scheduling interval.
pub async fn run(config: SystemConfig) -> Result<()> {
    let (pool, repos) = connect(&config).await?;
    let checker = Arc::new(ScriptChecker::new(config.check_scripts.clone()));
    let executor = Arc::new(QueueExecutor::new(pool));

    let mut runners: HashMap<PipelineId, JoinHandle<()>> = HashMap::new();
    let mut refresh = tokio::time::interval(config.scheduling_interval);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!(scripts = %config.check_scripts.display(), "Conveyor started");

    loop {
        tokio::select! {
            _ = refresh.tick() => {
                let pipelines = match repos.pipelines.list().await {
                    Ok(pipelines) => pipelines,
                    Err(e) => {
                        warn!(error = %e, "Failed to list pipelines");
                        continue;
                    }
                };
                for pipeline in pipelines {
                    runners.entry(pipeline.id).or_insert_with(|| {
                        info!(pipeline = %pipeline.name, "Starting pipeline");
                        let runner = PipelineRunner::new(
                            pipeline.id,
                            &repos,
                            checker.clone(),
                            executor.clone(),
                            &config,
                        );
                        tokio::spawn(async move { runner.run().await })
                    });
                }
            }
            _ = &mut shutdown => {
                info!("Shutting down");
                break;
            }
        }
    }

    for (_, handle) in runners {
        handle.abort();
    }
    Ok(())
}
