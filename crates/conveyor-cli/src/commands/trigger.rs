//! Manual triggering and input preview.

use anyhow::{Context, Result};
use conveyor_config::SystemConfig;
use conveyor_db::{Repos, SavedPipeline};
use conveyor_scheduler::{PipelineRunner, QueueExecutor, algorithm};
use std::sync::Arc;

use super::connect;
use crate::checker::ScriptChecker;

async fn find_pipeline(repos: &Repos, name: &str) -> Result<SavedPipeline> {
    repos
        .pipelines
        .get_by_name(name)
        .await
        .with_context(|| format!("Unknown pipeline: {}", name))
}

pub async fn trigger(config: &SystemConfig, pipeline: &str, job: &str, wait: bool) -> Result<()> {
    let (pool, repos) = connect(config).await?;
    let saved = find_pipeline(&repos, pipeline).await?;
    let job_config = saved
        .config
        .job(job)
        .with_context(|| format!("Pipeline '{}' has no job '{}'", pipeline, job))?;

    let runner = PipelineRunner::new(
        saved.id,
        &repos,
        Arc::new(ScriptChecker::new(config.check_scripts.clone())),
        Arc::new(QueueExecutor::new(pool)),
        config,
    );
    let (build, waiter) = runner
        .scheduler()
        .trigger_immediately(
            job_config,
            &saved.config.resources,
            &saved.config.resource_types,
        )
        .await?;

    println!("{}/{} #{} created", pipeline, job, build.name);

    if wait {
        waiter.wait().await;
        let build = repos.builds.get(build.id).await?;
        println!("{}/{} #{} {}", pipeline, job, build.name, build.status);
    }
    Ok(())
}

pub async fn preview(config: &SystemConfig, pipeline: &str, job: &str) -> Result<()> {
    let (_, repos) = connect(config).await?;
    let saved = find_pipeline(&repos, pipeline).await?;
    let job_config = saved
        .config
        .job(job)
        .with_context(|| format!("Pipeline '{}' has no job '{}'", pipeline, job))?;

    let versions = repos.versions.load_versions_db(saved.id).await?;
    let Some(resolved) = algorithm::resolve(&versions, job_config) else {
        println!("No satisfiable inputs for {}/{}", pipeline, job);
        return Ok(());
    };
    let job_id = versions
        .job_ids
        .get(job)
        .copied()
        .with_context(|| format!("Job '{}' is not saved", job))?;

    for (input, version_id) in resolved {
        let version = repos.versions.get_version(version_id).await?;
        let marker = if versions.has_input(job_id, &input, version_id) {
            ""
        } else {
            " (new)"
        };
        println!(
            "{}: {}{}",
            input,
            serde_json::to_string(&version.version)?,
            marker
        );
    }
    Ok(())
}
