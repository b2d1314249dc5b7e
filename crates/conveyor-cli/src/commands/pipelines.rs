//! Pipeline management commands.

use anyhow::{Context, Result};
use conveyor_config::{SystemConfig, parse_pipeline};
use conveyor_core::pipeline::PipelineConfig;
use std::path::Path;

use super::connect;

fn read_pipeline(file: &Path) -> Result<PipelineConfig> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read pipeline file: {}", file.display()))?;
    parse_pipeline(&content)
        .with_context(|| format!("Invalid pipeline configuration: {}", file.display()))
}

pub fn validate(file: &Path) -> Result<()> {
    let pipeline = read_pipeline(file)?;
    println!(
        "Configuration is valid: pipeline '{}' with {} resources and {} jobs",
        pipeline.name,
        pipeline.resources.0.len(),
        pipeline.jobs.len()
    );
    Ok(())
}

pub async fn set_pipeline(config: &SystemConfig, name: &str, file: &Path) -> Result<()> {
    let mut pipeline = read_pipeline(file)?;
    pipeline.name = name.to_string();

    let (_, repos) = connect(config).await?;
    let saved = repos.pipelines.save_config(&pipeline).await?;

    println!("Pipeline '{}' saved ({})", saved.name, saved.id);
    if saved.paused {
        println!("Pipeline is paused; unpause it with `conveyor unpause-pipeline {}`", name);
    }
    Ok(())
}

pub async fn set_paused(config: &SystemConfig, name: &str, paused: bool) -> Result<()> {
    let (_, repos) = connect(config).await?;
    let pipeline = repos
        .pipelines
        .get_by_name(name)
        .await
        .with_context(|| format!("Unknown pipeline: {}", name))?;
    repos.pipelines.set_paused(pipeline.id, paused).await?;

    println!(
        "Pipeline '{}' {}",
        name,
        if paused { "paused" } else { "unpaused" }
    );
    Ok(())
}
