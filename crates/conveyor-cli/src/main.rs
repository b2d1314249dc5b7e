//! Conveyor host process and CLI.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod checker;
mod commands;

#[derive(Parser)]
#[command(name = "conveyor")]
#[command(about = "Conveyor CI pipeline scheduler", long_about = None)]
struct Cli {
    /// System configuration file (KDL)
    #[arg(long, env = "CONVEYOR_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// PostgreSQL connection string, overriding the configuration file
    #[arg(long, env = "DATABASE_URL", global = true)]
    database_url: Option<String>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Check resources, schedule and track builds of every pipeline
    Run,
    /// Create or update a pipeline from a configuration file
    SetPipeline {
        /// Pipeline name
        name: String,
        /// Path to the pipeline configuration
        file: PathBuf,
    },
    /// Validate a pipeline configuration
    Validate {
        /// Path to the pipeline configuration
        #[arg(default_value = "pipeline.kdl")]
        file: PathBuf,
    },
    /// Create a build of a job now
    ///
    /// Without --wait the build stays pending until a running host picks it up.
    Trigger {
        pipeline: String,
        job: String,
        /// Check the job's inputs and try to start the build before exiting
        #[arg(long)]
        wait: bool,
    },
    /// Show the versions a job would run with next, without saving anything
    Preview { pipeline: String, job: String },
    /// Stop scheduling and checking a pipeline
    PausePipeline { pipeline: String },
    /// Resume a paused pipeline
    UnpausePipeline { pipeline: String },
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    if let Commands::Validate { file } = &cli.command {
        return commands::pipelines::validate(file);
    }

    let config = commands::load_config(cli.config.as_deref(), cli.database_url)?;

    match cli.command {
        Commands::Run => commands::run::run(config).await?,
        Commands::SetPipeline { name, file } => {
            commands::pipelines::set_pipeline(&config, &name, &file).await?;
        }
        Commands::Trigger {
            pipeline,
            job,
            wait,
        } => {
            commands::trigger::trigger(&config, &pipeline, &job, wait).await?;
        }
        Commands::Preview { pipeline, job } => {
            commands::trigger::preview(&config, &pipeline, &job).await?;
        }
        Commands::PausePipeline { pipeline } => {
            commands::pipelines::set_paused(&config, &pipeline, true).await?;
        }
        Commands::UnpausePipeline { pipeline } => {
            commands::pipelines::set_paused(&config, &pipeline, false).await?;
        }
        Commands::Validate { .. } => {}
    }

    Ok(())
}
