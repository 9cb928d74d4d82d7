//! a2m-convert - Audio to MIDI conversion
//!
//! Command-line front end over the conversion orchestrator. Every command
//! opens the same SQLite database, so `status` and `stats` report on tasks
//! created by earlier `convert` runs.

use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use a2m_common::config::{LoggingConfig, TomlConfig};
use a2m_convert::{FileStore, ProcessOutcome, TaskOrchestrator};

/// Command-line arguments for a2m-convert
#[derive(Parser, Debug)]
#[command(name = "a2m-convert")]
#[command(about = "Convert audio recordings to MIDI")]
#[command(version)]
struct Args {
    /// Configuration file (TOML); falls back to A2M_CONFIG, then the platform config dir
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Submit an audio file and convert it
    Convert {
        file: PathBuf,

        /// Processing time limit in seconds (defaults to the configured timeout)
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Show a task and its operation history
    Status { task_id: Uuid },
    /// Task counts per status
    Stats,
    /// Remove finished tasks and their files
    Cleanup {
        /// Age in hours (defaults to the configured retention)
        #[arg(long)]
        hours: Option<u64>,
    },
    /// Score an audio file without converting it
    Quality { file: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = TomlConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    init_tracing(&config.logging)?;

    info!(
        "Starting a2m-convert v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );

    let db_path = config.database_path();
    info!("Database: {}", db_path.display());
    let db_pool = a2m_convert::db::init_database_pool(&db_path)
        .await
        .context("Failed to open database")?;

    let store = FileStore::new(config.upload_dir(), config.output_dir());
    store.ensure_dirs().await.context("Failed to create storage directories")?;

    let orchestrator = TaskOrchestrator::with_default_pipeline(db_pool, store, config.processing.clone());

    match args.command {
        Command::Convert { file, timeout } => {
            let limit = Duration::from_secs(timeout.unwrap_or(config.processing.processing_timeout_secs));
            convert(&orchestrator, file, limit).await
        }
        Command::Status { task_id } => status(&orchestrator, task_id).await,
        Command::Stats => {
            let stats = orchestrator.statistics().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
        Command::Cleanup { hours } => {
            let hours = hours.unwrap_or(config.processing.cleanup_after_hours);
            let removed = orchestrator.cleanup(hours).await?;
            println!("Removed {} task(s) older than {} hour(s)", removed, hours);
            Ok(())
        }
        Command::Quality { file } => {
            let report = orchestrator
                .assess_quality(&file)
                .await
                .with_context(|| format!("Failed to assess {}", file.display()))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

async fn convert(orchestrator: &TaskOrchestrator, file: PathBuf, limit: Duration) -> Result<()> {
    if !file.is_file() {
        bail!("Input file not found: {}", file.display());
    }

    let task = orchestrator
        .import_file(&file)
        .await
        .with_context(|| format!("Failed to submit {}", file.display()))?;
    println!("Task {}", task.task_id);

    let outcome = orchestrator.process_with_timeout(task.task_id, limit).await;
    let task = orchestrator
        .task(task.task_id)
        .await?
        .context("Task disappeared after processing")?;

    match outcome {
        ProcessOutcome::Completed => {
            println!(
                "Completed in {}s: {}",
                task.processing_time.unwrap_or(0),
                task.output_file_path.unwrap_or_default()
            );
            Ok(())
        }
        ProcessOutcome::Failed => bail!(
            "Conversion failed: {}",
            task.error_message.unwrap_or_else(|| "unknown error".to_string())
        ),
        ProcessOutcome::Cancelled => bail!("Conversion cancelled after {}s", limit.as_secs()),
        ProcessOutcome::Rejected(reason) => bail!("Conversion rejected: {}", reason),
        ProcessOutcome::Queued => bail!("Task queued but not processed"),
    }
}

async fn status(orchestrator: &TaskOrchestrator, task_id: Uuid) -> Result<()> {
    let Some(task) = orchestrator.task(task_id).await? else {
        bail!("Task {} not found", task_id);
    };
    let history = orchestrator.history(task_id).await?;

    println!("{}", serde_json::to_string_pretty(&task)?);
    for record in history {
        println!(
            "{}  {:<18} {:<8} {}{}",
            record.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            record.operation.as_str(),
            record.status.as_str(),
            record.details.unwrap_or_default(),
            record
                .duration_ms
                .map(|ms| format!(" ({} ms)", ms))
                .unwrap_or_default()
        );
    }
    Ok(())
}

/// Level from configuration unless RUST_LOG is set; optional log file
fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("a2m_convert={0},a2m_common={0}", logging.level)));

    let registry = tracing_subscriber::registry().with(filter);
    match &logging.file {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create log file {}", path.display()))?;
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(Arc::new(file)),
                )
                .init();
        }
        None => {
            registry
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
    Ok(())
}
