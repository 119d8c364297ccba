//! # sheetsync Main Entry Point
//!
//! Serves the scheduler and its HTTP surface, and offers offline checks for
//! cron expressions and job definitions.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use sea_orm::Database;
use tracing::{info, warn};

use sheetsync::{
    config::ConfigLoader,
    connectors::{MemorySheet, SqlSource},
    cron::{CronSchedule, offset_from_minutes},
    db,
    models::SyncJob,
    repositories::{JobStore, SeaOrmJobStore},
    server::run_server,
    telemetry,
};

#[derive(Debug, Parser)]
#[command(name = "sheetsync", version, about = "Scheduled sync of database tables into WeCom smart sheets")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the scheduler and HTTP API (default)
    Serve,
    /// Print the next fire times of a cron expression
    CheckCron {
        expression: String,
        #[arg(long, default_value_t = 5)]
        count: usize,
        /// Offset from UTC in which the expression is evaluated
        #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
        utc_offset_minutes: i32,
    },
    /// Validate a job definition file
    ValidateJob { path: PathBuf },
    /// Validate a job definition file and save it to the database
    ImportJob { path: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve().await,
        Command::CheckCron {
            expression,
            count,
            utc_offset_minutes,
        } => check_cron(&expression, count, utc_offset_minutes),
        Command::ValidateJob { path } => {
            let job = read_job(&path)?;
            println!("ok: job '{}' ({} mode, schedule '{}')", job.name, job.sync.mode, job.schedule);
            Ok(())
        }
        Command::ImportJob { path } => import_job(&path).await,
    }
}

async fn serve() -> Result<()> {
    // Load configuration from layered env files and variables
    let config = ConfigLoader::new().load().context("loading configuration")?;
    telemetry::init_tracing(&config).context("initializing tracing")?;

    if let Ok(redacted_json) = config.redacted_json() {
        info!(profile = %config.profile, configuration = %redacted_json, "Loaded configuration");
    }

    let pool = db::init_pool(&config).await?;
    db::migrate(&pool).await?;

    let source_db = match &config.source_database_url {
        Some(url) => Database::connect(url.as_str())
            .await
            .context("connecting to source database")?,
        None => pool.clone(),
    };

    // The smart-sheet API client is supplied by the embedding deployment.
    warn!("No smart-sheet client configured; writing to the in-process sheet");

    run_server(
        config,
        pool,
        Arc::new(SqlSource::new(source_db)),
        Arc::new(MemorySheet::new()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("server error: {e}"))
}

fn check_cron(expression: &str, count: usize, utc_offset_minutes: i32) -> Result<()> {
    let schedule = CronSchedule::parse(expression)
        .with_context(|| format!("invalid cron expression '{expression}'"))?;
    let offset = offset_from_minutes(utc_offset_minutes);
    for at in schedule.upcoming(Utc::now(), offset, count) {
        println!("{}", at.with_timezone(&offset).to_rfc3339());
    }
    Ok(())
}

fn read_job(path: &Path) -> Result<SyncJob> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading job definition {}", path.display()))?;
    let job: SyncJob = serde_json::from_str(&raw)
        .with_context(|| format!("parsing job definition {}", path.display()))?;
    job.validate()
        .with_context(|| format!("invalid job definition {}", path.display()))?;
    Ok(job)
}

async fn import_job(path: &Path) -> Result<()> {
    let job = read_job(path)?;
    let config = ConfigLoader::new().load().context("loading configuration")?;
    let pool = db::init_pool(&config).await?;
    db::migrate(&pool).await?;

    let store = SeaOrmJobStore::new(Arc::new(pool));
    store.save_job(&job).await.context("saving job definition")?;
    println!("imported job '{}' ({})", job.name, job.id);
    Ok(())
}
