//! Command-line interface for postdrop.
//!
//! Provides commands for watching the template directory, ingesting a single
//! file, listing stored posts, and showing the resolved configuration.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::ingest::parser::{parse_date, DATE_FORMAT};
use crate::ingest::{DirectoryWatcher, DispatchPool, ProcessOutcome, Processor};
use crate::store::{ContentStore, RecordQuery, SqliteStore};

/// postdrop - Drop-folder template ingestion into a post database
#[derive(Parser, Debug)]
#[command(name = "postdrop")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file (defaults to ./postdrop.yaml, then ~/.postdrop/postdrop.yaml)
    #[arg(long, global = true, env = "POSTDROP_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Watch the template directory until interrupted
    Watch,

    /// Process one template file now
    Ingest {
        /// Template file to ingest
        file: PathBuf,
    },

    /// List stored posts as JSON
    List {
        /// Post ID
        #[arg(long)]
        id: Option<i64>,

        /// Exact author name
        #[arg(short, long)]
        author: Option<String>,

        /// Created at or after ("YYYY-MM-DD" or "YYYY-MM-DD HH:MM:SS", UTC)
        #[arg(long, value_parser = parse_date_from)]
        from: Option<DateTime<Utc>>,

        /// Created at or before ("YYYY-MM-DD" covers the whole day)
        #[arg(long, value_parser = parse_date_to)]
        to: Option<DateTime<Utc>>,

        /// Category name (repeatable; any match)
        #[arg(short, long)]
        category: Vec<String>,

        /// Tag name (repeatable; any match)
        #[arg(short, long)]
        tag: Vec<String>,

        /// Page number, starting at 1
        #[arg(short, long, default_value = "1")]
        page: u32,

        /// Posts per page (max 100)
        #[arg(long)]
        page_size: Option<u32>,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let cfg = AppConfig::load(self.config.as_deref())?;

        match self.command {
            Commands::Watch => watch(&cfg).await,
            Commands::Ingest { file } => ingest_file(&cfg, &file).await,
            Commands::List {
                id,
                author,
                from,
                to,
                category,
                tag,
                page,
                page_size,
            } => {
                let query = RecordQuery {
                    id,
                    author,
                    date_from: from,
                    date_to: to,
                    categories: category,
                    tags: tag,
                    page,
                    page_size,
                };
                list_posts(&cfg, &query).await
            }
            Commands::Config => show_config(&cfg),
        }
    }
}

/// Open the database, creating its parent directory if needed
fn open_store(cfg: &AppConfig) -> Result<Arc<SqliteStore>> {
    if let Some(parent) = cfg.database.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    let store = SqliteStore::open(&cfg.database)
        .with_context(|| format!("Failed to open database: {}", cfg.database.display()))?;
    Ok(Arc::new(store))
}

/// Build the processor and make sure every directory it touches exists
async fn prepare_processor(cfg: &AppConfig) -> Result<Processor> {
    let store = open_store(cfg)?;
    let archiver = cfg.archiver();
    archiver
        .ensure_dirs()
        .await
        .context("Failed to create archive directories")?;

    Ok(Processor::new(store, archiver))
}

/// Run the watcher until Ctrl-C or until the poll loop gives up
async fn watch(cfg: &AppConfig) -> Result<()> {
    tokio::fs::create_dir_all(&cfg.watch_dir)
        .await
        .with_context(|| format!("Failed to create watch directory: {}", cfg.watch_dir.display()))?;

    let processor = prepare_processor(cfg).await?;
    let target = cfg.watch_target();
    target.validate()?;

    let pool = DispatchPool::new(Arc::new(processor), cfg.dispatch_config());
    let mut handle = DirectoryWatcher::new(target, pool).start();

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl-C")?;
            info!("interrupt received; shutting down");
        }
        _ = handle.loop_exited() => {
            warn!("watch loop exited; shutting down");
        }
    }

    let pending = handle.pending();
    if pending > 0 {
        info!(
            pending,
            timeout_secs = cfg.shutdown_timeout.as_secs(),
            "waiting for in-flight templates"
        );
    }

    let report = handle.shutdown(cfg.shutdown_timeout).await?;
    if report.abandoned > 0 {
        warn!(
            completed = report.completed,
            abandoned = report.abandoned,
            "shutdown deadline reached; abandoned templates stay in the watch directory"
        );
    } else {
        info!(completed = report.completed, "watcher stopped");
    }

    Ok(())
}

/// Process one file through the same pipeline the watcher uses
async fn ingest_file(cfg: &AppConfig, file: &Path) -> Result<()> {
    let processor = prepare_processor(cfg).await?;

    match processor.process(file).await {
        ProcessOutcome::Stored { id, archived_to } => {
            println!("Stored post {}", id);
            match archived_to {
                Some(dest) => println!("Archived to {}", dest.display()),
                None => eprintln!("Warning: {} could not be archived", file.display()),
            }
            Ok(())
        }
        ProcessOutcome::Rejected { error, archived_to } => {
            if let Some(dest) = archived_to {
                eprintln!("Moved to {}", dest.display());
            }
            Err(error).with_context(|| format!("Template rejected: {}", file.display()))
        }
        ProcessOutcome::ReadFailed { error } => {
            Err(error).with_context(|| format!("Failed to read template: {}", file.display()))
        }
    }
}

/// Print matching posts as a JSON array
async fn list_posts(cfg: &AppConfig, query: &RecordQuery) -> Result<()> {
    let store = open_store(cfg)?;
    let query = query.clone();
    let records = tokio::task::spawn_blocking(move || store.list_records(&query))
        .await
        .context("List task failed")??;

    println!("{}", serde_json::to_string_pretty(&records)?);
    Ok(())
}

/// Show resolved configuration
fn show_config(cfg: &AppConfig) -> Result<()> {
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    if let Some(version) = &cfg.version {
        println!("Config version: {}", version);
    }
    println!();
    println!("Paths:");
    println!("  Database:        {}", cfg.database.display());
    println!("  Watch directory: {}", cfg.watch_dir.display());
    println!("  Processed OK:    {}", cfg.processed_ok.display());
    println!("  Processed error: {}", cfg.processed_error.display());
    println!();
    println!("Watcher:");
    println!("  Extension:        {}", cfg.extension);
    println!("  Check cycle:      {}s", cfg.check_cycle.as_secs());
    println!("  Max concurrent:   {}", cfg.max_concurrent);
    println!("  Dedupe in flight: {}", cfg.dedupe_in_flight);
    println!("  Shutdown timeout: {}s", cfg.shutdown_timeout.as_secs());

    Ok(())
}

fn parse_date_from(value: &str) -> Result<DateTime<Utc>, String> {
    parse_cli_date(value, (0, 0, 0))
}

fn parse_date_to(value: &str) -> Result<DateTime<Utc>, String> {
    parse_cli_date(value, (23, 59, 59))
}

/// Full timestamps are taken as-is; a bare date gets `(h, m, s)`
fn parse_cli_date(value: &str, (h, m, s): (u32, u32, u32)) -> Result<DateTime<Utc>, String> {
    if let Some(ts) = parse_date(value) {
        return Ok(ts);
    }

    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .ok()
        .and_then(|day| day.and_hms_opt(h, m, s))
        .map(|naive| Utc.from_utc_datetime(&naive))
        .ok_or_else(|| {
            format!(
                "invalid date '{}': expected YYYY-MM-DD or {}",
                value,
                DATE_FORMAT
            )
        })
}
