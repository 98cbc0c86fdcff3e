//! Ingestor - quarterly ingest pipeline for the ETCL working time tables
//!
//! Responsibilities:
//! - Detect new quarters on the authority's endpoints (metadata JSON,
//!   CSV head fallback)
//! - Download the raw CSV dumps robustly (retries, backoff, encoding
//!   negotiation, backup-before-overwrite)
//! - Normalise heterogeneous wide/long layouts into one canonical
//!   long-format fact table
//! - Validate structural and business invariants, then load the facts
//!   atomically into the embedded analytical store
//! - Track per-table state (period, hash, version) and dated snapshots
//!
//! Usage:
//!   cargo run --bin ingestor -- check
//!   cargo run --bin ingestor -- download-all
//!   cargo run --bin ingestor -- update-all
//!   cargo run --bin ingestor -- process-all --test
//!   cargo run --bin ingestor -- info 6042

mod catalogue;
mod error;
mod extract;
mod fetch;
mod load;
mod model;
mod period;
mod pipeline;
mod state;
mod transform;
mod update;
mod validate;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use catalogue::AppConfig;
use pipeline::{Orchestrator, RunReport};

#[derive(Parser, Debug)]
#[command(name = "ingestor", about = "Ingests the ETCL quarterly tables into the analytical store")]
struct Args {
    /// Configuration document (default config/tables.json, env ETCL_CONFIG)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Root for raw files, state, backups and snapshots (default ./data,
    /// env ETCL_DATA_DIR)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Analytical store file (default <data-dir>/analysis.db, env ETCL_DB_PATH)
    #[arg(long)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compare the authority's latest period against local state
    Check,
    /// Download every configured table
    DownloadAll,
    /// Download one table
    Download { code: String },
    /// Show descriptor, local state and remote period for one table
    Info { code: String },
    /// Download one table if stale, then reload its facts
    Update { code: String },
    /// Download stale tables, then rebuild the whole store
    UpdateAll,
    /// Extract, transform, validate and load every local table
    ProcessAll {
        /// Restrict to the four most recent quarters
        #[arg(long)]
        test: bool,
    },
    /// Extract, transform, validate and load one table
    Process { code: String },
    /// Analytical store statistics
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config_path = args
        .config
        .or_else(|| std::env::var("ETCL_CONFIG").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("config/tables.json"));
    let data_dir = args
        .data_dir
        .or_else(|| std::env::var("ETCL_DATA_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("data"));
    let db_path = args
        .db
        .or_else(|| std::env::var("ETCL_DB_PATH").ok().map(PathBuf::from))
        .unwrap_or_else(|| data_dir.join("analysis.db"));

    let config = AppConfig::load(&config_path)
        .with_context(|| format!("loading configuration {}", config_path.display()))?;
    let orchestrator = Orchestrator::new(config, &data_dir, db_path)?;

    match args.command {
        Command::Check => {
            println!("=== Update check ===");
            let checks = orchestrator.check_all().await?;
            let mut refreshable = 0;
            for check in &checks {
                let local = check.local.map(|p| p.to_string()).unwrap_or_else(|| "-".into());
                let remote = check.remote.map(|p| p.to_string()).unwrap_or_else(|| "-".into());
                println!(
                    "  [{}] local={:<7} remote={:<7} {}",
                    check.code,
                    local,
                    remote,
                    check.decision.as_str()
                );
                if check.decision.needs_download() {
                    refreshable += 1;
                }
            }
            println!("Tables checked: {}", checks.len());
            println!("Refresh needed: {refreshable}");
        }
        Command::DownloadAll => {
            let report = orchestrator.download_all().await?;
            print_report("Download", &report);
            finish(report)?;
        }
        Command::Download { code } => {
            let report = orchestrator.download_one(&code).await?;
            print_report("Download", &report);
            finish(report)?;
        }
        Command::Info { code } => {
            let info = orchestrator.info(&code).await?;
            println!("=== Table {} ===", info.descriptor.code);
            println!("Name:      {}", info.descriptor.name);
            println!("Category:  {}", info.descriptor.category);
            println!("CSV:       {}", info.descriptor.url_csv);
            println!("Metadata:  {}", info.descriptor.url_json);
            println!(
                "Profile:   level={} shift={} regional={}",
                info.descriptor.profile.activity_level_default.as_str(),
                info.descriptor.profile.has_shift,
                info.descriptor.profile.regional
            );
            match info.local_file_bytes {
                Some(bytes) => println!("Local:     {:.1} KB", bytes as f64 / 1024.0),
                None => println!("Local:     not downloaded"),
            }
            match &info.state {
                Some(state) => {
                    let period =
                        state.last_period.map(|p| p.to_string()).unwrap_or_else(|| "-".into());
                    println!(
                        "State:     period={} version={} downloaded={}",
                        period, state.version, state.last_download_at
                    );
                    println!("Hash:      {}", state.hash_sha256);
                }
                None => println!("State:     none"),
            }
            match info.remote_latest {
                Some(period) => println!("Remote:    {period}"),
                None => println!("Remote:    unavailable"),
            }
        }
        Command::Update { code } => {
            let report = orchestrator.update_one(&code).await?;
            print_report("Update", &report);
            finish(report)?;
        }
        Command::UpdateAll => {
            let report = orchestrator.update_all().await?;
            print_report("Update", &report);
            finish(report)?;
        }
        Command::ProcessAll { test } => {
            let report = orchestrator.process_all(test).await?;
            print_report("Process", &report);
            finish(report)?;
        }
        Command::Process { code } => {
            let report = orchestrator.process_one(&code, false).await?;
            print_report("Process", &report);
            finish(report)?;
        }
        Command::Status => {
            let stats = orchestrator.status().await?;
            println!("=== Analytical store ===");
            println!("Total facts: {}", stats.total_rows);
            for table in &stats.tables {
                println!(
                    "  [{}] rows={:<7} periods={}..{} version={} loaded={}",
                    table.source_table,
                    table.rows,
                    table.first_period.as_deref().unwrap_or("-"),
                    table.last_period.as_deref().unwrap_or("-"),
                    table.data_version.as_deref().unwrap_or("-"),
                    table.loaded_at.as_deref().unwrap_or("-"),
                );
            }
            if !stats.latest_periods.is_empty() {
                println!("Latest periods:");
                for (period, rows) in &stats.latest_periods {
                    println!("  {period}: {rows} facts");
                }
            }
        }
    }

    Ok(())
}

fn print_report(title: &str, report: &RunReport) {
    println!("=== {title} summary ===");
    println!("Attempted:  {}", report.tables_attempted);
    println!("Downloaded: {}", report.tables_downloaded);
    println!("Loaded:     {}", report.tables_loaded);
    println!("Facts:      {}", report.row_count);
    println!("Duration:   {:.1}s", report.duration_seconds());
    if !report.warnings.is_empty() {
        println!("Warnings ({}):", report.warnings.len());
        for warning in report.warnings.iter().take(10) {
            println!("  - {warning}");
        }
        if report.warnings.len() > 10 {
            println!("  ... and {} more", report.warnings.len() - 10);
        }
    }
    if !report.errors.is_empty() {
        println!("Errors ({}):", report.errors.len());
        for error in &report.errors {
            println!("  - {error}");
        }
    }
}

fn finish(report: RunReport) -> Result<()> {
    if report.ok() {
        Ok(())
    } else {
        anyhow::bail!("run finished with {} error(s)", report.errors.len())
    }
}
