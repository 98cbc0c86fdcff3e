//! Orchestration: wires the update detector, fetcher, extractor,
//! transformer, validators and loader together and records outcomes in
//! the state store. One run, one report.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::catalogue::{AppConfig, TableDescriptor};
use crate::error::{PipelineError, Result};
use crate::extract;
use crate::fetch::Fetcher;
use crate::load::{Loader, StoreStats};
use crate::model::FactRow;
use crate::period::Period;
use crate::state::{self, DataDirs, StateStore, TableState};
use crate::transform::Transformer;
use crate::update::{self, TableCheck, UpdateDetector};
use crate::validate;

#[derive(Debug, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub tables_attempted: usize,
    pub tables_downloaded: usize,
    pub tables_loaded: usize,
    pub row_count: u64,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl RunReport {
    fn begin() -> Self {
        let now = Utc::now();
        Self {
            started_at: now,
            finished_at: now,
            tables_attempted: 0,
            tables_downloaded: 0,
            tables_loaded: 0,
            row_count: 0,
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn finish(mut self) -> Self {
        self.finished_at = Utc::now();
        self
    }

    pub fn ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn duration_seconds(&self) -> f64 {
        (self.finished_at - self.started_at).num_milliseconds() as f64 / 1000.0
    }
}

/// Everything `info <code>` needs to print.
#[derive(Debug)]
pub struct TableInfo {
    pub descriptor: TableDescriptor,
    pub state: Option<TableState>,
    pub remote_latest: Option<Period>,
    pub local_file_bytes: Option<u64>,
}

pub struct Orchestrator {
    config: AppConfig,
    dirs: DataDirs,
    state: StateStore,
    fetcher: Fetcher,
    db_path: PathBuf,
}

impl Orchestrator {
    pub fn new(config: AppConfig, data_root: &Path, db_path: PathBuf) -> Result<Self> {
        let dirs = DataDirs::under(data_root);
        dirs.ensure()?;
        let fetcher = Fetcher::new(&config.download)?;
        let state = StateStore::new(dirs.state.clone());
        Ok(Self {
            config,
            dirs,
            state,
            fetcher,
            db_path,
        })
    }

    pub fn tables(&self) -> Vec<TableDescriptor> {
        self.config.tables()
    }

    fn table(&self, code: &str) -> Result<TableDescriptor> {
        self.config
            .table(code)
            .ok_or_else(|| PipelineError::State(format!("table {code} is not in the catalogue")))
    }

    // ------------------------------------------------------------------
    // Update detection
    // ------------------------------------------------------------------

    pub async fn check_all(&self) -> Result<Vec<TableCheck>> {
        let detector = UpdateDetector::new(&self.fetcher, &self.state);
        let mut checks = Vec::new();
        for table in self.tables() {
            checks.push(detector.check(&table).await?);
        }
        Ok(checks)
    }

    pub async fn info(&self, code: &str) -> Result<TableInfo> {
        let descriptor = self.table(code)?;
        let detector = UpdateDetector::new(&self.fetcher, &self.state);
        let remote_latest = detector.remote_latest(&descriptor).await;
        let local_file_bytes = fs::metadata(self.dirs.raw_file(code)).ok().map(|m| m.len());
        Ok(TableInfo {
            state: self.state.get(code)?,
            descriptor,
            remote_latest,
            local_file_bytes,
        })
    }

    // ------------------------------------------------------------------
    // Download
    // ------------------------------------------------------------------

    pub async fn download_all(&self) -> Result<RunReport> {
        Ok(self.download_tables(&self.tables()).await)
    }

    pub async fn download_one(&self, code: &str) -> Result<RunReport> {
        let table = self.table(code)?;
        Ok(self.download_tables(&[table]).await)
    }

    /// Fetch each table's CSV, back up any prior file, persist the decoded
    /// bytes as UTF-8 and update the state record. Failures are recorded
    /// per table; a snapshot is written after any successful round.
    async fn download_tables(&self, tables: &[TableDescriptor]) -> RunReport {
        let mut report = RunReport::begin();
        report.tables_attempted = tables.len();

        for table in tables {
            match self.fetcher.get(&table.url_csv).await {
                Ok(document) => {
                    let raw_file = self.dirs.raw_file(&table.code);
                    match self.persist_download(table, &document.text) {
                        Ok(()) => {
                            info!(
                                table = %table.code,
                                bytes = document.raw_len,
                                encoding = %document.encoding,
                                file = %raw_file.display(),
                                "table downloaded"
                            );
                            report.tables_downloaded += 1;
                        }
                        Err(e) => report.errors.push(format!("table {}: {e}", table.code)),
                    }
                }
                Err(e) => report.errors.push(format!("table {}: {e}", table.code)),
            }
        }

        if report.tables_downloaded > 0 {
            if let Err(e) = state::write_snapshot(&self.dirs, &self.config.download.candidate_encodings)
            {
                // Snapshots are an audit aid, not a load prerequisite.
                warn!("snapshot failed: {e}");
                report.warnings.push(format!("snapshot failed: {e}"));
            }
        }
        report.finish()
    }

    fn persist_download(&self, table: &TableDescriptor, text: &str) -> Result<()> {
        let raw_file = self.dirs.raw_file(&table.code);
        state::backup_existing(&raw_file, &self.dirs.backups)?;
        fs::write(&raw_file, text)?;
        let last_period = update::period_from_csv_head(text);
        self.state
            .record_download(&table.code, &table.url_csv, text.as_bytes(), last_period)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Process (extract → transform → validate → load)
    // ------------------------------------------------------------------

    pub async fn process_all(&self, test_mode: bool) -> Result<RunReport> {
        self.process(&self.tables(), LoadMode::ReplaceAll, test_mode).await
    }

    pub async fn process_one(&self, code: &str, test_mode: bool) -> Result<RunReport> {
        let table = self.table(code)?;
        let mode = LoadMode::ReplaceSource(table.code.clone());
        self.process(&[table], mode, test_mode).await
    }

    async fn process(
        &self,
        tables: &[TableDescriptor],
        mode: LoadMode,
        test_mode: bool,
    ) -> Result<RunReport> {
        let mut report = RunReport::begin();
        report.tables_attempted = tables.len();

        let transformer = Transformer::new(&self.config.mappings, &self.config.validation);
        let mut facts: Vec<FactRow> = Vec::new();
        let mut extracted: Vec<String> = Vec::new();

        for table in tables {
            let raw_file = self.dirs.raw_file(&table.code);
            let result = extract::load_table(
                &table.code,
                &raw_file,
                &self.config.download.candidate_encodings,
            )
            .and_then(|raw| transformer.transform(table, &raw));

            match result {
                Ok(mut output) => {
                    if test_mode {
                        restrict_to_recent_periods(&mut output.facts, 4);
                    }
                    report.warnings.extend(
                        output.stats.warnings.iter().map(|w| format!("table {}: {w}", table.code)),
                    );
                    info!(
                        table = %table.code,
                        facts = output.facts.len(),
                        dropped = output.stats.dropped_missing_value,
                        "table extracted and transformed"
                    );
                    facts.extend(output.facts);
                    extracted.push(table.code.clone());
                }
                Err(e) => {
                    // Recoverable per table: the run continues without it.
                    report.errors.push(format!("table {}: {e}", table.code));
                }
            }
        }

        if extracted.is_empty() {
            report.errors.push("no table could be extracted".to_string());
            return Ok(report.finish());
        }

        let quality = validate::data_quality(&facts);
        report.warnings.extend(quality.warnings);

        let business = validate::business(&facts, self.config.validation.cause_sum_tolerance);
        report.warnings.extend(business.warnings);
        if !business.passed {
            // Fatal: the loader is never reached and the store is unchanged.
            report.errors.extend(business.errors);
            return Ok(report.finish());
        }

        let loader = Loader::open(&self.db_path).await?;
        let load_result = match &mode {
            LoadMode::ReplaceAll => loader.replace_all(&facts).await,
            LoadMode::ReplaceSource(code) => loader.replace_source(code, &facts).await,
        };
        loader.close().await;

        match load_result {
            Ok(rows) => {
                report.row_count = rows;
                report.tables_loaded = extracted.len();
                let loaded_at = Utc::now();
                for code in &extracted {
                    self.state.record_load(code, loaded_at)?;
                }
                info!(rows, tables = extracted.len(), "load committed");
            }
            Err(e) => report.errors.push(e.to_string()),
        }
        Ok(report.finish())
    }

    // ------------------------------------------------------------------
    // Update (detector-gated download, then process)
    // ------------------------------------------------------------------

    pub async fn update_all(&self) -> Result<RunReport> {
        let checks = self.check_all().await?;
        let stale: Vec<TableDescriptor> = checks
            .iter()
            .filter(|c| c.decision.needs_download())
            .filter_map(|c| self.config.table(&c.code))
            .collect();

        if stale.is_empty() {
            // Nothing changed: no download, no transform, no load.
            let mut report = RunReport::begin();
            report.tables_attempted = checks.len();
            return Ok(report.finish());
        }

        let download = self.download_tables(&stale).await;
        let mut report = self.process_all(false).await?;
        report.started_at = download.started_at;
        report.tables_downloaded = download.tables_downloaded;
        report.warnings = merge(download.warnings, report.warnings);
        report.errors = merge(download.errors, report.errors);
        Ok(report)
    }

    pub async fn update_one(&self, code: &str) -> Result<RunReport> {
        let table = self.table(code)?;
        let detector = UpdateDetector::new(&self.fetcher, &self.state);
        let check = detector.check(&table).await?;
        if !check.decision.needs_download() {
            let mut report = RunReport::begin();
            report.tables_attempted = 1;
            report
                .warnings
                .push(format!("table {code}: {}", check.decision.as_str()));
            return Ok(report.finish());
        }

        let download = self.download_tables(std::slice::from_ref(&table)).await;
        if !download.ok() {
            return Ok(download);
        }
        let mut report = self.process_one(code, false).await?;
        report.started_at = download.started_at;
        report.tables_downloaded = download.tables_downloaded;
        report.warnings = merge(download.warnings, report.warnings);
        Ok(report)
    }

    pub async fn status(&self) -> Result<StoreStats> {
        let loader = Loader::open(&self.db_path).await?;
        let stats = loader.stats().await;
        loader.close().await;
        stats
    }
}

enum LoadMode {
    ReplaceAll,
    ReplaceSource(String),
}

fn merge(mut first: Vec<String>, second: Vec<String>) -> Vec<String> {
    first.extend(second);
    first
}

/// Test mode keeps only the table's most recent quarters.
fn restrict_to_recent_periods(facts: &mut Vec<FactRow>, keep: usize) {
    let mut periods: Vec<Period> = facts.iter().map(|f| f.period).collect();
    periods.sort();
    periods.dedup();
    let cutoff = periods.len().saturating_sub(keep);
    let recent: std::collections::HashSet<Period> = periods[cutoff..].iter().copied().collect();
    facts.retain(|f| recent.contains(&f.period));
}
