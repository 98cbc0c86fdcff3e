//! Persistent state: per-table download records, backups of prior file
//! versions, and dated snapshots of each download round.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::error::{PipelineError, Result};
use crate::extract;
use crate::period::Period;

/// Filesystem layout of the pipeline's working data. All directories are
/// parameters; nothing in the core hard-codes a path.
#[derive(Debug, Clone)]
pub struct DataDirs {
    pub raw: PathBuf,
    pub state: PathBuf,
    pub backups: PathBuf,
    pub snapshots: PathBuf,
}

impl DataDirs {
    pub fn under(root: &Path) -> Self {
        Self {
            raw: root.join("raw"),
            state: root.join("state"),
            backups: root.join("backups"),
            snapshots: root.join("snapshots"),
        }
    }

    pub fn ensure(&self) -> Result<()> {
        for dir in [&self.raw, &self.state, &self.backups, &self.snapshots] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn raw_file(&self, code: &str) -> PathBuf {
        self.raw.join(format!("{code}.csv"))
    }
}

/// Per-table metadata record, one JSON file per table code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableState {
    pub table_code: String,
    pub last_download_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_successful_load_at: Option<DateTime<Utc>>,
    pub last_period: Option<Period>,
    pub hash_sha256: String,
    pub file_size_bytes: u64,
    pub url: String,
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<PreviousVersion>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviousVersion {
    pub downloaded_at: DateTime<Utc>,
    pub period: Option<Period>,
    pub hash_sha256: String,
}

pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn file(&self, code: &str) -> PathBuf {
        self.dir.join(format!("{code}_metadata.json"))
    }

    pub fn get(&self, code: &str) -> Result<Option<TableState>> {
        let path = self.file(code);
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)?;
        let record = serde_json::from_str(&text)
            .map_err(|e| PipelineError::State(format!("corrupt state record {}: {e}", path.display())))?;
        Ok(Some(record))
    }

    pub fn set(&self, record: &TableState) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.file(&record.table_code);
        fs::write(&path, serde_json::to_string_pretty(record)?)?;
        Ok(())
    }

    /// Record a successful download, bumping the version counter and
    /// keeping a pointer to the record it replaces.
    pub fn record_download(
        &self,
        code: &str,
        url: &str,
        bytes: &[u8],
        last_period: Option<Period>,
    ) -> Result<TableState> {
        let prior = self.get(code)?;
        let record = TableState {
            table_code: code.to_string(),
            last_download_at: Utc::now(),
            last_successful_load_at: prior.as_ref().and_then(|p| p.last_successful_load_at),
            last_period,
            hash_sha256: sha256_hex(bytes),
            file_size_bytes: bytes.len() as u64,
            url: url.to_string(),
            version: prior.as_ref().map_or(1, |p| p.version + 1),
            previous: prior.map(|p| PreviousVersion {
                downloaded_at: p.last_download_at,
                period: p.last_period,
                hash_sha256: p.hash_sha256,
            }),
        };
        self.set(&record)?;
        Ok(record)
    }

    /// Stamp the time of the last successful load into the analytical
    /// store. A no-op for tables that were never downloaded.
    pub fn record_load(&self, code: &str, at: DateTime<Utc>) -> Result<()> {
        if let Some(mut record) = self.get(code)? {
            record.last_successful_load_at = Some(at);
            self.set(&record)?;
        }
        Ok(())
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Copy an existing raw file aside before it is overwritten. Returns the
/// backup path, or None when there was nothing to back up.
pub fn backup_existing(raw_file: &Path, backups_dir: &Path) -> Result<Option<PathBuf>> {
    if !raw_file.exists() {
        return Ok(None);
    }
    fs::create_dir_all(backups_dir)?;
    let stem = raw_file
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("table");
    let stamp = Utc::now().format("%Y%m%d_%H%M%S");
    let backup_path = backups_dir.join(format!("{stem}_{stamp}.csv"));
    fs::copy(raw_file, &backup_path)?;
    info!(from = %raw_file.display(), to = %backup_path.display(), "backup created");
    Ok(Some(backup_path))
}

// ============================================================================
// Snapshots
// ============================================================================

#[derive(Debug, Serialize)]
struct SnapshotMetadata {
    created_at: DateTime<Utc>,
    files: usize,
    total_bytes: u64,
}

#[derive(Debug, Serialize)]
struct FileChecksum {
    sha256: String,
    size_bytes: u64,
    rows: usize,
    columns: usize,
}

#[derive(Debug, Serialize)]
struct FileSummary {
    headers: Vec<String>,
    first_row: Vec<String>,
    last_row: Vec<String>,
}

#[derive(Debug, Serialize)]
struct FilePeriods {
    earliest: Option<Period>,
    latest: Option<Period>,
    rows: usize,
}

/// Write a dated snapshot of every raw CSV: the files themselves plus a
/// structural digest for audit and rollback.
pub fn write_snapshot(dirs: &DataDirs, encodings: &[String]) -> Result<PathBuf> {
    let day = Utc::now().date_naive().format("%Y-%m-%d").to_string();
    let snapshot_dir = dirs.snapshots.join(day);
    fs::create_dir_all(&snapshot_dir)?;

    let mut checksums = std::collections::BTreeMap::new();
    let mut summaries = std::collections::BTreeMap::new();
    let mut periods = std::collections::BTreeMap::new();
    let mut total_bytes = 0u64;

    let mut entries: Vec<PathBuf> = fs::read_dir(&dirs.raw)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|x| x.to_str()) == Some("csv"))
        .collect();
    entries.sort();

    for path in &entries {
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let bytes = fs::read(path)?;
        total_bytes += bytes.len() as u64;
        fs::copy(path, snapshot_dir.join(file_name))?;

        let code = path.file_stem().and_then(|s| s.to_str()).unwrap_or(file_name);
        match extract::load_table(code, path, encodings) {
            Ok(table) => {
                checksums.insert(
                    file_name.to_string(),
                    FileChecksum {
                        sha256: sha256_hex(&bytes),
                        size_bytes: bytes.len() as u64,
                        rows: table.rows.len(),
                        columns: table.headers.len(),
                    },
                );
                summaries.insert(
                    file_name.to_string(),
                    FileSummary {
                        headers: table.headers.clone(),
                        first_row: table.row_display(0),
                        last_row: table.row_display(table.rows.len().saturating_sub(1)),
                    },
                );
                let mut table_periods: Vec<Period> = table.periods();
                table_periods.sort();
                periods.insert(
                    file_name.to_string(),
                    FilePeriods {
                        earliest: table_periods.first().copied(),
                        latest: table_periods.last().copied(),
                        rows: table.rows.len(),
                    },
                );
            }
            Err(e) => {
                warn!(file = file_name, "snapshot digest skipped: {e}");
                checksums.insert(
                    file_name.to_string(),
                    FileChecksum {
                        sha256: sha256_hex(&bytes),
                        size_bytes: bytes.len() as u64,
                        rows: 0,
                        columns: 0,
                    },
                );
            }
        }
    }

    let metadata = SnapshotMetadata {
        created_at: Utc::now(),
        files: entries.len(),
        total_bytes,
    };
    fs::write(snapshot_dir.join("metadata.json"), serde_json::to_string_pretty(&metadata)?)?;
    fs::write(snapshot_dir.join("checksums.json"), serde_json::to_string_pretty(&checksums)?)?;
    fs::write(snapshot_dir.join("summary.json"), serde_json::to_string_pretty(&summaries)?)?;
    fs::write(snapshot_dir.join("periods.json"), serde_json::to_string_pretty(&periods)?)?;
    info!(dir = %snapshot_dir.display(), files = entries.len(), "snapshot written");
    Ok(snapshot_dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("etcl-{name}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn record_download_bumps_version_and_keeps_previous() {
        let dir = scratch_dir("state-versions");
        let store = StateStore::new(dir.clone());

        let first = store
            .record_download("6042", "https://example.test/6042.csv", b"one", "2024T3".parse().ok())
            .unwrap();
        assert_eq!(first.version, 1);
        assert!(first.previous.is_none());

        let second = store
            .record_download("6042", "https://example.test/6042.csv", b"two", "2024T4".parse().ok())
            .unwrap();
        assert_eq!(second.version, 2);
        let previous = second.previous.unwrap();
        assert_eq!(previous.hash_sha256, first.hash_sha256);
        assert_eq!(previous.period, first.last_period);

        let loaded = store.get("6042").unwrap().unwrap();
        assert_eq!(loaded.version, 2);
        assert_eq!(loaded.last_period, "2024T4".parse().ok());

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn record_load_stamps_existing_record_only() {
        let dir = scratch_dir("state-load");
        let store = StateStore::new(dir.clone());

        store.record_load("6042", Utc::now()).unwrap();
        assert!(store.get("6042").unwrap().is_none());

        store
            .record_download("6042", "https://example.test/6042.csv", b"data", None)
            .unwrap();
        let at = Utc::now();
        store.record_load("6042", at).unwrap();
        let record = store.get("6042").unwrap().unwrap();
        assert_eq!(record.last_successful_load_at, Some(at));

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn backup_copies_prior_bytes() {
        let dir = scratch_dir("state-backup");
        let raw = dir.join("6042.csv");
        let backups = dir.join("backups");

        assert!(backup_existing(&raw, &backups).unwrap().is_none());

        fs::write(&raw, "Periodo;Total\n2024T4;151,4\n").unwrap();
        let backup = backup_existing(&raw, &backups).unwrap().unwrap();
        assert_eq!(fs::read(&backup).unwrap(), fs::read(&raw).unwrap());
        assert!(backup.file_name().unwrap().to_str().unwrap().starts_with("6042_"));

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn snapshot_digests_raw_files() {
        let dir = scratch_dir("state-snapshot");
        let dirs = DataDirs::under(&dir);
        dirs.ensure().unwrap();
        fs::write(
            dirs.raw_file("6044"),
            "Sectores de actividad CNAE 2009;Tiempo de trabajo;Periodo;Total\n\
             Industria;Horas pactadas;2024T4;151,4\n\
             Industria;Horas pactadas;2024T3;153,3\n",
        )
        .unwrap();

        let snapshot = write_snapshot(&dirs, &["utf-8".to_string()]).unwrap();
        for name in ["metadata.json", "checksums.json", "summary.json", "periods.json", "6044.csv"] {
            assert!(snapshot.join(name).exists(), "missing {name}");
        }
        let periods: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(snapshot.join("periods.json")).unwrap()).unwrap();
        assert_eq!(periods["6044.csv"]["earliest"], "2024T3");
        assert_eq!(periods["6044.csv"]["latest"], "2024T4");
        assert_eq!(periods["6044.csv"]["rows"], 2);

        fs::remove_dir_all(&dir).unwrap();
    }
}
