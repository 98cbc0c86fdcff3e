//! Static table catalogue and dimension mappings, read from the
//! configuration document (`config/tables.json` by default).

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use tracing::warn;

use crate::error::{PipelineError, Result};
use crate::model::{ActivityLevel, Cause, Metric, ShiftType};

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub categories: BTreeMap<String, Category>,
    pub download: DownloadConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    pub mappings: Mappings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Category {
    pub description: String,
    pub tables: BTreeMap<String, TableEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TableEntry {
    pub name: String,
    pub url_csv: String,
    pub url_json: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DownloadConfig {
    pub max_retries: u32,
    pub timeout_seconds: u64,
    pub retry_delay_seconds: f64,
    pub candidate_encodings: Vec<String>,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_user_agent() -> String {
    "etcl-ingestor/0.1".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValidationConfig {
    /// Allowed excess, in hours, of the cause-specific sum over the
    /// null-cause total of hours not worked.
    #[serde(default = "default_tolerance")]
    pub cause_sum_tolerance: f64,
    /// Proportion of unmapped rows above which a transform is fatal.
    #[serde(default = "default_unmapped_threshold")]
    pub unmapped_row_threshold: f64,
}

fn default_tolerance() -> f64 {
    0.5
}

fn default_unmapped_threshold() -> f64 {
    0.05
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            cause_sum_tolerance: default_tolerance(),
            unmapped_row_threshold: default_unmapped_threshold(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Mappings {
    pub regions: BTreeMap<String, RegionTarget>,
    pub sectors: BTreeMap<String, SectorTarget>,
    pub shifts: BTreeMap<String, ShiftType>,
    pub metric_labels: BTreeMap<String, MetricTarget>,
    pub table_profiles: BTreeMap<String, TableProfile>,
}

/// Regional label target. Both fields null means the label is the national
/// aggregate.
#[derive(Debug, Clone, Deserialize)]
pub struct RegionTarget {
    pub code: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SectorTarget {
    pub level: ActivityLevel,
    pub code: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricTarget {
    pub metric: Metric,
    pub cause: Option<Cause>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TableProfile {
    pub activity_level_default: ActivityLevel,
    pub has_shift: bool,
    #[serde(default)]
    pub regional: bool,
}

/// Everything the pipeline needs to know about one source table.
#[derive(Debug, Clone)]
pub struct TableDescriptor {
    pub code: String,
    pub name: String,
    pub category: String,
    pub url_csv: String,
    pub url_json: String,
    pub profile: TableProfile,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            PipelineError::State(format!("cannot read configuration {}: {e}", path.display()))
        })?;
        let config: AppConfig = serde_json::from_str(&text)?;
        Ok(config)
    }

    fn profile_for(&self, code: &str) -> TableProfile {
        match self.mappings.table_profiles.get(code) {
            Some(profile) => profile.clone(),
            None => {
                warn!(table = code, "no profile configured, assuming national totals");
                TableProfile {
                    activity_level_default: ActivityLevel::Total,
                    has_shift: false,
                    regional: false,
                }
            }
        }
    }

    /// All configured tables, in the catalogue's declared order.
    pub fn tables(&self) -> Vec<TableDescriptor> {
        let mut out = Vec::new();
        for (category, info) in &self.categories {
            for (code, entry) in &info.tables {
                out.push(TableDescriptor {
                    code: code.clone(),
                    name: entry.name.clone(),
                    category: category.clone(),
                    url_csv: entry.url_csv.clone(),
                    url_json: entry.url_json.clone(),
                    profile: self.profile_for(code),
                });
            }
        }
        out
    }

    pub fn table(&self, code: &str) -> Option<TableDescriptor> {
        self.tables().into_iter().find(|t| t.code == code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> AppConfig {
        let json = r#"{
            "categories": {
                "tiempo_trabajo": {
                    "description": "working time",
                    "tables": {
                        "6042": {
                            "name": "Tiempo de trabajo",
                            "url_csv": "https://example.test/6042.csv",
                            "url_json": "https://example.test/6042"
                        }
                    }
                }
            },
            "download": {
                "max_retries": 3,
                "timeout_seconds": 60,
                "retry_delay_seconds": 2.0,
                "candidate_encodings": ["utf-8", "iso-8859-1"]
            },
            "mappings": {
                "regions": { "Total Nacional": { "code": null, "name": null } },
                "sectors": { "Industria": { "level": "SECTOR_BS", "code": "B-E" } },
                "shifts": { "Ambas jornadas": "TOTAL" },
                "metric_labels": {
                    "Horas pactadas": { "metric": "hours_pacted", "cause": null },
                    "Horas no trabajadas por I.T.": {
                        "metric": "hours_not_worked",
                        "cause": "temporary_incapacity_total"
                    }
                },
                "table_profiles": {
                    "6042": { "activity_level_default": "SECTOR_BS", "has_shift": true }
                }
            }
        }"#;
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn builds_descriptors_with_profiles() {
        let config = sample_config();
        let tables = config.tables();
        assert_eq!(tables.len(), 1);
        let t = &tables[0];
        assert_eq!(t.code, "6042");
        assert_eq!(t.category, "tiempo_trabajo");
        assert_eq!(t.profile.activity_level_default, ActivityLevel::SectorBs);
        assert!(t.profile.has_shift);
        assert!(!t.profile.regional);
    }

    #[test]
    fn metric_labels_deserialize_into_enums() {
        let config = sample_config();
        let it = &config.mappings.metric_labels["Horas no trabajadas por I.T."];
        assert_eq!(it.metric, Metric::HoursNotWorked);
        assert_eq!(it.cause, Some(Cause::TemporaryIncapacityTotal));
    }

    #[test]
    fn validation_defaults_apply_when_absent() {
        let config = sample_config();
        assert!(config.validation.cause_sum_tolerance > 0.0);
        assert!(config.validation.unmapped_row_threshold > 0.0);
    }

    #[test]
    fn missing_profile_falls_back_to_national_totals() {
        let mut config = sample_config();
        config.mappings.table_profiles.clear();
        let t = config.table("6042").unwrap();
        assert_eq!(t.profile.activity_level_default, ActivityLevel::Total);
        assert!(!t.profile.has_shift);
    }

    #[test]
    fn repository_config_parses() {
        let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../config/tables.json");
        let config = AppConfig::load(&path).unwrap();
        let tables = config.tables();
        assert_eq!(tables.len(), 6);
        assert!(config.table("6063").unwrap().profile.regional);
        assert!(!config.table("6046").unwrap().profile.has_shift);
    }
}
