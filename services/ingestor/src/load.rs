//! Loader for the embedded analytical store: canonical schema, atomic
//! full-replace / per-source replace, and the derived views consumed by
//! dashboards.

use std::path::Path;

use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::info;

use crate::error::{PipelineError, Result};
use crate::model::FactRow;
use crate::state::sha256_hex;

const CREATE_OBSERVATIONS: &str = "
CREATE TABLE IF NOT EXISTS observations (
    period TEXT NOT NULL,
    period_start DATE NOT NULL,
    period_end DATE NOT NULL,
    territorial_scope TEXT NOT NULL,
    region_code TEXT,
    region_name TEXT,
    activity_level TEXT NOT NULL,
    activity_code TEXT,
    activity_name TEXT,
    activity_path TEXT NOT NULL,
    shift_type TEXT,
    metric TEXT NOT NULL,
    cause TEXT,
    value REAL NOT NULL,
    unit TEXT NOT NULL,
    source_table TEXT NOT NULL,
    is_total_region INTEGER NOT NULL,
    is_total_activity INTEGER NOT NULL,
    is_total_shift INTEGER NOT NULL,
    grain_role TEXT NOT NULL,
    data_version TEXT NOT NULL,
    loaded_at TEXT NOT NULL,
    CHECK (territorial_scope IN ('NAC', 'CCAA')),
    CHECK (activity_level IN ('TOTAL', 'SECTOR_BS', 'SECTION', 'DIVISION')),
    CHECK (shift_type IN ('TOTAL', 'FULL', 'PARTIAL') OR shift_type IS NULL),
    CHECK (metric IN ('hours_pacted', 'hours_paid', 'hours_effective',
                      'hours_extraordinary', 'hours_not_worked')),
    CHECK (value >= 0)
)";

const INDEXES: [&str; 5] = [
    "CREATE INDEX IF NOT EXISTS idx_observations_period ON observations(period)",
    "CREATE INDEX IF NOT EXISTS idx_observations_metric_cause ON observations(metric, cause)",
    "CREATE INDEX IF NOT EXISTS idx_observations_grain ON observations(grain_role)",
    "CREATE INDEX IF NOT EXISTS idx_observations_scope ON observations(territorial_scope, region_code)",
    "CREATE INDEX IF NOT EXISTS idx_observations_activity ON observations(activity_level, activity_code)",
];

const INSERT_OBSERVATION: &str = "
INSERT INTO observations (
    period, period_start, period_end,
    territorial_scope, region_code, region_name,
    activity_level, activity_code, activity_name, activity_path,
    shift_type, metric, cause, value, unit, source_table,
    is_total_region, is_total_activity, is_total_shift,
    grain_role, data_version, loaded_at
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";

/// Causes that count toward the downstream absenteeism rate. The view
/// definition carries this policy so the stored facts stay complete.
const ABSENTEEISM_CAUSES: &str = "('temporary_incapacity_total', 'maternity_paternity', \
     'paid_leave', 'labour_conflict', 'union_representation', 'other')";

pub struct Loader {
    pool: SqlitePool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableCoverage {
    pub source_table: String,
    pub rows: i64,
    pub first_period: Option<String>,
    pub last_period: Option<String>,
    pub data_version: Option<String>,
    pub loaded_at: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StoreStats {
    pub total_rows: i64,
    pub tables: Vec<TableCoverage>,
    pub latest_periods: Vec<(String, i64)>,
}

impl Loader {
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(PipelineError::Schema)?;
        Ok(Self { pool })
    }

    /// In-memory store; one connection so the database outlives statements.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(PipelineError::Schema)?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(CREATE_OBSERVATIONS)
            .execute(&self.pool)
            .await
            .map_err(PipelineError::Schema)?;
        for statement in INDEXES {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(PipelineError::Schema)?;
        }
        Ok(())
    }

    /// Drop everything and insert the full fact set in one transaction.
    pub async fn replace_all(&self, facts: &[FactRow]) -> Result<u64> {
        self.ensure_schema().await?;
        let mut tx = self.pool.begin().await.map_err(PipelineError::Load)?;
        sqlx::query("DELETE FROM observations")
            .execute(&mut *tx)
            .await
            .map_err(PipelineError::Load)?;
        for fact in facts {
            insert_fact(&mut tx, fact).await?;
        }
        tx.commit().await.map_err(PipelineError::Load)?;
        self.refresh_views().await?;
        info!(rows = facts.len(), "full replace committed");
        Ok(facts.len() as u64)
    }

    /// Replace one source table's rows atomically; other tables' facts are
    /// untouched.
    pub async fn replace_source(&self, source_table: &str, facts: &[FactRow]) -> Result<u64> {
        self.ensure_schema().await?;
        let mut tx = self.pool.begin().await.map_err(PipelineError::Load)?;
        sqlx::query("DELETE FROM observations WHERE source_table = ?")
            .bind(source_table)
            .execute(&mut *tx)
            .await
            .map_err(PipelineError::Load)?;
        for fact in facts {
            insert_fact(&mut tx, fact).await?;
        }
        tx.commit().await.map_err(PipelineError::Load)?;
        self.refresh_views().await?;
        info!(source_table, rows = facts.len(), "per-source replace committed");
        Ok(facts.len() as u64)
    }

    /// Re-materialise the three derived views used by collaborators.
    pub async fn refresh_views(&self) -> Result<()> {
        let statements = [
            "DROP VIEW IF EXISTS v_rate_absenteeism".to_string(),
            format!(
                "CREATE VIEW v_rate_absenteeism AS
                 SELECT period, territorial_scope, region_code, region_name,
                        activity_level, activity_code, activity_name, shift_type,
                        SUM(CASE WHEN metric = 'hours_pacted' THEN value ELSE 0 END) AS hours_pacted,
                        SUM(CASE WHEN metric = 'hours_not_worked' AND cause IN {causes}
                            THEN value ELSE 0 END) AS hours_absence,
                        ROUND(100.0 *
                            SUM(CASE WHEN metric = 'hours_not_worked' AND cause IN {causes}
                                THEN value ELSE 0 END) /
                            NULLIF(SUM(CASE WHEN metric = 'hours_pacted' THEN value ELSE 0 END), 0),
                        2) AS rate_absenteeism
                 FROM observations
                 GROUP BY period, territorial_scope, region_code, region_name,
                          activity_level, activity_code, activity_name, shift_type",
                causes = ABSENTEEISM_CAUSES
            ),
            "DROP VIEW IF EXISTS v_national_series".to_string(),
            "CREATE VIEW v_national_series AS
             SELECT period, metric, cause, AVG(value) AS value, COUNT(*) AS observations
             FROM observations
             WHERE territorial_scope = 'NAC' AND is_total_activity = 1 AND is_total_shift = 1
             GROUP BY period, metric, cause"
                .to_string(),
            "DROP VIEW IF EXISTS v_regional_comparison".to_string(),
            "CREATE VIEW v_regional_comparison AS
             SELECT period, region_name, metric, AVG(value) AS value
             FROM observations
             WHERE territorial_scope = 'CCAA' AND is_total_activity = 1 AND is_total_shift = 1
             GROUP BY period, region_name, metric"
                .to_string(),
        ];
        for statement in &statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(PipelineError::Schema)?;
        }
        Ok(())
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        self.ensure_schema().await?;
        let total_rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM observations")
            .fetch_one(&self.pool)
            .await
            .map_err(PipelineError::Load)?;

        type CoverageRow = (String, i64, Option<String>, Option<String>, Option<String>, Option<String>);
        let tables = sqlx::query_as::<_, CoverageRow>(
            "SELECT source_table, COUNT(*), MIN(period), MAX(period),
                    MAX(data_version), MAX(loaded_at)
             FROM observations GROUP BY source_table ORDER BY source_table",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(PipelineError::Load)?
        .into_iter()
        .map(|(source_table, rows, first_period, last_period, data_version, loaded_at)| {
            TableCoverage {
                source_table,
                rows,
                first_period,
                last_period,
                data_version,
                loaded_at,
            }
        })
        .collect();

        let latest_periods = sqlx::query_as::<_, (String, i64)>(
            "SELECT period, COUNT(*) FROM observations
             GROUP BY period ORDER BY period DESC LIMIT 5",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(PipelineError::Load)?;

        Ok(StoreStats {
            total_rows,
            tables,
            latest_periods,
        })
    }

    /// Content hash of one source table's rows, for idempotence checks.
    /// The load timestamp is excluded on purpose.
    pub async fn table_digest(&self, source_table: &str) -> Result<String> {
        let rows = sqlx::query(
            "SELECT period, territorial_scope, IFNULL(region_code, ''),
                    activity_level, IFNULL(activity_code, ''), IFNULL(shift_type, ''),
                    metric, IFNULL(cause, ''), value, unit
             FROM observations WHERE source_table = ?
             ORDER BY 1, 2, 3, 4, 5, 6, 7, 8",
        )
        .bind(source_table)
        .fetch_all(&self.pool)
        .await
        .map_err(PipelineError::Load)?;

        let mut canonical = String::new();
        for row in &rows {
            for i in 0..8 {
                canonical.push_str(&row.get::<String, _>(i));
                canonical.push('|');
            }
            canonical.push_str(&format!("{:.3}|{}\n", row.get::<f64, _>(8), row.get::<String, _>(9)));
        }
        Ok(sha256_hex(canonical.as_bytes()))
    }
}

async fn insert_fact(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    fact: &FactRow,
) -> Result<()> {
    sqlx::query(INSERT_OBSERVATION)
        .bind(fact.period.to_string())
        .bind(fact.period_start)
        .bind(fact.period_end)
        .bind(fact.scope.as_str())
        .bind(fact.region_code.as_deref())
        .bind(fact.region_name.as_deref())
        .bind(fact.activity_level.as_str())
        .bind(fact.activity_code.as_deref())
        .bind(fact.activity_name.as_deref())
        .bind(fact.activity_path.as_str())
        .bind(fact.shift_type.map(|s| s.as_str()))
        .bind(fact.metric.as_str())
        .bind(fact.cause.map(|c| c.as_str()))
        .bind(fact.value)
        .bind(fact.unit.as_str())
        .bind(fact.source_table.as_str())
        .bind(fact.is_total_region)
        .bind(fact.is_total_activity)
        .bind(fact.is_total_shift)
        .bind(fact.grain_role.as_str())
        .bind(fact.data_version.to_string())
        .bind(fact.loaded_at)
        .execute(&mut **tx)
        .await
        .map(|_| ())
        .map_err(classify_insert_error)
}

fn classify_insert_error(error: sqlx::Error) -> PipelineError {
    if let sqlx::Error::Database(db) = &error {
        let message = db.message().to_lowercase();
        if message.contains("check") || message.contains("constraint") || message.contains("not null") {
            return PipelineError::Constraint(db.message().to_string());
        }
    }
    PipelineError::Load(error)
}
