//! API Service - read-only query surface over the analytical store
//!
//! Endpoints:
//! - GET /health - Health check
//! - GET /coverage - Period coverage and fact counts per source table
//! - GET /facts - Row-level filtered observations
//! - GET /series/national - National aggregate series (v_national_series)
//! - GET /regions - Regional comparison (v_regional_comparison)
//! - GET /absenteeism - Absenteeism rates (v_rate_absenteeism)
//!
//! The store is opened read-only: collaborators can never mutate facts.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tower_http::cors::{Any, CorsLayer};

// ============================================================================
// State
// ============================================================================

#[derive(Clone)]
struct AppState {
    pool: SqlitePool,
}

// ============================================================================
// Response types
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    version: &'static str,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
struct CoverageRow {
    source_table: String,
    rows: i64,
    first_period: Option<String>,
    last_period: Option<String>,
    data_version: Option<String>,
    loaded_at: Option<String>,
}

#[derive(Serialize)]
struct FactResponse {
    period: String,
    territorial_scope: String,
    region_code: Option<String>,
    region_name: Option<String>,
    activity_level: String,
    activity_code: Option<String>,
    activity_name: Option<String>,
    activity_path: String,
    shift_type: Option<String>,
    metric: String,
    cause: Option<String>,
    value: f64,
    unit: String,
    source_table: String,
    grain_role: String,
}

#[derive(Serialize)]
struct SeriesRow {
    period: String,
    metric: String,
    cause: Option<String>,
    value: f64,
    observations: i64,
}

#[derive(Serialize)]
struct RegionRow {
    period: String,
    region_name: Option<String>,
    metric: String,
    value: f64,
}

#[derive(Serialize)]
struct AbsenteeismRow {
    period: String,
    territorial_scope: String,
    region_name: Option<String>,
    activity_level: String,
    activity_name: Option<String>,
    shift_type: Option<String>,
    hours_pacted: f64,
    hours_absence: f64,
    rate_absenteeism: Option<f64>,
}

// ============================================================================
// Query params
// ============================================================================

#[derive(Deserialize)]
struct FactsQuery {
    period: Option<String>,
    metric: Option<String>,
    cause: Option<String>,
    scope: Option<String>,
    region_code: Option<String>,
    activity_level: Option<String>,
    activity_code: Option<String>,
    shift_type: Option<String>,
    source_table: Option<String>,
    limit: Option<i64>,
}

#[derive(Deserialize)]
struct SeriesQuery {
    metric: Option<String>,
    cause: Option<String>,
    period: Option<String>,
}

#[derive(Deserialize)]
struct RegionsQuery {
    period: Option<String>,
    metric: Option<String>,
}

#[derive(Deserialize)]
struct AbsenteeismQuery {
    period: Option<String>,
    scope: Option<String>,
    limit: Option<i64>,
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        version: "0.1.0",
    })
}

fn internal_error(e: sqlx::Error) -> axum::response::Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
        .into_response()
}

async fn coverage_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    type Row = (String, i64, Option<String>, Option<String>, Option<String>, Option<String>);
    let rows = sqlx::query_as::<_, Row>(
        "SELECT source_table, COUNT(*), MIN(period), MAX(period),
                MAX(data_version), MAX(loaded_at)
         FROM observations GROUP BY source_table ORDER BY source_table",
    )
    .fetch_all(&state.pool)
    .await;

    match rows {
        Ok(rows) => {
            let coverage: Vec<CoverageRow> = rows
                .into_iter()
                .map(|(source_table, rows, first_period, last_period, data_version, loaded_at)| {
                    CoverageRow {
                        source_table,
                        rows,
                        first_period,
                        last_period,
                        data_version,
                        loaded_at,
                    }
                })
                .collect();
            Json(serde_json::json!({ "coverage": coverage })).into_response()
        }
        Err(e) => internal_error(e),
    }
}

async fn facts_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<FactsQuery>,
) -> impl IntoResponse {
    let limit = params.limit.unwrap_or(100).clamp(1, 10_000);

    let mut query = String::from(
        "SELECT period, territorial_scope, region_code, region_name,
                activity_level, activity_code, activity_name, activity_path,
                shift_type, metric, cause, value, unit, source_table, grain_role
         FROM observations WHERE 1=1",
    );
    let mut bindings: Vec<String> = Vec::new();
    let filters: [(&str, &Option<String>); 9] = [
        ("period", &params.period),
        ("metric", &params.metric),
        ("cause", &params.cause),
        ("territorial_scope", &params.scope),
        ("region_code", &params.region_code),
        ("activity_level", &params.activity_level),
        ("activity_code", &params.activity_code),
        ("shift_type", &params.shift_type),
        ("source_table", &params.source_table),
    ];
    for (column, value) in filters {
        if let Some(value) = value {
            query.push_str(&format!(" AND {column} = ?"));
            bindings.push(value.clone());
        }
    }
    query.push_str(" ORDER BY period DESC, source_table, metric LIMIT ?");

    let mut q = sqlx::query(&query);
    for value in &bindings {
        q = q.bind(value);
    }
    q = q.bind(limit);

    match q.fetch_all(&state.pool).await {
        Ok(rows) => {
            let facts: Vec<FactResponse> = rows
                .iter()
                .map(|row| FactResponse {
                    period: row.get("period"),
                    territorial_scope: row.get("territorial_scope"),
                    region_code: row.get("region_code"),
                    region_name: row.get("region_name"),
                    activity_level: row.get("activity_level"),
                    activity_code: row.get("activity_code"),
                    activity_name: row.get("activity_name"),
                    activity_path: row.get("activity_path"),
                    shift_type: row.get("shift_type"),
                    metric: row.get("metric"),
                    cause: row.get("cause"),
                    value: row.get("value"),
                    unit: row.get("unit"),
                    source_table: row.get("source_table"),
                    grain_role: row.get("grain_role"),
                })
                .collect();
            Json(serde_json::json!({ "facts": facts })).into_response()
        }
        Err(e) => internal_error(e),
    }
}

async fn series_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SeriesQuery>,
) -> impl IntoResponse {
    let mut query = String::from(
        "SELECT period, metric, cause, value, observations FROM v_national_series WHERE 1=1",
    );
    let mut bindings: Vec<String> = Vec::new();
    for (column, value) in [
        ("period", &params.period),
        ("metric", &params.metric),
        ("cause", &params.cause),
    ] {
        if let Some(value) = value {
            query.push_str(&format!(" AND {column} = ?"));
            bindings.push(value.clone());
        }
    }
    query.push_str(" ORDER BY period, metric, cause");

    let mut q = sqlx::query(&query);
    for value in &bindings {
        q = q.bind(value);
    }

    match q.fetch_all(&state.pool).await {
        Ok(rows) => {
            let series: Vec<SeriesRow> = rows
                .iter()
                .map(|row| SeriesRow {
                    period: row.get("period"),
                    metric: row.get("metric"),
                    cause: row.get("cause"),
                    value: row.get("value"),
                    observations: row.get("observations"),
                })
                .collect();
            Json(serde_json::json!({ "series": series })).into_response()
        }
        Err(e) => internal_error(e),
    }
}

async fn regions_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RegionsQuery>,
) -> impl IntoResponse {
    let mut query =
        String::from("SELECT period, region_name, metric, value FROM v_regional_comparison WHERE 1=1");
    let mut bindings: Vec<String> = Vec::new();
    for (column, value) in [("period", &params.period), ("metric", &params.metric)] {
        if let Some(value) = value {
            query.push_str(&format!(" AND {column} = ?"));
            bindings.push(value.clone());
        }
    }
    query.push_str(" ORDER BY period, region_name, metric");

    let mut q = sqlx::query(&query);
    for value in &bindings {
        q = q.bind(value);
    }

    match q.fetch_all(&state.pool).await {
        Ok(rows) => {
            let regions: Vec<RegionRow> = rows
                .iter()
                .map(|row| RegionRow {
                    period: row.get("period"),
                    region_name: row.get("region_name"),
                    metric: row.get("metric"),
                    value: row.get("value"),
                })
                .collect();
            Json(serde_json::json!({ "regions": regions })).into_response()
        }
        Err(e) => internal_error(e),
    }
}

async fn absenteeism_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AbsenteeismQuery>,
) -> impl IntoResponse {
    let limit = params.limit.unwrap_or(500).clamp(1, 10_000);
    let mut query = String::from(
        "SELECT period, territorial_scope, region_name, activity_level,
                activity_name, shift_type, hours_pacted, hours_absence, rate_absenteeism
         FROM v_rate_absenteeism WHERE 1=1",
    );
    let mut bindings: Vec<String> = Vec::new();
    for (column, value) in [("period", &params.period), ("territorial_scope", &params.scope)] {
        if let Some(value) = value {
            query.push_str(&format!(" AND {column} = ?"));
            bindings.push(value.clone());
        }
    }
    query.push_str(" ORDER BY period DESC, territorial_scope, region_name LIMIT ?");

    let mut q = sqlx::query(&query);
    for value in &bindings {
        q = q.bind(value);
    }
    q = q.bind(limit);

    match q.fetch_all(&state.pool).await {
        Ok(rows) => {
            let rates: Vec<AbsenteeismRow> = rows
                .iter()
                .map(|row| AbsenteeismRow {
                    period: row.get("period"),
                    territorial_scope: row.get("territorial_scope"),
                    region_name: row.get("region_name"),
                    activity_level: row.get("activity_level"),
                    activity_name: row.get("activity_name"),
                    shift_type: row.get("shift_type"),
                    hours_pacted: row.get("hours_pacted"),
                    hours_absence: row.get("hours_absence"),
                    rate_absenteeism: row.get("rate_absenteeism"),
                })
                .collect();
            Json(serde_json::json!({ "absenteeism": rates })).into_response()
        }
        Err(e) => internal_error(e),
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let db_path = PathBuf::from(
        std::env::var("ETCL_DB_PATH").unwrap_or_else(|_| "data/analysis.db".to_string()),
    );
    let bind = std::env::var("API_BIND").unwrap_or_else(|_| "127.0.0.1:8080".to_string());

    println!("=== ETCL API ===");
    println!("Store: {}", db_path.display());

    let options = SqliteConnectOptions::new().filename(&db_path).read_only(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("opening analytical store {}", db_path.display()))?;

    let state = Arc::new(AppState { pool });

    // CORS for the dashboards.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/coverage", get(coverage_handler))
        .route("/facts", get(facts_handler))
        .route("/series/national", get(series_handler))
        .route("/regions", get(regions_handler))
        .route("/absenteeism", get(absenteeism_handler))
        .layer(cors)
        .with_state(state);

    println!("API listening on http://{bind}");
    println!("\nEndpoints:");
    println!("  GET /health");
    println!("  GET /coverage");
    println!("  GET /facts?period=&metric=&cause=&scope=&region_code=&activity_level=&activity_code=&shift_type=&source_table=&limit=");
    println!("  GET /series/national?metric=&cause=&period=");
    println!("  GET /regions?period=&metric=");
    println!("  GET /absenteeism?period=&scope=&limit=");

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
