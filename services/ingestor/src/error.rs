//! Error taxonomy for the ingest pipeline.
//!
//! Fetch and extract failures are recoverable per table (the orchestrator
//! records them and moves on); validation and load failures abort the run
//! so the analytical store is never left half-updated.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("network error fetching {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("HTTP {status} fetching {url}")]
    Http { url: String, status: u16 },

    #[error("none of the candidate encodings decode the payload of {url}")]
    Decode { url: String },

    #[error("source file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("invalid CSV: {0}")]
    InvalidCsv(String),

    #[error("unrecognised table structure: {0}")]
    UnrecognisedStructure(String),

    #[error("unmapped dimension values exceed the configured threshold: {0}")]
    UnmappedDimension(String),

    #[error("bad period literal: {0:?}")]
    BadPeriod(String),

    #[error("no value column identified in table {0}")]
    NoValueColumn(String),

    #[error("business validation failed: {0}")]
    Business(String),

    #[error("schema error: {0}")]
    Schema(#[source] sqlx::Error),

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("load error: {0}")]
    Load(#[source] sqlx::Error),

    #[error("state store error: {0}")]
    State(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
