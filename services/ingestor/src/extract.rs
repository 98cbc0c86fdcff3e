//! CSV extraction: separator and encoding auto-detection, header
//! classification and numeric cleaning of the authority's dumps.

use std::fs;
use std::path::Path;

use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::fetch::decode_with_candidates;
use crate::period::Period;

const SEPARATOR_CANDIDATES: [char; 3] = [';', ',', '\t'];

/// Tokens the authority uses for missing values.
const MISSING_TOKENS: [&str; 4] = ["..", "...", "n.d.", "N.D."];

const DIMENSION_PATTERNS: [&str; 12] = [
    "periodo", "period", "sector", "seccion", "division", "actividad", "comunidad", "region",
    "jornada", "shift", "tamano", "establecimiento",
];
const METRIC_SELECTOR_PATTERNS: [&str; 4] = ["tiempo de trabajo", "componente", "motivo", "variable"];
const UNIT_PATTERNS: [&str; 3] = ["tipo de dato", "unidad", "medida"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnRole {
    Dimension,
    MetricSelector,
    Unit,
    Value,
    Other,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Text(String),
    Number(f64),
    Missing,
}

impl Cell {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Cell::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Cell::Number(n) => Some(*n),
            _ => None,
        }
    }
}

/// A loaded CSV with every column classified.
#[derive(Debug, Clone)]
pub struct RawTable {
    pub source_table: String,
    pub headers: Vec<String>,
    pub roles: Vec<ColumnRole>,
    pub rows: Vec<Vec<Cell>>,
    pub separator: char,
}

impl RawTable {
    pub fn column(&self, role: ColumnRole) -> Option<usize> {
        self.roles.iter().position(|r| *r == role)
    }

    pub fn columns(&self, role: ColumnRole) -> Vec<usize> {
        self.roles
            .iter()
            .enumerate()
            .filter(|(_, r)| **r == role)
            .map(|(i, _)| i)
            .collect()
    }

    /// First dimension column whose normalised header matches any pattern.
    pub fn dimension_matching(&self, patterns: &[&str]) -> Option<usize> {
        (0..self.headers.len()).find(|&i| {
            self.roles[i] == ColumnRole::Dimension && {
                let name = normalize(&self.headers[i]);
                patterns.iter().any(|p| name.contains(p))
            }
        })
    }

    /// Every distinct period literal present, unparsed entries skipped.
    pub fn periods(&self) -> Vec<Period> {
        let Some(col) = self.dimension_matching(&["periodo", "period"]) else {
            return Vec::new();
        };
        let mut out: Vec<Period> = self
            .rows
            .iter()
            .filter_map(|row| row.get(col))
            .filter_map(|cell| cell.as_text())
            .filter_map(|text| text.parse().ok())
            .collect();
        out.sort();
        out.dedup();
        out
    }

    pub fn row_display(&self, index: usize) -> Vec<String> {
        self.rows
            .get(index)
            .map(|row| {
                row.iter()
                    .map(|cell| match cell {
                        Cell::Text(s) => s.clone(),
                        Cell::Number(n) => n.to_string(),
                        Cell::Missing => String::new(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Lowercase and strip the accents that appear in the source headers, so
/// pattern matching is spelling-insensitive.
pub fn normalize(s: &str) -> String {
    s.trim()
        .to_lowercase()
        .chars()
        .map(|c| match c {
            'á' => 'a',
            'é' => 'e',
            'í' => 'i',
            'ó' => 'o',
            'ú' | 'ü' => 'u',
            'ñ' => 'n',
            other => other,
        })
        .collect()
}

pub fn is_missing_token(raw: &str) -> bool {
    let trimmed = raw.trim();
    trimmed.is_empty() || MISSING_TOKENS.contains(&trimmed)
}

/// Authority numeric convention: comma decimal, dot thousands.
pub fn clean_number(raw: &str) -> Option<f64> {
    if is_missing_token(raw) {
        return None;
    }
    let cleaned: String = raw
        .trim()
        .replace('.', "")
        .replace(',', ".")
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    cleaned.parse().ok()
}

/// Pick the separator that yields the most fields on the first line,
/// preferring one whose count is confirmed by the next non-empty line.
pub fn detect_separator(text: &str) -> Result<char> {
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());
    let first = lines
        .next()
        .ok_or_else(|| PipelineError::InvalidCsv("empty document".to_string()))?;
    let second = lines.next();

    let counts: Vec<(char, usize, bool)> = SEPARATOR_CANDIDATES
        .iter()
        .map(|&sep| {
            let first_count = first.matches(sep).count();
            let confirmed = second.map_or(true, |l| l.matches(sep).count() == first_count);
            (sep, first_count, confirmed)
        })
        .collect();

    counts
        .iter()
        .filter(|(_, n, confirmed)| *n > 0 && *confirmed)
        .max_by_key(|(_, n, _)| *n)
        .or_else(|| counts.iter().filter(|(_, n, _)| *n > 0).max_by_key(|(_, n, _)| *n))
        .map(|(sep, _, _)| *sep)
        .ok_or_else(|| PipelineError::InvalidCsv("no field separator detected".to_string()))
}

fn classify_header(name: &str) -> Option<ColumnRole> {
    let normalized = normalize(name);
    if METRIC_SELECTOR_PATTERNS.iter().any(|p| normalized.contains(p)) {
        Some(ColumnRole::MetricSelector)
    } else if UNIT_PATTERNS.iter().any(|p| normalized.contains(p)) {
        Some(ColumnRole::Unit)
    } else if DIMENSION_PATTERNS.iter().any(|p| normalized.contains(p)) {
        Some(ColumnRole::Dimension)
    } else {
        None
    }
}

/// A column is numeric-dominant when at least 70% of a sample of its
/// non-missing cells coerce under the cleaning convention.
fn is_numeric_dominant(records: &[Vec<String>], column: usize) -> bool {
    let sample: Vec<&str> = records
        .iter()
        .filter_map(|r| r.get(column))
        .map(String::as_str)
        .filter(|s| !is_missing_token(s))
        .take(20)
        .collect();
    if sample.is_empty() {
        return false;
    }
    let numeric = sample.iter().filter(|s| clean_number(s).is_some()).count();
    numeric * 10 >= sample.len() * 7
}

/// Parse decoded CSV text into a classified table.
pub fn parse_table(code: &str, text: &str) -> Result<RawTable> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let separator = detect_separator(text)?;

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(separator as u8)
        .flexible(true)
        .from_reader(text.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| PipelineError::InvalidCsv(format!("table {code}: {e}")))?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    let mut records: Vec<Vec<String>> = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| PipelineError::InvalidCsv(format!("table {code}: {e}")))?;
        let mut fields: Vec<String> = record.iter().map(|f| f.trim().to_string()).collect();
        fields.resize(headers.len(), String::new());
        if fields.iter().all(|f| f.is_empty()) {
            continue;
        }
        records.push(fields);
    }
    if records.is_empty() {
        return Err(PipelineError::InvalidCsv(format!("table {code} has no data rows")));
    }

    let mut roles: Vec<ColumnRole> = Vec::with_capacity(headers.len());
    for (i, header) in headers.iter().enumerate() {
        let role = match classify_header(header) {
            Some(role) => role,
            None if is_numeric_dominant(&records, i) => ColumnRole::Value,
            None => ColumnRole::Other,
        };
        roles.push(role);
    }
    if !roles.contains(&ColumnRole::Value) {
        return Err(PipelineError::UnrecognisedStructure(format!(
            "table {code}: no value column among {headers:?}"
        )));
    }

    let rows: Vec<Vec<Cell>> = records
        .into_iter()
        .map(|fields| {
            fields
                .into_iter()
                .enumerate()
                .map(|(i, field)| {
                    if is_missing_token(&field) {
                        Cell::Missing
                    } else if roles[i] == ColumnRole::Value {
                        clean_number(&field).map_or(Cell::Missing, Cell::Number)
                    } else {
                        Cell::Text(field)
                    }
                })
                .collect()
        })
        .collect();

    debug!(
        table = code,
        separator = %separator,
        rows = rows.len(),
        columns = headers.len(),
        "table extracted"
    );
    Ok(RawTable {
        source_table: code.to_string(),
        headers,
        roles,
        rows,
        separator,
    })
}

/// Read a raw file from disk, negotiating the encoding, and parse it.
pub fn load_table(code: &str, path: &Path, encodings: &[String]) -> Result<RawTable> {
    if !path.exists() {
        return Err(PipelineError::FileNotFound(path.to_path_buf()));
    }
    let bytes = fs::read(path)?;
    let (text, _) = decode_with_candidates(&bytes, encodings).ok_or_else(|| PipelineError::Decode {
        url: path.display().to_string(),
    })?;
    parse_table(code, &text)
}
