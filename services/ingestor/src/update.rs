//! Update detection: compare the authority's latest available period
//! against the locally recorded state and decide per table whether a
//! refresh is needed.

use serde_json::Value;
use tracing::{debug, warn};

use crate::catalogue::TableDescriptor;
use crate::error::Result;
use crate::extract::{detect_separator, normalize};
use crate::fetch::Fetcher;
use crate::period::Period;
use crate::state::StateStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshDecision {
    MissingLocally,
    NewPeriodAvailable,
    UpToDate,
    RemoteUnavailable,
}

impl RefreshDecision {
    pub fn needs_download(&self) -> bool {
        matches!(self, RefreshDecision::MissingLocally | RefreshDecision::NewPeriodAvailable)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshDecision::MissingLocally => "missing-locally",
            RefreshDecision::NewPeriodAvailable => "new-period-available",
            RefreshDecision::UpToDate => "up-to-date",
            RefreshDecision::RemoteUnavailable => "remote-unavailable",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TableCheck {
    pub code: String,
    pub name: String,
    pub local: Option<Period>,
    pub remote: Option<Period>,
    pub decision: RefreshDecision,
}

/// Never downgrade: a remote period older than the local one still counts
/// as up to date.
pub fn decide(local: Option<Period>, remote: Option<Period>) -> RefreshDecision {
    match (local, remote) {
        (None, _) => RefreshDecision::MissingLocally,
        (Some(_), None) => RefreshDecision::RemoteUnavailable,
        (Some(l), Some(r)) if r > l => RefreshDecision::NewPeriodAvailable,
        _ => RefreshDecision::UpToDate,
    }
}

pub struct UpdateDetector<'a> {
    fetcher: &'a Fetcher,
    state: &'a StateStore,
}

impl<'a> UpdateDetector<'a> {
    pub fn new(fetcher: &'a Fetcher, state: &'a StateStore) -> Self {
        Self { fetcher, state }
    }

    pub async fn check(&self, table: &TableDescriptor) -> Result<TableCheck> {
        let local = self.state.get(&table.code)?.and_then(|s| s.last_period);
        let remote = self.remote_latest(table).await;
        let decision = decide(local, remote);
        debug!(table = %table.code, ?local, ?remote, decision = decision.as_str(), "update check");
        Ok(TableCheck {
            code: table.code.clone(),
            name: table.name.clone(),
            local,
            remote,
            decision,
        })
    }

    /// Latest period the authority reports. The metadata endpoint is
    /// preferred; the CSV head is the fallback.
    pub async fn remote_latest(&self, table: &TableDescriptor) -> Option<Period> {
        match self.fetcher.get_bytes(&table.url_json).await {
            Ok(bytes) => {
                if let Some(period) =
                    serde_json::from_slice::<Value>(&bytes).ok().as_ref().and_then(latest_period_in_json)
                {
                    return Some(period);
                }
                debug!(table = %table.code, "metadata endpoint had no usable period field");
            }
            Err(e) => warn!(table = %table.code, "metadata endpoint unavailable: {e}"),
        }
        match self.fetcher.get(&table.url_csv).await {
            Ok(document) => period_from_csv_head(&document.text),
            Err(e) => {
                warn!(table = %table.code, "csv fallback unavailable: {e}");
                None
            }
        }
    }
}

/// Scan a metadata payload for period fields. The payload is either a
/// sequence of observation records or an object holding one under a key
/// whose name includes `data`.
pub fn latest_period_in_json(value: &Value) -> Option<Period> {
    match value {
        Value::Array(items) => scan_records(items),
        Value::Object(map) => map
            .iter()
            .filter(|(key, _)| key.to_lowercase().contains("data"))
            .filter_map(|(_, v)| v.as_array())
            .filter_map(|items| scan_records(items))
            .max(),
        _ => None,
    }
}

fn scan_records(items: &[Value]) -> Option<Period> {
    let mut latest: Option<Period> = None;
    for item in items {
        let Value::Object(map) = item else { continue };
        for (key, value) in map {
            if !key.to_lowercase().contains("period") {
                continue;
            }
            if let Some(period) = value.as_str().and_then(|s| s.parse::<Period>().ok()) {
                latest = Some(latest.map_or(period, |l| l.max(period)));
            }
        }
    }
    latest
}

/// The authority publishes newest-first: the first data row carries the
/// latest period.
pub fn period_from_csv_head(text: &str) -> Option<Period> {
    let separator = detect_separator(text).ok()?;
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());
    let header = lines.next()?;
    let period_index = header
        .split(separator)
        .position(|field| normalize(field.trim_matches('"')).contains("period"))?;
    let first_data = lines.next()?;
    first_data
        .split(separator)
        .nth(period_index)
        .and_then(|field| field.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> Option<Period> {
        Some(s.parse().unwrap())
    }

    #[test]
    fn decision_table() {
        assert_eq!(decide(None, p("2024T4")), RefreshDecision::MissingLocally);
        assert_eq!(decide(None, None), RefreshDecision::MissingLocally);
        assert_eq!(decide(p("2024T3"), p("2024T4")), RefreshDecision::NewPeriodAvailable);
        assert_eq!(decide(p("2024T4"), p("2024T4")), RefreshDecision::UpToDate);
        // Never downgrade.
        assert_eq!(decide(p("2024T4"), p("2024T3")), RefreshDecision::UpToDate);
        assert_eq!(decide(p("2024T4"), None), RefreshDecision::RemoteUnavailable);
    }

    #[test]
    fn needs_download_only_for_missing_or_new() {
        assert!(RefreshDecision::MissingLocally.needs_download());
        assert!(RefreshDecision::NewPeriodAvailable.needs_download());
        assert!(!RefreshDecision::UpToDate.needs_download());
        assert!(!RefreshDecision::RemoteUnavailable.needs_download());
    }

    #[test]
    fn json_sequence_of_observations() {
        let value: Value = serde_json::json!([
            { "Periodo": "2024T3", "Total": 151.4 },
            { "Periodo": "2024T4", "Total": 153.3 },
            { "Periodo": "2024T2", "Total": 150.8 }
        ]);
        assert_eq!(latest_period_in_json(&value), p("2024T4"));
    }

    #[test]
    fn json_object_with_nested_data_key() {
        let value: Value = serde_json::json!({
            "Nombre": "Tiempo de trabajo",
            "Data": [
                { "Periodo": "2025T1", "Valor": 149.7 },
                { "Periodo": "2024T4", "Valor": 151.4 }
            ]
        });
        assert_eq!(latest_period_in_json(&value), p("2025T1"));
    }

    #[test]
    fn json_without_period_fields() {
        let value: Value = serde_json::json!({ "Nombre": "x", "Data": [{ "Valor": 1.0 }] });
        assert_eq!(latest_period_in_json(&value), None);
        assert_eq!(latest_period_in_json(&serde_json::json!(42)), None);
    }

    #[test]
    fn csv_head_reads_second_line_period() {
        let text = "Tipo de jornada;Tiempo de trabajo;Periodo;Total\n\
                    Ambas jornadas;Horas pactadas;2024T4;151,4\n\
                    Ambas jornadas;Horas pactadas;2024T3;153,3\n";
        assert_eq!(period_from_csv_head(text), p("2024T4"));
    }

    #[test]
    fn csv_head_without_period_column() {
        let text = "Nombre;Total\nalgo;1\n";
        assert_eq!(period_from_csv_head(text), None);
    }
}
