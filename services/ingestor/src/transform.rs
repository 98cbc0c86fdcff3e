//! Normalisation of extracted tables into canonical fact rows: shape
//! pivoting, dimension mapping, period derivation, scaling and key
//! deduplication. Step order is fixed and observable.

use std::collections::{BTreeSet, HashSet};

use chrono::Utc;
use tracing::debug;

use crate::catalogue::{Mappings, TableDescriptor, ValidationConfig};
use crate::error::{PipelineError, Result};
use crate::extract::{normalize, Cell, ColumnRole, RawTable};
use crate::model::{
    ActivityLevel, Cause, FactRow, Metric, Scope, ShiftType, UNIT_HOURS_PER_WORKER,
};
use crate::period::Period;

pub struct Transformer<'a> {
    mappings: &'a Mappings,
    validation: &'a ValidationConfig,
}

#[derive(Debug, Default)]
pub struct TransformStats {
    pub rows_in: usize,
    pub facts_out: usize,
    pub dropped_missing_value: usize,
    pub dropped_unmapped_metric: usize,
    pub dropped_unmapped_region: usize,
    pub duplicates_removed: usize,
    pub unknown_parents: usize,
    pub warnings: Vec<String>,
}

#[derive(Debug)]
pub struct TransformOutput {
    pub facts: Vec<FactRow>,
    pub stats: TransformStats,
}

/// One row after shape normalisation: dimension cells plus a metric label
/// and its value.
struct LongRow<'r> {
    cells: &'r [Cell],
    label: String,
    value: Option<f64>,
}

impl<'a> Transformer<'a> {
    pub fn new(mappings: &'a Mappings, validation: &'a ValidationConfig) -> Self {
        Self { mappings, validation }
    }

    pub fn transform(&self, table: &TableDescriptor, raw: &RawTable) -> Result<TransformOutput> {
        let mut stats = TransformStats::default();
        let mut unmapped_metric_labels: BTreeSet<String> = BTreeSet::new();
        let mut unmapped_region_labels: BTreeSet<String> = BTreeSet::new();
        let mut unmapped_activity_labels: BTreeSet<String> = BTreeSet::new();
        let loaded_at = Utc::now();

        let period_col = raw
            .dimension_matching(&["periodo", "period"])
            .ok_or_else(|| {
                PipelineError::UnrecognisedStructure(format!(
                    "table {}: no period column",
                    table.code
                ))
            })?;
        let unit_col = raw.column(ColumnRole::Unit);
        let region_col = if table.profile.regional {
            raw.dimension_matching(&["comunidad", "region"])
        } else {
            None
        };
        let activity_col = raw.dimension_matching(&["sector", "seccion", "division", "actividad"]);
        let shift_col = if table.profile.has_shift {
            raw.dimension_matching(&["jornada", "shift"])
        } else {
            None
        };

        // (a) Shape normalisation: long stays long, wide is pivoted so every
        // numeric column becomes a synthesised metric label.
        let long_rows = self.to_long(table, raw)?;
        stats.rows_in = long_rows.len();

        let mut max_period: Option<Period> = None;
        let mut facts: Vec<FactRow> = Vec::with_capacity(long_rows.len());

        for long in &long_rows {
            // (b) Period derivation.
            let period_literal = long.cells.get(period_col).and_then(Cell::as_text);
            let period: Period = period_literal
                .ok_or_else(|| PipelineError::BadPeriod(format!("table {}: missing period cell", table.code)))?
                .parse()?;

            // (f) Metric and cause mapping; unresolved labels drop the row.
            let Some((metric, mut cause)) = self.map_metric(&long.label) else {
                stats.dropped_unmapped_metric += 1;
                unmapped_metric_labels.insert(long.label.clone());
                continue;
            };
            if cause.is_some() && metric != Metric::HoursNotWorked {
                stats
                    .warnings
                    .push(format!("cause mapping ignored for non-hours_not_worked label {:?}", long.label));
                cause = None;
            }

            // (i) Scale and rounding; non-numeric rows are dropped.
            let Some(raw_value) = long.value else {
                stats.dropped_missing_value += 1;
                continue;
            };
            let value = round3(raw_value / 10.0);

            // (c) Territorial mapping.
            let (scope, region_code, region_name, region_unmapped) = match region_col {
                None => (Scope::Nac, None, None, false),
                Some(col) => {
                    let label = long.cells.get(col).and_then(Cell::as_text).unwrap_or("");
                    self.map_region(label)
                }
            };

            // (d) Activity mapping and hierarchy path.
            let (level, activity_code, activity_name, activity_unmapped) = match activity_col {
                None => (ActivityLevel::Total, None, None, false),
                Some(col) => {
                    let label = long.cells.get(col).and_then(Cell::as_text).unwrap_or("");
                    self.map_activity(label, table.profile.activity_level_default)
                }
            };
            if activity_unmapped {
                if let Some(col) = activity_col {
                    if let Some(label) = long.cells.get(col).and_then(Cell::as_text) {
                        unmapped_activity_labels.insert(label.to_string());
                    }
                }
            }
            let (activity_path, parent_unknown) = build_activity_path(level, activity_code.as_deref());
            if parent_unknown {
                stats.unknown_parents += 1;
            }

            // An unknown region keeps the row only at total activity level.
            if region_unmapped {
                if let Some(col) = region_col {
                    if let Some(label) = long.cells.get(col).and_then(Cell::as_text) {
                        unmapped_region_labels.insert(label.to_string());
                    }
                }
                if level != ActivityLevel::Total {
                    stats.dropped_unmapped_region += 1;
                    continue;
                }
            }

            // (e) Shift mapping.
            let shift_type = if !table.profile.has_shift {
                None
            } else {
                match shift_col {
                    None => Some(ShiftType::Total),
                    Some(col) => {
                        let label = long.cells.get(col).and_then(Cell::as_text).unwrap_or("");
                        Some(self.map_shift(label, &mut stats))
                    }
                }
            };

            // (g) Derived flags and grain role.
            let is_total_region = scope == Scope::Nac;
            let is_total_activity = level == ActivityLevel::Total;
            let is_total_shift = matches!(shift_type, None | Some(ShiftType::Total));
            let grain_role = grain_role(scope, level, shift_type);

            let unit = unit_col
                .and_then(|col| long.cells.get(col).and_then(Cell::as_text))
                .map(str::to_string)
                .unwrap_or_else(|| UNIT_HOURS_PER_WORKER.to_string());

            max_period = Some(max_period.map_or(period, |m| m.max(period)));

            facts.push(FactRow {
                period,
                period_start: period.start_date(),
                period_end: period.end_date(),
                scope,
                region_code,
                region_name,
                activity_level: level,
                activity_code,
                activity_name,
                activity_path,
                shift_type,
                metric,
                cause,
                value,
                unit,
                source_table: table.code.clone(),
                is_total_region,
                is_total_activity,
                is_total_shift,
                grain_role,
                // (h) data_version is fixed up below once the max is known.
                data_version: period,
                loaded_at,
            });
        }

        // (h) Metadata: data_version is the table's newest period.
        if let Some(version) = max_period {
            for fact in &mut facts {
                fact.data_version = version;
            }
        }

        // (j) Key deduplication, first occurrence wins.
        let mut seen: HashSet<String> = HashSet::with_capacity(facts.len());
        facts.retain(|fact| {
            let fresh = seen.insert(fact.key());
            if !fresh {
                stats.duplicates_removed += 1;
            }
            fresh
        });

        stats.facts_out = facts.len();
        for label in &unmapped_metric_labels {
            stats.warnings.push(format!("unmapped metric label dropped: {label:?}"));
        }
        for label in &unmapped_region_labels {
            stats.warnings.push(format!("unmapped region label: {label:?}"));
        }
        for label in &unmapped_activity_labels {
            stats.warnings.push(format!("unmapped activity label kept as UNKNOWN: {label:?}"));
        }
        if stats.duplicates_removed > 0 {
            stats
                .warnings
                .push(format!("{} duplicate key rows removed", stats.duplicates_removed));
        }

        let unmapped = stats.dropped_unmapped_metric + stats.dropped_unmapped_region;
        if stats.rows_in > 0 {
            let proportion = unmapped as f64 / stats.rows_in as f64;
            if proportion > self.validation.unmapped_row_threshold {
                return Err(PipelineError::UnmappedDimension(format!(
                    "table {}: {:.1}% of rows unmapped (threshold {:.1}%)",
                    table.code,
                    proportion * 100.0,
                    self.validation.unmapped_row_threshold * 100.0
                )));
            }
        }

        debug!(
            table = %table.code,
            rows_in = stats.rows_in,
            facts_out = stats.facts_out,
            "table transformed"
        );
        Ok(TransformOutput { facts, stats })
    }

    fn to_long<'r>(&self, table: &TableDescriptor, raw: &'r RawTable) -> Result<Vec<LongRow<'r>>> {
        let value_cols = raw.columns(ColumnRole::Value);
        if value_cols.is_empty() {
            return Err(PipelineError::NoValueColumn(table.code.clone()));
        }

        match raw.column(ColumnRole::MetricSelector) {
            Some(metric_col) => {
                // Already long. The value column is usually literally `Total`.
                let value_col = value_cols
                    .iter()
                    .copied()
                    .find(|&c| normalize(&raw.headers[c]) == "total")
                    .unwrap_or(value_cols[0]);
                Ok(raw
                    .rows
                    .iter()
                    .filter_map(|row| {
                        let label = row.get(metric_col)?.as_text()?.to_string();
                        Some(LongRow {
                            cells: row,
                            label,
                            value: row.get(value_col).and_then(Cell::as_number),
                        })
                    })
                    .collect())
            }
            None => {
                // Wide: pivot every numeric column into a synthesised label.
                let mut out = Vec::with_capacity(raw.rows.len() * value_cols.len());
                for row in &raw.rows {
                    for &col in &value_cols {
                        out.push(LongRow {
                            cells: row,
                            label: raw.headers[col].clone(),
                            value: row.get(col).and_then(Cell::as_number),
                        });
                    }
                }
                Ok(out)
            }
        }
    }

    fn map_metric(&self, label: &str) -> Option<(Metric, Option<Cause>)> {
        if let Some(target) = self.mappings.metric_labels.get(label.trim()) {
            return Some((target.metric, target.cause));
        }
        heuristic_metric(&normalize(label)).map(|metric| (metric, None))
    }

    fn map_region(&self, label: &str) -> (Scope, Option<String>, Option<String>, bool) {
        if let Some(target) = self.mappings.regions.get(label.trim()) {
            return match &target.code {
                Some(code) => (
                    Scope::Ccaa,
                    Some(code.clone()),
                    target.name.clone().or_else(|| Some(label.trim().to_string())),
                    false,
                ),
                None => (Scope::Nac, None, None, false),
            };
        }
        let normalized = normalize(label);
        if normalized.contains("total") || normalized.contains("nacional") {
            return (Scope::Nac, None, None, false);
        }
        // Labels arrive as "NN Name"; fall back to splitting the code off.
        let trimmed = label.trim();
        if trimmed.len() > 3 && trimmed.as_bytes()[..2].iter().all(u8::is_ascii_digit) {
            if let Some(rest) = trimmed.get(2..) {
                if rest.starts_with(' ') {
                    return (
                        Scope::Ccaa,
                        Some(trimmed[..2].to_string()),
                        Some(rest.trim().to_string()),
                        false,
                    );
                }
            }
        }
        (Scope::Nac, None, None, true)
    }

    fn map_activity(
        &self,
        label: &str,
        default_level: ActivityLevel,
    ) -> (ActivityLevel, Option<String>, Option<String>, bool) {
        let trimmed = label.trim();
        if let Some(target) = self.mappings.sectors.get(trimmed) {
            return match &target.code {
                Some(code) => (target.level, Some(code.clone()), Some(trimmed.to_string()), false),
                None => (ActivityLevel::Total, None, None, false),
            };
        }
        let normalized = normalize(trimmed);
        if normalized.starts_with("b_s") || normalized == "total" {
            return (ActivityLevel::Total, None, None, false);
        }

        match default_level {
            ActivityLevel::Section => {
                let mut chars = trimmed.chars();
                let first = chars.next();
                let second = chars.next();
                if let Some(letter) = first {
                    if letter.is_ascii_uppercase()
                        && ('B'..='S').contains(&letter)
                        && second.map_or(true, |c| c == ' ')
                    {
                        return (
                            ActivityLevel::Section,
                            Some(letter.to_string()),
                            Some(trimmed.to_string()),
                            false,
                        );
                    }
                }
            }
            ActivityLevel::Division => {
                if trimmed.len() >= 2 && trimmed.as_bytes()[..2].iter().all(u8::is_ascii_digit) {
                    return (
                        ActivityLevel::Division,
                        Some(trimmed[..2].to_string()),
                        Some(trimmed.to_string()),
                        false,
                    );
                }
            }
            _ => {}
        }

        // Unknown label: keep the row at the table's default level with an
        // explicit UNKNOWN code so the hierarchy invariants still hold.
        (default_level, Some("UNKNOWN".to_string()), Some(trimmed.to_string()), true)
    }

    fn map_shift(&self, label: &str, stats: &mut TransformStats) -> ShiftType {
        if let Some(shift) = self.mappings.shifts.get(label.trim()) {
            return *shift;
        }
        let normalized = normalize(label);
        if normalized.contains("ambas") || normalized.contains("total") {
            ShiftType::Total
        } else if normalized.contains("complet") {
            ShiftType::Full
        } else if normalized.contains("parcial") {
            ShiftType::Partial
        } else {
            stats.warnings.push(format!("unmapped shift label {label:?} treated as total"));
            ShiftType::Total
        }
    }
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

fn heuristic_metric(normalized_label: &str) -> Option<Metric> {
    if normalized_label.contains("no trabajad") {
        Some(Metric::HoursNotWorked)
    } else if normalized_label.contains("pactad") {
        Some(Metric::HoursPacted)
    } else if normalized_label.contains("pagad") {
        Some(Metric::HoursPaid)
    } else if normalized_label.contains("efectiv") {
        Some(Metric::HoursEffective)
    } else if normalized_label.contains("extraordinar") || normalized_label.contains("extra") {
        Some(Metric::HoursExtraordinary)
    } else {
        None
    }
}

fn grain_role(scope: Scope, level: ActivityLevel, shift: Option<ShiftType>) -> String {
    let mut parts = vec![scope.as_str(), level.as_str()];
    if shift.is_some() {
        parts.push("SHIFT");
    }
    parts.join("_")
}

/// Materialised hierarchy label; the second element reports an unknown
/// division parent.
fn build_activity_path(level: ActivityLevel, code: Option<&str>) -> (String, bool) {
    match level {
        ActivityLevel::Total => ("Total".to_string(), false),
        ActivityLevel::SectorBs => {
            (format!("Total > Sector {}", code.unwrap_or("UNKNOWN")), false)
        }
        ActivityLevel::Section => {
            (format!("Total > Section {}", code.unwrap_or("UNKNOWN")), false)
        }
        ActivityLevel::Division => {
            let code = code.unwrap_or("UNKNOWN");
            let parent = section_for_division(code);
            (
                format!("Total > Section {} > Division {}", parent.unwrap_or("UNKNOWN"), code),
                parent.is_none(),
            )
        }
    }
}

/// Fixed division-to-section lookup for the activity hierarchy (CNAE-2009,
/// sections B through S).
fn section_for_division(code: &str) -> Option<&'static str> {
    let number: u32 = code.parse().ok()?;
    let section = match number {
        5..=9 => "B",
        10..=33 => "C",
        35 => "D",
        36..=39 => "E",
        41..=43 => "F",
        45..=47 => "G",
        49..=53 => "H",
        55..=56 => "I",
        58..=63 => "J",
        64..=66 => "K",
        68 => "L",
        69..=75 => "M",
        77..=82 => "N",
        84 => "O",
        85 => "P",
        86..=88 => "Q",
        90..=93 => "R",
        94..=96 => "S",
        _ => return None,
    };
    Some(section)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalogue::{AppConfig, TableDescriptor, TableProfile};
    use crate::extract::parse_table;

    fn config() -> AppConfig {
        let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../config/tables.json");
        AppConfig::load(&path).unwrap()
    }

    fn descriptor(code: &str, level: ActivityLevel, has_shift: bool, regional: bool) -> TableDescriptor {
        TableDescriptor {
            code: code.to_string(),
            name: format!("table {code}"),
            category: "tiempo_trabajo".to_string(),
            url_csv: String::new(),
            url_json: String::new(),
            profile: TableProfile {
                activity_level_default: level,
                has_shift,
                regional,
            },
        }
    }

    fn transform_with_threshold(
        descriptor: &TableDescriptor,
        csv: &str,
        unmapped_row_threshold: f64,
    ) -> crate::error::Result<TransformOutput> {
        let config = config();
        let validation = ValidationConfig {
            unmapped_row_threshold,
            ..config.validation
        };
        let raw = parse_table(&descriptor.code, csv).unwrap();
        Transformer::new(&config.mappings, &validation).transform(descriptor, &raw)
    }

    // Small fixtures drop a large share of rows on purpose, so tests use a
    // permissive threshold unless the threshold itself is under test.
    fn transform(
        descriptor: &TableDescriptor,
        csv: &str,
    ) -> crate::error::Result<TransformOutput> {
        transform_with_threshold(descriptor, csv, 0.9)
    }

    #[test]
    fn sector_table_round_trip() {
        let csv = "Tipo de jornada;Sectores de actividad CNAE 2009;Tiempo de trabajo;Periodo;Total\n\
            Ambas jornadas;B_S Industria, construcción y servicios (excepto actividades de los hogares como empleadores y de organizaciones y organismos extraterritoriales);Horas pactadas;2024T4;151,4\n\
            Jornada a tiempo completo;Industria;Horas pactadas;2024T4;168,9\n";
        let out = transform(&descriptor("6042", ActivityLevel::SectorBs, true, false), csv).unwrap();
        assert_eq!(out.facts.len(), 2);

        let total = &out.facts[0];
        assert_eq!(total.scope, Scope::Nac);
        assert_eq!(total.activity_level, ActivityLevel::Total);
        assert_eq!(total.activity_code, None);
        assert_eq!(total.activity_path, "Total");
        assert_eq!(total.shift_type, Some(ShiftType::Total));
        assert_eq!(total.metric, Metric::HoursPacted);
        assert_eq!(total.value, 15.14);
        assert_eq!(total.period_start.to_string(), "2024-10-01");
        assert_eq!(total.period_end.to_string(), "2024-12-31");
        assert_eq!(total.grain_role, "NAC_TOTAL_SHIFT");
        assert!(total.is_total_activity && total.is_total_shift && total.is_total_region);

        let industry = &out.facts[1];
        assert_eq!(industry.activity_level, ActivityLevel::SectorBs);
        assert_eq!(industry.activity_code.as_deref(), Some("B-E"));
        assert_eq!(industry.activity_path, "Total > Sector B-E");
        assert_eq!(industry.shift_type, Some(ShiftType::Full));
        assert!(!industry.is_total_shift);
        assert_eq!(industry.value, 16.89);
    }

    #[test]
    fn scale_down_is_exactly_ten_and_three_decimals() {
        let csv = "Sectores de actividad;Tiempo de trabajo;Periodo;Total\n\
            Industria;Horas pactadas;2024T4;151,4\n";
        let out = transform(&descriptor("6044", ActivityLevel::SectorBs, false, false), csv).unwrap();
        assert_eq!(out.facts[0].value, 15.14);
        assert_eq!(round3(1.0 / 3.0), 0.333);
        assert_eq!(round3(15.1404), 15.14);
    }

    #[test]
    fn section_labels_map_to_letters() {
        let csv = "Secciones de actividad;Tiempo de trabajo;Periodo;Total\n\
            G Comercio al por mayor y al por menor;Horas efectivas;2025T1;120,7\n";
        let out = transform(&descriptor("6045", ActivityLevel::Section, false, false), csv).unwrap();
        let fact = &out.facts[0];
        assert_eq!(fact.activity_level, ActivityLevel::Section);
        assert_eq!(fact.activity_code.as_deref(), Some("G"));
        assert_eq!(fact.activity_path, "Total > Section G");
        assert_eq!(fact.shift_type, None);
        assert_eq!(fact.grain_role, "NAC_SECTION");
    }

    #[test]
    fn division_labels_resolve_their_parent_section() {
        let csv = "Divisiones de actividad;Tiempo de trabajo;Periodo;Total\n\
            47 Comercio al por menor;Horas efectivas;2025T1;122,0\n\
            99 Actividades sin sección conocida;Horas efectivas;2025T1;100,0\n";
        let out = transform(&descriptor("6046", ActivityLevel::Division, false, false), csv).unwrap();
        assert_eq!(out.facts[0].activity_path, "Total > Section G > Division 47");
        assert_eq!(out.facts[1].activity_path, "Total > Section UNKNOWN > Division 99");
        assert_eq!(out.stats.unknown_parents, 1);
    }

    #[test]
    fn regional_table_maps_communities() {
        let csv = "Comunidades y Ciudades Autónomas;Tipo de jornada;Sectores de actividad;Tiempo de trabajo;Periodo;Total\n\
            Total Nacional;Ambas jornadas;Total;Horas pactadas;2024T4;151,4\n\
            01 Andalucía;Ambas jornadas;Total;Horas pactadas;2024T4;149,8\n";
        let out = transform(&descriptor("6063", ActivityLevel::SectorBs, true, true), csv).unwrap();

        let national = &out.facts[0];
        assert_eq!(national.scope, Scope::Nac);
        assert_eq!(national.region_code, None);
        assert!(national.is_total_region);

        let andalucia = &out.facts[1];
        assert_eq!(andalucia.scope, Scope::Ccaa);
        assert_eq!(andalucia.region_code.as_deref(), Some("01"));
        assert_eq!(andalucia.region_name.as_deref(), Some("Andalucía"));
        assert_eq!(andalucia.grain_role, "CCAA_TOTAL_SHIFT");
        assert!(!andalucia.is_total_region);
    }

    #[test]
    fn unknown_region_kept_only_at_total_activity() {
        let csv = "Comunidades y Ciudades Autónomas;Sectores de actividad;Tiempo de trabajo;Periodo;Total\n\
            Atlantis;Total;Horas pactadas;2024T4;100,0\n\
            Atlantis;Industria;Horas pactadas;2024T4;110,0\n";
        let out = transform(&descriptor("6063", ActivityLevel::SectorBs, false, true), csv).unwrap();
        assert_eq!(out.facts.len(), 1);
        assert_eq!(out.facts[0].activity_level, ActivityLevel::Total);
        assert_eq!(out.stats.dropped_unmapped_region, 1);
        assert!(out.stats.warnings.iter().any(|w| w.contains("Atlantis")));
    }

    #[test]
    fn cause_labels_attach_only_to_hours_not_worked() {
        let csv = "Sectores de actividad;Tiempo de trabajo;Periodo;Total\n\
            Total;Horas no trabajadas;2024T4;80,0\n\
            Total;Horas no trabajadas por incapacidad temporal;2024T4;40,0\n\
            Total;Horas pactadas;2024T4;1510,0\n";
        let out = transform(&descriptor("6044", ActivityLevel::SectorBs, false, false), csv).unwrap();
        assert_eq!(out.facts[0].cause, None);
        assert_eq!(out.facts[1].cause, Some(Cause::TemporaryIncapacityTotal));
        assert_eq!(out.facts[2].cause, None);
    }

    #[test]
    fn unmapped_metric_label_uses_heuristics_then_drops() {
        let csv = "Sectores de actividad;Tiempo de trabajo;Periodo;Total\n\
            Total;Horas pactadas efectivas acordadas;2024T4;100,0\n\
            Total;Kilos de fruta;2024T4;50,0\n";
        let out = transform(&descriptor("6044", ActivityLevel::SectorBs, false, false), csv).unwrap();
        assert_eq!(out.facts.len(), 1);
        assert_eq!(out.facts[0].metric, Metric::HoursPacted);
        assert_eq!(out.stats.dropped_unmapped_metric, 1);
        assert!(out.stats.warnings.iter().any(|w| w.contains("Kilos de fruta")));
    }

    #[test]
    fn wide_layout_is_pivoted() {
        let csv = "Periodo;Horas pactadas;Horas efectivas\n2024T4;1514;1402\n2024T3;1533;1410\n";
        let out = transform(&descriptor("6044", ActivityLevel::Total, false, false), csv).unwrap();
        assert_eq!(out.facts.len(), 4);
        let metrics: Vec<Metric> = out.facts.iter().map(|f| f.metric).collect();
        assert!(metrics.contains(&Metric::HoursPacted));
        assert!(metrics.contains(&Metric::HoursEffective));
        assert_eq!(out.facts[0].value, 151.4);
    }

    #[test]
    fn duplicate_keys_keep_first_occurrence() {
        let csv = "Sectores de actividad;Tiempo de trabajo;Periodo;Total\n\
            Industria;Horas pactadas;2024T4;151,4\n\
            Industria;Horas pactadas;2024T4;999,9\n";
        let out = transform(&descriptor("6044", ActivityLevel::SectorBs, false, false), csv).unwrap();
        assert_eq!(out.facts.len(), 1);
        assert_eq!(out.facts[0].value, 15.14);
        assert_eq!(out.stats.duplicates_removed, 1);
    }

    #[test]
    fn data_version_is_newest_period_in_table() {
        let csv = "Sectores de actividad;Tiempo de trabajo;Periodo;Total\n\
            Industria;Horas pactadas;2024T3;153,3\n\
            Industria;Horas pactadas;2024T4;151,4\n\
            Industria;Horas pactadas;2023T4;149,7\n";
        let out = transform(&descriptor("6044", ActivityLevel::SectorBs, false, false), csv).unwrap();
        for fact in &out.facts {
            assert_eq!(fact.data_version.to_string(), "2024T4");
        }
    }

    #[test]
    fn missing_values_are_dropped_not_zeroed() {
        let csv = "Sectores de actividad;Tiempo de trabajo;Periodo;Total\n\
            Industria;Horas pactadas;2024T4;..\n\
            Industria;Horas efectivas;2024T4;140,2\n";
        let out = transform(&descriptor("6044", ActivityLevel::SectorBs, false, false), csv).unwrap();
        assert_eq!(out.facts.len(), 1);
        assert_eq!(out.stats.dropped_missing_value, 1);
    }

    #[test]
    fn malformed_period_is_fatal() {
        let csv = "Sectores de actividad;Tiempo de trabajo;Periodo;Total\n\
            Industria;Horas pactadas;2024Q4;151,4\n";
        let err = transform(&descriptor("6044", ActivityLevel::SectorBs, false, false), csv).unwrap_err();
        assert!(matches!(err, PipelineError::BadPeriod(_)));
    }

    #[test]
    fn excessive_unmapped_rows_are_fatal() {
        let csv = "Sectores de actividad;Tiempo de trabajo;Periodo;Total\n\
            Total;Kilos de fruta;2024T4;1,0\n\
            Total;Litros de aceite;2024T4;2,0\n\
            Total;Horas pactadas;2024T4;151,4\n";
        let err = transform_with_threshold(
            &descriptor("6044", ActivityLevel::SectorBs, false, false),
            csv,
            0.05,
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::UnmappedDimension(_)));
    }

    #[test]
    fn table_without_shift_dimension_has_null_shift() {
        let csv = "Sectores de actividad;Tiempo de trabajo;Periodo;Total\n\
            Total;Horas pactadas;2024T4;151,4\n";
        let out = transform(&descriptor("6044", ActivityLevel::SectorBs, false, false), csv).unwrap();
        let fact = &out.facts[0];
        assert_eq!(fact.shift_type, None);
        assert!(fact.is_total_shift);
        assert_eq!(fact.grain_role, "NAC_TOTAL");
    }

    #[test]
    fn division_section_lookup_covers_known_ranges() {
        assert_eq!(section_for_division("05"), Some("B"));
        assert_eq!(section_for_division("33"), Some("C"));
        assert_eq!(section_for_division("47"), Some("G"));
        assert_eq!(section_for_division("96"), Some("S"));
        assert_eq!(section_for_division("34"), None);
        assert_eq!(section_for_division("99"), None);
        assert_eq!(section_for_division("xx"), None);
    }
}
