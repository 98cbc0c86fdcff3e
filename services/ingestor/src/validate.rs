//! Structural and business invariants checked on the transformed fact set
//! before it is allowed to reach the analytical store.
//!
//! The data-quality pass only ever warns; the business pass produces
//! errors that abort the load.

use std::collections::HashMap;

use crate::model::{Cause, FactRow, Metric};

#[derive(Debug, Default)]
pub struct ValidationReport {
    pub passed: bool,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

/// Structural checks: non-empty set, sane values, key uniqueness, period
/// date consistency, scope/activity coherence.
pub fn data_quality(facts: &[FactRow]) -> ValidationReport {
    let mut warnings = Vec::new();

    if facts.is_empty() {
        warnings.push("fact set is empty".to_string());
    }

    // Uniqueness is checked within each source table: the national
    // aggregates of overlapping tables legitimately share a key tuple.
    let mut counts: HashMap<String, usize> = HashMap::new();
    for fact in facts {
        *counts.entry(format!("{}|{}", fact.source_table, fact.key())).or_insert(0) += 1;
    }
    let duplicate_keys = counts.values().filter(|&&n| n > 1).count();
    if duplicate_keys > 0 {
        warnings.push(format!("{duplicate_keys} primary keys appear more than once"));
    }

    for fact in facts {
        if !fact.value.is_finite() || fact.value < 0.0 {
            warnings.push(format!("negative or non-finite value {} at {}", fact.value, fact.key()));
        }
        if ((fact.value * 1000.0).round() / 1000.0 - fact.value).abs() > f64::EPSILON * 1000.0 {
            warnings.push(format!("value {} has more than three decimals at {}", fact.value, fact.key()));
        }
        if fact.period_start > fact.period_end
            || fact.period_start != fact.period.start_date()
            || fact.period_end != fact.period.end_date()
        {
            warnings.push(format!("period dates inconsistent with literal at {}", fact.key()));
        }
        if (fact.region_code.is_some()) != (fact.scope == crate::model::Scope::Ccaa) {
            warnings.push(format!("region code does not match territorial scope at {}", fact.key()));
        }
        if (fact.activity_code.is_none()) != (fact.activity_level == crate::model::ActivityLevel::Total) {
            warnings.push(format!("activity code does not match activity level at {}", fact.key()));
        }
        if fact.unit.is_empty() {
            warnings.push(format!("empty unit at {}", fact.key()));
        }
    }

    ValidationReport {
        passed: warnings.is_empty(),
        warnings,
        errors: Vec::new(),
    }
}

/// Business rules: causes belong to hours-not-worked only, and within any
/// dimension group the cause-specific hours must not exceed the reported
/// total beyond the configured tolerance.
pub fn business(facts: &[FactRow], cause_sum_tolerance: f64) -> ValidationReport {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    for fact in facts {
        if fact.cause.is_some() && fact.metric != Metric::HoursNotWorked {
            errors.push(format!(
                "cause {} attached to metric {} at {}",
                fact.cause.map(|c| c.as_str()).unwrap_or(""),
                fact.metric.as_str(),
                fact.key()
            ));
        }
        if fact.shift_type.is_none() && fact.grain_role.ends_with("_SHIFT") {
            errors.push(format!("grain role claims a shift dimension at {}", fact.key()));
        }
    }

    // Group hours-not-worked rows by their dimension tuple.
    #[derive(Default)]
    struct Group {
        total: Option<f64>,
        cause_sum: f64,
        has_combined_vacations: bool,
    }
    let mut groups: HashMap<String, Group> = HashMap::new();
    for fact in facts {
        if fact.metric != Metric::HoursNotWorked {
            continue;
        }
        let group_key = format!(
            "{}|{}|{}|{}|{}|{}|{}",
            fact.source_table,
            fact.period,
            fact.scope.as_str(),
            fact.region_code.as_deref().unwrap_or(""),
            fact.activity_level.as_str(),
            fact.activity_code.as_deref().unwrap_or(""),
            fact.shift_type.map(|s| s.as_str()).unwrap_or(""),
        );
        let group = groups.entry(group_key).or_default();
        match fact.cause {
            None => group.total = Some(fact.value),
            Some(Cause::VacationsAndHolidays) => group.has_combined_vacations = true,
            Some(_) => group.cause_sum += fact.value,
        }
    }
    for (key, group) in &groups {
        let Some(total) = group.total else { continue };
        // The combined vacations row overlaps its two components, so groups
        // carrying it are only sanity-checked loosely.
        if group.has_combined_vacations {
            continue;
        }
        if group.cause_sum > total + cause_sum_tolerance {
            errors.push(format!(
                "cause-specific hours {:.3} exceed the not-worked total {:.3} (tolerance {:.3}) in group {}",
                group.cause_sum, total, cause_sum_tolerance, key
            ));
        }
    }

    if groups.values().any(|g| g.total.is_none() && g.cause_sum > 0.0) {
        warnings.push("some groups report cause detail without a not-worked total".to_string());
    }

    ValidationReport {
        passed: errors.is_empty(),
        warnings,
        errors,
    }
}
