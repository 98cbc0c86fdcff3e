//! Canonical fact model: closed dimension enums and the long-format row
//! loaded into the analytical store.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::period::Period;

/// Default unit for the working-time tables.
pub const UNIT_HOURS_PER_WORKER: &str = "hours/month per worker";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    #[serde(rename = "NAC")]
    Nac,
    #[serde(rename = "CCAA")]
    Ccaa,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Nac => "NAC",
            Scope::Ccaa => "CCAA",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivityLevel {
    Total,
    SectorBs,
    Section,
    Division,
}

impl ActivityLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityLevel::Total => "TOTAL",
            ActivityLevel::SectorBs => "SECTOR_BS",
            ActivityLevel::Section => "SECTION",
            ActivityLevel::Division => "DIVISION",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShiftType {
    Total,
    Full,
    Partial,
}

impl ShiftType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShiftType::Total => "TOTAL",
            ShiftType::Full => "FULL",
            ShiftType::Partial => "PARTIAL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    HoursPacted,
    HoursPaid,
    HoursEffective,
    HoursExtraordinary,
    HoursNotWorked,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::HoursPacted => "hours_pacted",
            Metric::HoursPaid => "hours_paid",
            Metric::HoursEffective => "hours_effective",
            Metric::HoursExtraordinary => "hours_extraordinary",
            Metric::HoursNotWorked => "hours_not_worked",
        }
    }
}

/// Reasons hours were not worked. Only meaningful with
/// [`Metric::HoursNotWorked`]; the null cause is that metric's total row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cause {
    Vacations,
    PublicHolidays,
    VacationsAndHolidays,
    TemporaryIncapacityTotal,
    MaternityPaternity,
    PaidLeave,
    OvertimeCompensation,
    OtherPaid,
    WorkplaceLosses,
    TechnicalEconomicReasons,
    LabourConflict,
    UnionRepresentation,
    Other,
    OtherUnpaid,
}

impl Cause {
    pub fn as_str(&self) -> &'static str {
        match self {
            Cause::Vacations => "vacations",
            Cause::PublicHolidays => "public_holidays",
            Cause::VacationsAndHolidays => "vacations_and_holidays",
            Cause::TemporaryIncapacityTotal => "temporary_incapacity_total",
            Cause::MaternityPaternity => "maternity_paternity",
            Cause::PaidLeave => "paid_leave",
            Cause::OvertimeCompensation => "overtime_compensation",
            Cause::OtherPaid => "other_paid",
            Cause::WorkplaceLosses => "workplace_losses",
            Cause::TechnicalEconomicReasons => "technical_economic_reasons",
            Cause::LabourConflict => "labour_conflict",
            Cause::UnionRepresentation => "union_representation",
            Cause::Other => "other",
            Cause::OtherUnpaid => "other_unpaid",
        }
    }
}

/// One canonical observation: one value of one metric for one quarter,
/// territorial scope, activity level and shift type.
#[derive(Debug, Clone, PartialEq)]
pub struct FactRow {
    pub period: Period,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub scope: Scope,
    pub region_code: Option<String>,
    pub region_name: Option<String>,
    pub activity_level: ActivityLevel,
    pub activity_code: Option<String>,
    pub activity_name: Option<String>,
    pub activity_path: String,
    pub shift_type: Option<ShiftType>,
    pub metric: Metric,
    pub cause: Option<Cause>,
    pub value: f64,
    pub unit: String,
    pub source_table: String,
    pub is_total_region: bool,
    pub is_total_activity: bool,
    pub is_total_shift: bool,
    pub grain_role: String,
    pub data_version: Period,
    pub loaded_at: DateTime<Utc>,
}

impl FactRow {
    /// Primary-key tuple. Empty string stands in for "not applicable";
    /// the store reinstates NULL for those parts.
    pub fn key(&self) -> String {
        [
            self.period.to_string(),
            self.scope.as_str().to_string(),
            self.region_code.clone().unwrap_or_default(),
            self.activity_level.as_str().to_string(),
            self.activity_code.clone().unwrap_or_default(),
            self.shift_type.map(|s| s.as_str().to_string()).unwrap_or_default(),
            self.metric.as_str().to_string(),
            self.cause.map(|c| c.as_str().to_string()).unwrap_or_default(),
        ]
        .join("|")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum_strings_match_serde_names() {
        assert_eq!(serde_json::to_string(&ActivityLevel::SectorBs).unwrap(), "\"SECTOR_BS\"");
        assert_eq!(serde_json::to_string(&Metric::HoursNotWorked).unwrap(), "\"hours_not_worked\"");
        assert_eq!(
            serde_json::to_string(&Cause::TemporaryIncapacityTotal).unwrap(),
            "\"temporary_incapacity_total\""
        );
        assert_eq!(serde_json::to_string(&ShiftType::Partial).unwrap(), "\"PARTIAL\"");
        assert_eq!(serde_json::to_string(&Scope::Nac).unwrap(), "\"NAC\"");
    }

    #[test]
    fn key_uses_empty_string_for_not_applicable() {
        let period: Period = "2024T4".parse().unwrap();
        let fact = FactRow {
            period,
            period_start: period.start_date(),
            period_end: period.end_date(),
            scope: Scope::Nac,
            region_code: None,
            region_name: None,
            activity_level: ActivityLevel::Total,
            activity_code: None,
            activity_name: None,
            activity_path: "Total".into(),
            shift_type: None,
            metric: Metric::HoursPacted,
            cause: None,
            value: 15.14,
            unit: UNIT_HOURS_PER_WORKER.into(),
            source_table: "6044".into(),
            is_total_region: true,
            is_total_activity: true,
            is_total_shift: true,
            grain_role: "NAC_TOTAL".into(),
            data_version: period,
            loaded_at: Utc::now(),
        };
        assert_eq!(fact.key(), "2024T4|NAC||TOTAL|||hours_pacted|");
    }
}
