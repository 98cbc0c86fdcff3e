//! Quarterly periods in the authority's `YYYYTq` notation.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::PipelineError;

/// A calendar quarter, e.g. `2024T4`. Ordering is year-then-quarter, which
/// matches the lexicographic order of the normalised literal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Period {
    pub year: i32,
    pub quarter: u8,
}

impl Period {
    pub fn new(year: i32, quarter: u8) -> Option<Self> {
        if (1..=4).contains(&quarter) && (1900..=2999).contains(&year) {
            Some(Self { year, quarter })
        } else {
            None
        }
    }

    /// First day of the first month of the quarter.
    pub fn start_date(&self) -> NaiveDate {
        let month = 3 * (u32::from(self.quarter) - 1) + 1;
        NaiveDate::from_ymd_opt(self.year, month, 1).expect("quarter start is a valid date")
    }

    /// Last day of the third month of the quarter.
    pub fn end_date(&self) -> NaiveDate {
        let month = 3 * u32::from(self.quarter);
        let day = match self.quarter {
            1 | 4 => 31,
            _ => 30,
        };
        NaiveDate::from_ymd_opt(self.year, month, day).expect("quarter end is a valid date")
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}T{}", self.year, self.quarter)
    }
}

impl FromStr for Period {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_matches('"').trim_start_matches('\u{feff}');
        let bad = || PipelineError::BadPeriod(s.to_string());

        let (year_part, quarter_part) = trimmed
            .split_once(['T', 't'])
            .ok_or_else(bad)?;
        if year_part.len() != 4 || quarter_part.len() != 1 {
            return Err(bad());
        }
        let year: i32 = year_part.parse().map_err(|_| bad())?;
        let quarter: u8 = quarter_part.parse().map_err(|_| bad())?;
        Period::new(year, quarter).ok_or_else(bad)
    }
}

impl Serialize for Period {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Period {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_canonical_literal() {
        let p: Period = "2024T4".parse().unwrap();
        assert_eq!(p, Period { year: 2024, quarter: 4 });
        assert_eq!(p.to_string(), "2024T4");
    }

    #[test]
    fn parses_quoted_and_padded_literals() {
        assert_eq!("\"2023T1\"".parse::<Period>().unwrap().quarter, 1);
        assert_eq!(" 2023T2 ".parse::<Period>().unwrap().quarter, 2);
    }

    #[test]
    fn rejects_malformed_literals() {
        for bad in ["2024Q1", "24T1", "2024T5", "2024T0", "2024", "T1", "2024T11"] {
            assert!(bad.parse::<Period>().is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn orders_by_year_then_quarter() {
        let p = |s: &str| s.parse::<Period>().unwrap();
        assert!(p("2024T4") > p("2024T3"));
        assert!(p("2024T1") > p("2023T4"));
        assert_eq!(p("2024T2").max(p("2024T3")), p("2024T3"));
    }

    #[test]
    fn q1_boundaries() {
        let p: Period = "2025T1".parse().unwrap();
        assert_eq!(p.start_date(), NaiveDate::from_ymd_opt(2025, 1, 1).unwrap());
        assert_eq!(p.end_date(), NaiveDate::from_ymd_opt(2025, 3, 31).unwrap());
    }

    #[test]
    fn q4_boundaries() {
        let p: Period = "2024T4".parse().unwrap();
        assert_eq!(p.start_date(), NaiveDate::from_ymd_opt(2024, 10, 1).unwrap());
        assert_eq!(p.end_date(), NaiveDate::from_ymd_opt(2024, 12, 31).unwrap());
    }

    #[test]
    fn mid_year_boundaries() {
        let p: Period = "2024T2".parse().unwrap();
        assert_eq!(p.start_date(), NaiveDate::from_ymd_opt(2024, 4, 1).unwrap());
        assert_eq!(p.end_date(), NaiveDate::from_ymd_opt(2024, 6, 30).unwrap());
    }

    #[test]
    fn serde_round_trip() {
        let p: Period = "2024T3".parse().unwrap();
        let json = serde_json::to_string(&p).unwrap();
        assert_eq!(json, "\"2024T3\"");
        let back: Period = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }
}
