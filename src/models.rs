//! Core data types shared across the pipeline.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::sequence::SequenceNumber;

/// The monolithic full-history file and its embedded timestamp range.
#[derive(Debug, Clone)]
pub struct HistorySnapshot {
    pub path: PathBuf,
    pub first_timestamp: DateTime<Utc>,
    pub last_timestamp: DateTime<Utc>,
    pub size_bytes: u64,
}

/// One downloaded daily diff, waiting in the run's scratch area.
#[derive(Debug, Clone)]
pub struct DailyChangeset {
    pub day: NaiveDate,
    pub sequence: SequenceNumber,
    pub local_path: PathBuf,
}

/// The three nested administrative levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionLevel {
    State,
    Microregion,
    Municipality,
}

impl RegionLevel {
    pub fn number(&self) -> u8 {
        match self {
            RegionLevel::State => 1,
            RegionLevel::Microregion => 2,
            RegionLevel::Municipality => 3,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            RegionLevel::State => "states",
            RegionLevel::Microregion => "microregions",
            RegionLevel::Municipality => "municipalities",
        }
    }
}

impl fmt::Display for RegionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "level {} ({})", self.number(), self.label())
    }
}

/// A region extracted at one level of the hierarchy.
///
/// `boundary_config` is the osmium extract config that produced the region;
/// `parent_id` is the region it was cut from (none for states).
#[derive(Debug, Clone)]
pub struct AdminRegion {
    pub id: String,
    pub level: RegionLevel,
    pub parent_id: Option<String>,
    pub boundary_config: PathBuf,
    pub path: PathBuf,
}

/// A municipality as listed in the reference data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Municipality {
    pub id: String,
    pub slug: String,
    pub state_id: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// A feature category ("preset") defined by an osmium tag filter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Dataset {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub filter: String,
}

/// Closing instant of a processed day; used for time filtering and commit dates.
pub fn day_end(day: NaiveDate) -> DateTime<Utc> {
    let end = NaiveTime::from_hms_opt(23, 59, 59).unwrap_or_default();
    day.and_time(end).and_utc()
}

/// ISO-8601 rendering used on the osmium command line and in git.
pub fn format_instant(instant: DateTime<Utc>) -> String {
    instant.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_day_end_format() {
        let day = NaiveDate::from_ymd_opt(2023, 5, 17).unwrap();
        assert_eq!(format_instant(day_end(day)), "2023-05-17T23:59:59Z");
    }

    #[test]
    fn test_municipality_camel_case() {
        let m: Municipality = serde_json::from_str(
            r#"{"id":"3550308","slug":"sao-paulo","stateId":"SP","name":"São Paulo"}"#,
        )
        .unwrap();
        assert_eq!(m.state_id, "SP");
        assert_eq!(m.name.as_deref(), Some("São Paulo"));
    }
}
