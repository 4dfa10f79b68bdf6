//! Core data model: entities, source tables and per-table results.

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Inclusive calendar date range. Bounds are interpreted as midnight UTC,
/// matching SQL `BETWEEN` on the time key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    /// Lower bound as microseconds since the Unix epoch.
    pub fn start_micros(&self) -> i64 {
        midnight_micros(self.start)
    }

    /// Upper bound as microseconds since the Unix epoch.
    pub fn end_micros(&self) -> i64 {
        midnight_micros(self.end)
    }
}

fn midnight_micros(date: NaiveDate) -> i64 {
    date.and_time(NaiveTime::MIN).and_utc().timestamp_micros()
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}

/// The unit of end-to-end processing (a currency pair).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    pub code: String,
    pub date_range: DateRange,
}

impl Entity {
    pub fn new(code: impl Into<String>, date_range: DateRange) -> Self {
        Self {
            code: code.into(),
            date_range,
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.code)
    }
}

/// How a source table relates to the entity being processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TableCategory {
    /// Mentions only this entity.
    EntitySpecific,
    /// Mentions this entity and at least one other (or only another).
    CrossEntity,
    /// Mentions no entity of the universe.
    GroupWide,
}

impl TableCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            TableCategory::EntitySpecific => "entity-specific",
            TableCategory::CrossEntity => "cross-entity",
            TableCategory::GroupWide => "group-wide",
        }
    }
}

impl fmt::Display for TableCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A queryable source table, resolved per entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceTable {
    pub name: String,
    pub category: TableCategory,
}

impl SourceTable {
    /// Classify `name` by the entity codes from `universe` it mentions.
    /// Codes are matched against `_`-separated name segments.
    pub fn classify(name: &str, entity: &str, universe: &[String]) -> Self {
        let mut mentions_self = false;
        let mut mentions_other = false;
        for segment in name.split('_') {
            if segment.eq_ignore_ascii_case(entity) {
                mentions_self = true;
            } else if universe.iter().any(|code| segment.eq_ignore_ascii_case(code)) {
                mentions_other = true;
            }
        }

        let category = match (mentions_self, mentions_other) {
            (true, false) => TableCategory::EntitySpecific,
            (_, true) => TableCategory::CrossEntity,
            (false, false) => TableCategory::GroupWide,
        };

        Self {
            name: name.to_string(),
            category,
        }
    }

    /// Prefix token for this table's columns: the table name with the
    /// entity's own code segment removed.
    ///
    /// `reg_eurusd` -> `reg`, `cov_eurusd_gbpusd` -> `cov_gbpusd`.
    pub fn column_prefix(&self, entity: &str) -> String {
        let token: Vec<&str> = self
            .name
            .split('_')
            .filter(|segment| !segment.eq_ignore_ascii_case(entity))
            .collect();
        if token.is_empty() {
            // A table named exactly after the entity.
            self.name.clone()
        } else {
            token.join("_")
        }
    }
}

/// Outcome of extracting one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TableStatus {
    Saved,
    SkipEmpty,
    SkipDuplicateColumns,
    SkipNoColumns,
    Error,
}

impl TableStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TableStatus::Saved => "saved",
            TableStatus::SkipEmpty => "skip-empty",
            TableStatus::SkipDuplicateColumns => "skip-duplicate-columns",
            TableStatus::SkipNoColumns => "skip-no-columns",
            TableStatus::Error => "error",
        }
    }
}

impl fmt::Display for TableStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Report of one table's extraction. The rows themselves go straight to
/// the checkpoint store.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialResult {
    pub table: String,
    pub status: TableStatus,
    pub rows: usize,
    /// Prefixed columns this table has that the target does not.
    pub columns_added: usize,
    pub bytes_scanned: u64,
    pub error: Option<String>,
    pub elapsed: Duration,
}

impl PartialResult {
    pub fn new(table: impl Into<String>, status: TableStatus) -> Self {
        Self {
            table: table.into(),
            status,
            rows: 0,
            columns_added: 0,
            bytes_scanned: 0,
            error: None,
            elapsed: Duration::ZERO,
        }
    }

    pub fn failed(table: impl Into<String>, error: impl fmt::Display) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::new(table, TableStatus::Error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn universe() -> Vec<String> {
        ["eurusd", "gbpusd", "usdjpy"].map(String::from).to_vec()
    }

    #[test]
    fn test_classify_tables() {
        let u = universe();
        assert_eq!(
            SourceTable::classify("reg_eurusd", "eurusd", &u).category,
            TableCategory::EntitySpecific
        );
        assert_eq!(
            SourceTable::classify("cov_eurusd_gbpusd", "eurusd", &u).category,
            TableCategory::CrossEntity
        );
        assert_eq!(
            SourceTable::classify("mkt_vol", "eurusd", &u).category,
            TableCategory::GroupWide
        );
        assert_eq!(
            SourceTable::classify("corr_usdjpy", "eurusd", &u).category,
            TableCategory::CrossEntity
        );
    }

    #[test]
    fn test_column_prefix_drops_entity_segment() {
        let u = universe();
        let prefix = |name: &str| SourceTable::classify(name, "eurusd", &u).column_prefix("eurusd");
        assert_eq!(prefix("reg_eurusd"), "reg");
        assert_eq!(prefix("cov_eurusd_gbpusd"), "cov_gbpusd");
        assert_eq!(prefix("mkt_vol"), "mkt_vol");
        assert_eq!(prefix("eurusd"), "eurusd");
    }

    #[test]
    fn test_date_range_bounds_are_midnight_utc() {
        let range = DateRange::new(
            NaiveDate::from_ymd_opt(1970, 1, 2).unwrap(),
            NaiveDate::from_ymd_opt(1970, 1, 3).unwrap(),
        );
        assert_eq!(range.start_micros(), 86_400_000_000);
        assert_eq!(range.end_micros(), 2 * 86_400_000_000);
        assert_eq!(range.to_string(), "1970-01-02..=1970-01-03");
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(TableStatus::SkipDuplicateColumns.as_str(), "skip-duplicate-columns");
        let json = serde_json::to_string(&TableStatus::SkipNoColumns).unwrap();
        assert_eq!(json, "\"skip-no-columns\"");
    }
}
