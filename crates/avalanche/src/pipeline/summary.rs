//! Run reports: per-entity summaries, dry-run estimates and table counts.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use super::events::EntityState;
use crate::model::{PartialResult, TableCategory, TableStatus};

/// Table outcomes for one entity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableCounts {
    pub saved: usize,
    pub skipped_empty: usize,
    pub skipped_duplicate: usize,
    pub skipped_no_columns: usize,
    pub errored: usize,
    /// Tables skipped because their checkpoint already existed.
    pub cached: usize,
}

impl TableCounts {
    pub fn from_results(results: &[PartialResult], cached: usize) -> Self {
        let mut counts = Self {
            cached,
            ..Self::default()
        };
        for result in results {
            counts.record(result.status);
        }
        counts
    }

    pub fn record(&mut self, status: TableStatus) {
        match status {
            TableStatus::Saved => self.saved += 1,
            TableStatus::SkipEmpty => self.skipped_empty += 1,
            TableStatus::SkipDuplicateColumns => self.skipped_duplicate += 1,
            TableStatus::SkipNoColumns => self.skipped_no_columns += 1,
            TableStatus::Error => self.errored += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.saved
            + self.skipped_empty
            + self.skipped_duplicate
            + self.skipped_no_columns
            + self.errored
            + self.cached
    }
}

impl fmt::Display for TableCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "saved={} empty={} duplicate={} no-columns={} error={} cached={}",
            self.saved,
            self.skipped_empty,
            self.skipped_duplicate,
            self.skipped_no_columns,
            self.errored,
            self.cached
        )
    }
}

/// Outcome of processing one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct EntitySummary {
    pub entity: String,
    pub state: EntityState,
    pub tables: TableCounts,
    /// Per-table results of this run's extraction, sorted by table name.
    pub results: Vec<PartialResult>,
    /// Artifacts the merge did not join: no new columns, no usable time
    /// key, or unreadable.
    pub merge_skipped: usize,
    /// Artifacts that could not be decoded at merge time. They were
    /// quarantined and are left out of the completion manifest.
    pub unreadable: Vec<String>,
    /// Rows in the merged dataset.
    pub rows: usize,
    /// Columns in the merged dataset, time key included.
    pub columns: usize,
    pub bytes_scanned: u64,
    pub cost_usd: f64,
    /// The entity was already complete and nothing was recomputed.
    pub from_marker: bool,
    pub error: Option<String>,
    pub elapsed: Duration,
}

impl EntitySummary {
    pub fn new(entity: impl Into<String>, state: EntityState) -> Self {
        Self {
            entity: entity.into(),
            state,
            tables: TableCounts::default(),
            results: Vec::new(),
            merge_skipped: 0,
            unreadable: Vec::new(),
            rows: 0,
            columns: 0,
            bytes_scanned: 0,
            cost_usd: 0.0,
            from_marker: false,
            error: None,
            elapsed: Duration::ZERO,
        }
    }

    pub fn failed(entity: impl Into<String>, error: impl fmt::Display) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::new(entity, EntityState::EntityFailed)
        }
    }

    pub fn is_failed(&self) -> bool {
        self.state == EntityState::EntityFailed
    }
}

impl fmt::Display for EntitySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<10} {:<14} rows={} columns={} {} merge-skipped={} cost=${:.4} ({:.1}s)",
            self.entity,
            self.state.as_str(),
            self.rows,
            self.columns,
            self.tables,
            self.merge_skipped,
            self.cost_usd,
            self.elapsed.as_secs_f64()
        )?;
        if self.from_marker {
            f.write_str(" [already complete]")?;
        }
        if !self.unreadable.is_empty() {
            write!(f, " unreadable: {}", self.unreadable.join(","))?;
        }
        if let Some(error) = &self.error {
            write!(f, " error: {error}")?;
        }
        Ok(())
    }
}

/// Outcome of a multi-entity run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub entities: Vec<EntitySummary>,
    pub total_bytes: u64,
    pub total_cost_usd: f64,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn has_failures(&self) -> bool {
        self.entities.iter().any(EntitySummary::is_failed)
    }

    pub fn completed(&self) -> usize {
        self.entities
            .iter()
            .filter(|e| e.state == EntityState::Complete)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.entities.iter().filter(|e| e.is_failed()).count()
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entity in &self.entities {
            writeln!(f, "{entity}")?;
        }
        write!(
            f,
            "{} complete, {} failed; scanned {} bytes, estimated cost ${:.4} in {:.1}s",
            self.completed(),
            self.failed(),
            self.total_bytes,
            self.total_cost_usd,
            self.elapsed.as_secs_f64()
        )
    }
}

/// Dry-run estimate for one entity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityEstimate {
    pub entity: String,
    pub complete: bool,
    pub tables: usize,
    pub cached: usize,
    pub pending: usize,
    pub estimated_bytes: u64,
    pub estimated_cost_usd: f64,
    /// Tables whose estimate failed, with the reason.
    pub errors: Vec<(String, String)>,
}

/// What a run would scan, without fetching or writing anything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DryRunReport {
    pub entities: Vec<EntityEstimate>,
}

impl DryRunReport {
    pub fn total_bytes(&self) -> u64 {
        self.entities.iter().map(|e| e.estimated_bytes).sum()
    }

    pub fn total_cost_usd(&self) -> f64 {
        self.entities.iter().map(|e| e.estimated_cost_usd).sum()
    }
}

impl fmt::Display for DryRunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for e in &self.entities {
            if e.complete {
                writeln!(f, "{:<10} already complete", e.entity)?;
                continue;
            }
            writeln!(
                f,
                "{:<10} tables={} cached={} pending={} bytes={} cost=${:.4}",
                e.entity, e.tables, e.cached, e.pending, e.estimated_bytes, e.estimated_cost_usd
            )?;
            for (table, error) in &e.errors {
                writeln!(f, "  {table}: {error}")?;
            }
        }
        write!(
            f,
            "estimated total: {} bytes, ${:.4}",
            self.total_bytes(),
            self.total_cost_usd()
        )
    }
}

/// Tables and columns of one category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CategoryCount {
    pub tables: usize,
    pub columns: usize,
}

/// Table enumeration for one entity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityCount {
    pub entity: String,
    pub by_category: BTreeMap<TableCategory, CategoryCount>,
}

impl EntityCount {
    pub fn tables(&self) -> usize {
        self.by_category.values().map(|c| c.tables).sum()
    }

    pub fn columns(&self) -> usize {
        self.by_category.values().map(|c| c.columns).sum()
    }
}

/// Table and column counts by category, per entity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CountReport {
    pub entities: Vec<EntityCount>,
}

impl fmt::Display for CountReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for e in &self.entities {
            writeln!(
                f,
                "{:<10} tables={} columns={}",
                e.entity,
                e.tables(),
                e.columns()
            )?;
            for (category, count) in &e.by_category {
                writeln!(
                    f,
                    "  {:<16} tables={} columns={}",
                    category.as_str(),
                    count.tables,
                    count.columns
                )?;
            }
        }
        Ok(())
    }
}
