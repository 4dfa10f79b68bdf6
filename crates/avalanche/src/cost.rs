//! Bytes-scanned accounting and the run's cost budget.
//!
//! Totals are atomic counters so workers can record without coordination.
//! The per-entity map and the scan ledger sit behind a mutex; neither is on
//! a hot path.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::CostConfig;
use crate::error::ExtractError;

/// Bytes in one tebibyte, the unit warehouses price scans in.
pub const TIB: u64 = 1 << 40;

/// One billed query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRecord {
    pub entity: String,
    pub table: String,
    pub bytes: u64,
}

#[derive(Debug, Default)]
struct Ledger {
    by_entity: HashMap<String, u64>,
    records: Vec<ScanRecord>,
}

/// Running totals of bytes scanned and their estimated price.
#[derive(Debug)]
pub struct CostAccountant {
    usd_per_tib: f64,
    budget_usd: Option<f64>,
    total_bytes: AtomicU64,
    queries: AtomicU64,
    ledger: Mutex<Ledger>,
}

impl CostAccountant {
    pub fn new(usd_per_tib: f64, budget_usd: Option<f64>) -> Self {
        Self {
            usd_per_tib,
            budget_usd,
            total_bytes: AtomicU64::new(0),
            queries: AtomicU64::new(0),
            ledger: Mutex::new(Ledger::default()),
        }
    }

    pub fn from_config(config: &CostConfig) -> Self {
        Self::new(config.usd_per_tib, config.max_cost_usd)
    }

    fn ledger(&self) -> std::sync::MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record one query's scan.
    pub fn record(&self, entity: &str, table: &str, bytes: u64) {
        self.total_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.queries.fetch_add(1, Ordering::Relaxed);

        let mut ledger = self.ledger();
        *ledger.by_entity.entry(entity.to_string()).or_default() += bytes;
        ledger.records.push(ScanRecord {
            entity: entity.to_string(),
            table: table.to_string(),
            bytes,
        });
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    /// Queries recorded so far.
    pub fn queries(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }

    pub fn total_cost_usd(&self) -> f64 {
        self.cost_of(self.total_bytes())
    }

    pub fn entity_bytes(&self, entity: &str) -> u64 {
        self.ledger()
            .by_entity
            .get(entity)
            .copied()
            .unwrap_or_default()
    }

    pub fn entity_cost_usd(&self, entity: &str) -> f64 {
        self.cost_of(self.entity_bytes(entity))
    }

    /// Every recorded scan, in recording order.
    pub fn ledger_records(&self) -> Vec<ScanRecord> {
        self.ledger().records.clone()
    }

    /// Price of scanning `bytes`.
    pub fn cost_of(&self, bytes: u64) -> f64 {
        bytes as f64 / TIB as f64 * self.usd_per_tib
    }

    pub fn budget_usd(&self) -> Option<f64> {
        self.budget_usd
    }

    /// Whether the spend has reached the budget. Always false without one.
    pub fn budget_exhausted(&self) -> bool {
        self.budget_usd
            .is_some_and(|budget| self.total_cost_usd() >= budget)
    }

    /// Fail if no further queries may be issued.
    pub fn check_budget(&self) -> Result<(), ExtractError> {
        match self.budget_usd {
            Some(budget_usd) if self.budget_exhausted() => Err(ExtractError::BudgetExhausted {
                spent_usd: self.total_cost_usd(),
                budget_usd,
            }),
            _ => Ok(()),
        }
    }
}
