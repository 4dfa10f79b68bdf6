//! Pipeline-level internal events.
//!
//! Each struct is one measurable occurrence; emit with
//! `avalanche_core::emit!`. Metrics carry an `entity` label so a full run can
//! be broken down per currency pair.

use avalanche_core::metrics::events::InternalEvent;
use metrics::{counter, gauge, histogram};
use std::time::Duration;
use tracing::trace;

use crate::model::TableStatus;

/// Event emitted when a table's extraction finishes, whatever the outcome.
pub struct TableProcessed {
    pub entity: String,
    pub status: TableStatus,
}

impl InternalEvent for TableProcessed {
    fn emit(self) {
        trace!(entity = %self.entity, status = self.status.as_str(), "Table processed");
        counter!(
            "avalanche_tables_processed_total",
            "entity" => self.entity,
            "status" => self.status.as_str()
        )
        .increment(1);
    }
}

/// Event emitted when a query reports its scan size.
pub struct BytesScanned {
    pub entity: String,
    pub bytes: u64,
}

impl InternalEvent for BytesScanned {
    fn emit(self) {
        trace!(entity = %self.entity, bytes = self.bytes, "Bytes scanned");
        counter!("avalanche_bytes_scanned_total", "entity" => self.entity).increment(self.bytes);
    }
}

/// Event emitted when a fetch (all retry attempts) completes or gives up.
pub struct FetchCompleted {
    pub duration: Duration,
    pub success: bool,
}

impl InternalEvent for FetchCompleted {
    fn emit(self) {
        let status = if self.success { "success" } else { "failed" };
        trace!(
            duration_ms = self.duration.as_millis() as u64,
            status,
            "Fetch completed"
        );
        histogram!("avalanche_fetch_duration_seconds", "status" => status)
            .record(self.duration.as_secs_f64());
    }
}

/// Event emitted when one merge batch has been joined into the accumulator.
pub struct MergeBatchCompleted {
    pub entity: String,
    pub artifacts: usize,
    pub joined: usize,
    pub duration: Duration,
}

impl InternalEvent for MergeBatchCompleted {
    fn emit(self) {
        trace!(
            entity = %self.entity,
            artifacts = self.artifacts,
            joined = self.joined,
            duration_ms = self.duration.as_millis() as u64,
            "Merge batch completed"
        );
        counter!("avalanche_merge_batches_total", "entity" => self.entity.clone()).increment(1);
        counter!("avalanche_merge_joins_total", "entity" => self.entity).increment(self.joined as u64);
        histogram!("avalanche_merge_batch_duration_seconds").record(self.duration.as_secs_f64());
    }
}

/// Event emitted when an entity reaches a terminal state.
pub struct EntityProcessed {
    pub entity: String,
    pub success: bool,
}

impl InternalEvent for EntityProcessed {
    fn emit(self) {
        let status = if self.success { "complete" } else { "failed" };
        trace!(entity = %self.entity, status, "Entity processed");
        counter!("avalanche_entities_processed_total", "status" => status).increment(1);
    }
}

/// Gauge of the run's estimated spend.
pub struct CostEstimate {
    pub usd: f64,
}

impl InternalEvent for CostEstimate {
    fn emit(self) {
        trace!(usd = self.usd, "Cost estimate");
        gauge!("avalanche_cost_usd").set(self.usd);
    }
}

/// Gauge of in-flight table fetches for an entity.
pub struct ActiveFetches {
    pub entity: String,
    pub count: usize,
}

impl InternalEvent for ActiveFetches {
    fn emit(self) {
        gauge!("avalanche_active_fetches", "entity" => self.entity).set(self.count as f64);
    }
}
