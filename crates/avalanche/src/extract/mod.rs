//! Bounded-concurrency extraction of source tables for one entity.
//!
//! Each work item is one table. At most `concurrency` items are in flight;
//! as one finishes the next is started. A failing item is recorded as an
//! `error` result and never affects its siblings.

mod accepted;

pub use accepted::AcceptedColumns;

use arrow::array::RecordBatch;
use arrow::datatypes::{Field, Schema};
use futures::stream::{FuturesUnordered, StreamExt};
use snafu::prelude::*;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use avalanche_core::{RetryPolicy, emit};

use crate::checkpoint::CheckpointStore;
use crate::config::Config;
use crate::cost::CostAccountant;
use crate::error::{ExtractError, PrefixSnafu, QueryError};
use crate::metrics::{ActiveFetches, BytesScanned, FetchCompleted, TableProcessed};
use crate::model::{Entity, PartialResult, SourceTable, TableStatus};
use crate::pipeline::events::{EventBus, PipelineEvent};
use crate::warehouse::{FetchRequest, FetchResult, QueryService, QueryServiceRef};

/// Future type for one spawned table extraction.
type TableFuture = Pin<Box<dyn Future<Output = PartialResult> + Send>>;

/// One table to extract for an entity.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub table: SourceTable,
    /// Columns to fetch, time key excluded.
    pub columns: Vec<String>,
}

/// Tunables for the pool.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub time_key: String,
    pub concurrency: usize,
    pub row_ceiling: Option<usize>,
    /// Covers every retry attempt of one table's query.
    pub fetch_timeout: Duration,
    pub retry: RetryPolicy,
}

impl PoolOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            time_key: config.warehouse.time_key.clone(),
            concurrency: config.extraction.concurrency,
            row_ceiling: config.extraction.row_ceiling,
            fetch_timeout: config.extraction.fetch_timeout(),
            retry: config.retry.policy(),
        }
    }
}

/// State shared by every worker task.
struct Worker {
    service: QueryServiceRef,
    checkpoints: CheckpointStore,
    cost: Arc<CostAccountant>,
    events: EventBus,
    options: PoolOptions,
}

/// Fetches tables concurrently and hands each result to the checkpoint store.
pub struct ExtractionPool {
    worker: Arc<Worker>,
}

impl ExtractionPool {
    pub fn new(
        service: QueryServiceRef,
        checkpoints: CheckpointStore,
        cost: Arc<CostAccountant>,
        events: EventBus,
        options: PoolOptions,
    ) -> Self {
        Self {
            worker: Arc::new(Worker {
                service,
                checkpoints,
                cost,
                events,
                options,
            }),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.worker.options.concurrency.max(1)
    }

    fn spawn(&self, entity: &Entity, item: WorkItem, accepted: &Arc<AcceptedColumns>) -> TableFuture {
        let table = item.table.name.clone();
        let handle = tokio::spawn(
            self.worker
                .clone()
                .extract(entity.clone(), item, accepted.clone()),
        );
        Box::pin(async move {
            match handle.await {
                Ok(result) => result,
                Err(source) => PartialResult::failed(table, ExtractError::Worker { source }),
            }
        })
    }

    /// Extract every item. Results are sorted by table name.
    pub async fn run(
        &self,
        entity: &Entity,
        items: Vec<WorkItem>,
        accepted: Arc<AcceptedColumns>,
    ) -> Vec<PartialResult> {
        let mut results = Vec::with_capacity(items.len());
        let mut tasks: FuturesUnordered<TableFuture> = FuturesUnordered::new();
        let mut pending = items.into_iter();
        let mut active = 0;

        for item in pending.by_ref().take(self.concurrency()) {
            tasks.push(self.spawn(entity, item, &accepted));
            active += 1;
        }
        emit!(ActiveFetches {
            entity: entity.code.clone(),
            count: active,
        });

        while let Some(result) = tasks.next().await {
            active -= 1;
            self.worker.events.publish(PipelineEvent::TableFinished {
                entity: entity.code.clone(),
                result: result.clone(),
            });
            results.push(result);

            if let Some(next) = pending.next() {
                tasks.push(self.spawn(entity, next, &accepted));
                active += 1;
            }
            emit!(ActiveFetches {
                entity: entity.code.clone(),
                count: active,
            });
        }

        results.sort_by(|a, b| a.table.cmp(&b.table));
        results
    }
}

impl Worker {
    async fn extract(
        self: Arc<Self>,
        entity: Entity,
        item: WorkItem,
        accepted: Arc<AcceptedColumns>,
    ) -> PartialResult {
        let start = Instant::now();
        let mut scanned = 0;
        let mut result = match self
            .try_extract(&entity, &item, &accepted, &mut scanned)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                warn!(
                    entity = %entity,
                    table = %item.table.name,
                    error = %e,
                    "Table extraction failed"
                );
                PartialResult {
                    bytes_scanned: scanned,
                    ..PartialResult::failed(&item.table.name, &e)
                }
            }
        };
        result.elapsed = start.elapsed();

        debug!(
            entity = %entity,
            table = %result.table,
            status = %result.status,
            rows = result.rows,
            elapsed_ms = result.elapsed.as_millis() as u64,
            "Table finished"
        );
        emit!(TableProcessed {
            entity: entity.code.clone(),
            status: result.status,
        });
        result
    }

    async fn try_extract(
        &self,
        entity: &Entity,
        item: &WorkItem,
        accepted: &AcceptedColumns,
        scanned: &mut u64,
    ) -> Result<PartialResult, ExtractError> {
        let table = item.table.name.as_str();
        if item.columns.is_empty() {
            return Ok(PartialResult::new(table, TableStatus::SkipNoColumns));
        }
        self.cost.check_budget()?;

        let request = FetchRequest {
            table: table.to_string(),
            columns: item.columns.clone(),
            time_key: self.options.time_key.clone(),
            range: entity.date_range,
            row_ceiling: self.options.row_ceiling,
        };
        let fetched = fetch_bounded(
            self.service.as_ref(),
            &request,
            &self.options.retry,
            self.options.fetch_timeout,
        )
        .await?;
        *scanned = fetched.bytes_scanned;
        self.cost.record(&entity.code, table, fetched.bytes_scanned);
        emit!(BytesScanned {
            entity: entity.code.clone(),
            bytes: fetched.bytes_scanned,
        });

        let rows = fetched.batch.num_rows();
        if rows == 0 {
            return Ok(PartialResult {
                bytes_scanned: fetched.bytes_scanned,
                ..PartialResult::new(table, TableStatus::SkipEmpty)
            });
        }

        let prefix = item.table.column_prefix(&entity.code);
        let prefixed = prefix_columns(&fetched.batch, &self.options.time_key, &prefix)
            .context(PrefixSnafu)?;
        let names = data_column_names(&prefixed, &self.options.time_key);
        let added = accepted.new_columns(&names);
        if added.is_empty() {
            debug!(entity = %entity, table, "Every column already present, skipping");
            return Ok(PartialResult {
                rows,
                bytes_scanned: fetched.bytes_scanned,
                ..PartialResult::new(table, TableStatus::SkipDuplicateColumns)
            });
        }

        // Saved whole; overlap with other tables is resolved by the merge.
        self.checkpoints
            .save(&entity.code, table, prefixed, fetched.bytes_scanned)
            .await?;

        Ok(PartialResult {
            rows,
            columns_added: added.len(),
            bytes_scanned: fetched.bytes_scanned,
            ..PartialResult::new(table, TableStatus::Saved)
        })
    }
}

/// One bounded query under `retry`, with `timeout` covering every attempt.
pub async fn fetch_bounded(
    service: &dyn QueryService,
    request: &FetchRequest,
    retry: &RetryPolicy,
    timeout: Duration,
) -> Result<FetchResult, ExtractError> {
    let start = Instant::now();
    let attempts = retry.run(
        |attempt| {
            if attempt > 1 {
                debug!(table = %request.table, attempt, "Retrying fetch");
            }
            service.fetch(request)
        },
        QueryError::is_retryable,
    );
    let outcome = match tokio::time::timeout(timeout, attempts).await {
        Ok(result) => result.map_err(ExtractError::from),
        Err(_) => Err(ExtractError::Timeout { timeout }),
    };
    emit!(FetchCompleted {
        duration: start.elapsed(),
        success: outcome.is_ok(),
    });
    outcome
}

/// Rename every column except the time key to `{prefix}_{name}`.
pub fn prefix_columns(
    batch: &RecordBatch,
    time_key: &str,
    prefix: &str,
) -> Result<RecordBatch, arrow::error::ArrowError> {
    let fields: Vec<Field> = batch
        .schema()
        .fields()
        .iter()
        .map(|field| {
            let field = Field::clone(field);
            if field.name() == time_key {
                field
            } else {
                let name = format!("{prefix}_{}", field.name());
                field.with_name(name)
            }
        })
        .collect();
    RecordBatch::try_new(Arc::new(Schema::new(fields)), batch.columns().to_vec())
}

fn data_column_names(batch: &RecordBatch, time_key: &str) -> Vec<String> {
    batch
        .schema()
        .fields()
        .iter()
        .map(|f| f.name().clone())
        .filter(|name| name != time_key)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointStore;
    use crate::config::ParquetCompression;
    use crate::warehouse::InMemoryWarehouse;
    use crate::warehouse::tests::{DAY_MICROS, range};
    use arrow::array::{ArrayRef, Float64Array, TimestampMicrosecondArray};
    use arrow::datatypes::{DataType, TimeUnit};
    use avalanche_core::{Backoff, StorageProvider};
    use tempfile::TempDir;

    fn table(columns: &[&str], days: i64) -> RecordBatch {
        let mut fields = vec![Field::new(
            "interval_time",
            DataType::Timestamp(TimeUnit::Microsecond, None),
            false,
        )];
        let mut arrays: Vec<ArrayRef> = vec![Arc::new(TimestampMicrosecondArray::from(
            (0..days).map(|d| d * DAY_MICROS).collect::<Vec<_>>(),
        ))];
        for c in columns {
            fields.push(Field::new(*c, DataType::Float64, true));
            arrays.push(Arc::new(Float64Array::from(
                (0..days).map(|d| d as f64).collect::<Vec<_>>(),
            )));
        }
        RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays).unwrap()
    }

    fn universe() -> Vec<String> {
        vec!["eurusd".into(), "gbpusd".into()]
    }

    fn item(name: &str, columns: &[&str]) -> WorkItem {
        WorkItem {
            table: SourceTable::classify(name, "eurusd", &universe()),
            columns: columns.iter().map(|c| c.to_string()).collect(),
        }
    }

    fn entity() -> Entity {
        Entity::new("eurusd", range(0, 9))
    }

    struct Harness {
        _temp_dir: TempDir,
        warehouse: Arc<InMemoryWarehouse>,
        checkpoints: CheckpointStore,
        cost: Arc<CostAccountant>,
        pool: ExtractionPool,
    }

    async fn harness(warehouse: InMemoryWarehouse, options: PoolOptions) -> Harness {
        let temp_dir = TempDir::new().unwrap();
        let storage = StorageProvider::for_url(temp_dir.path().to_str().unwrap())
            .await
            .unwrap();
        let checkpoints = CheckpointStore::new(Arc::new(storage), ParquetCompression::Snappy);
        let warehouse = Arc::new(warehouse);
        let cost = Arc::new(CostAccountant::new(6.25, None));
        let pool = ExtractionPool::new(
            warehouse.clone(),
            checkpoints.clone(),
            cost.clone(),
            EventBus::new(),
            options,
        );
        Harness {
            _temp_dir: temp_dir,
            warehouse,
            checkpoints,
            cost,
            pool,
        }
    }

    fn options() -> PoolOptions {
        PoolOptions {
            time_key: "interval_time".into(),
            concurrency: 4,
            row_ceiling: None,
            fetch_timeout: Duration::from_secs(30),
            retry: RetryPolicy::no_retry(),
        }
    }

    fn status_of<'a>(results: &'a [PartialResult], table: &str) -> &'a PartialResult {
        results.iter().find(|r| r.table == table).unwrap()
    }

    #[test]
    fn test_prefix_columns_keeps_time_key() {
        let batch = table(&["close", "open"], 2);
        let prefixed = prefix_columns(&batch, "interval_time", "cov_gbpusd").unwrap();
        let names: Vec<String> = prefixed
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect();
        assert_eq!(names, vec!["interval_time", "cov_gbpusd_close", "cov_gbpusd_open"]);
    }

    #[tokio::test]
    async fn test_outcomes_per_table() {
        let warehouse = InMemoryWarehouse::new()
            .with_table("reg_eurusd", table(&["close"], 10))
            .with_table("old_eurusd", table(&["close"], 0))
            .with_table("hole_eurusd", table(&[], 10));
        let h = harness(warehouse, options()).await;

        let results = h
            .pool
            .run(
                &entity(),
                vec![
                    item("reg_eurusd", &["close"]),
                    item("old_eurusd", &["close"]),
                    item("hole_eurusd", &[]),
                    item("gone_eurusd", &["close"]),
                ],
                Arc::new(AcceptedColumns::new()),
            )
            .await;

        let tables: Vec<&str> = results.iter().map(|r| r.table.as_str()).collect();
        assert_eq!(tables, vec!["gone_eurusd", "hole_eurusd", "old_eurusd", "reg_eurusd"]);

        let saved = status_of(&results, "reg_eurusd");
        assert_eq!(saved.status, TableStatus::Saved);
        assert_eq!(saved.rows, 10);
        assert_eq!(saved.columns_added, 1);
        assert_eq!(status_of(&results, "old_eurusd").status, TableStatus::SkipEmpty);
        assert_eq!(status_of(&results, "hole_eurusd").status, TableStatus::SkipNoColumns);
        let failed = status_of(&results, "gone_eurusd");
        assert_eq!(failed.status, TableStatus::Error);
        assert!(failed.error.as_deref().unwrap().contains("not found"));

        // No query for the zero-column table.
        assert_eq!(h.warehouse.fetch_calls_for("hole_eurusd"), 0);
        assert!(h.checkpoints.exists("eurusd", "reg_eurusd").await.unwrap());
        assert!(!h.checkpoints.exists("eurusd", "old_eurusd").await.unwrap());

        let artifact = h.checkpoints.load("eurusd", "reg_eurusd").await.unwrap();
        assert_eq!(artifact.batch.schema().field(1).name(), "reg_close");
        assert_eq!(h.cost.total_bytes(), saved.bytes_scanned + status_of(&results, "old_eurusd").bytes_scanned);
    }

    #[tokio::test]
    async fn test_overlapping_tables_are_saved_whole() {
        let warehouse = InMemoryWarehouse::new()
            .with_table("reg_eurusd", table(&["close", "open"], 5));
        let h = harness(warehouse, options()).await;
        let accepted = Arc::new(AcceptedColumns::seeded(["reg_close"]));

        let results = h
            .pool
            .run(&entity(), vec![item("reg_eurusd", &["close", "open"])], accepted)
            .await;
        assert_eq!(results[0].status, TableStatus::Saved);
        assert_eq!(results[0].columns_added, 1);

        // The overlapping column stays in the artifact.
        let artifact = h.checkpoints.load("eurusd", "reg_eurusd").await.unwrap();
        assert_eq!(artifact.batch.num_columns(), 3);
        assert_eq!(artifact.batch.schema().field(1).name(), "reg_close");
        assert_eq!(artifact.batch.schema().field(2).name(), "reg_open");
    }

    #[tokio::test]
    async fn test_table_adding_nothing_is_skipped() {
        let warehouse = InMemoryWarehouse::new()
            .with_table("reg_eurusd", table(&["close", "open"], 5));
        let h = harness(warehouse, options()).await;
        let accepted = Arc::new(AcceptedColumns::seeded(["reg_close", "reg_open"]));

        let results = h
            .pool
            .run(&entity(), vec![item("reg_eurusd", &["close", "open"])], accepted)
            .await;
        assert_eq!(results[0].status, TableStatus::SkipDuplicateColumns);
        assert!(!h.checkpoints.exists("eurusd", "reg_eurusd").await.unwrap());
    }

    #[tokio::test]
    async fn test_timeout_is_a_table_error() {
        let warehouse = InMemoryWarehouse::new()
            .with_table("slow_eurusd", table(&["close"], 5))
            .with_table("reg_eurusd", table(&["close"], 5));
        warehouse.inject_delay("slow_eurusd", Duration::from_secs(10));
        let h = harness(
            warehouse,
            PoolOptions {
                fetch_timeout: Duration::from_millis(100),
                ..options()
            },
        )
        .await;

        let results = h
            .pool
            .run(
                &entity(),
                vec![item("slow_eurusd", &["close"]), item("reg_eurusd", &["close"])],
                Arc::new(AcceptedColumns::new()),
            )
            .await;

        let slow = status_of(&results, "slow_eurusd");
        assert_eq!(slow.status, TableStatus::Error);
        assert!(slow.error.as_deref().unwrap().contains("Timed out"));
        assert_eq!(status_of(&results, "reg_eurusd").status, TableStatus::Saved);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let warehouse = InMemoryWarehouse::new().with_table("reg_eurusd", table(&["close"], 5));
        warehouse.inject_failure("reg_eurusd", "rate limited", true, Some(2));
        let h = harness(
            warehouse,
            PoolOptions {
                retry: RetryPolicy::new(3, Backoff::None),
                ..options()
            },
        )
        .await;

        let results = h
            .pool
            .run(&entity(), vec![item("reg_eurusd", &["close"])], Arc::new(AcceptedColumns::new()))
            .await;
        assert_eq!(results[0].status, TableStatus::Saved);
        assert_eq!(h.warehouse.fetch_calls_for("reg_eurusd"), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let warehouse = InMemoryWarehouse::new().with_table("reg_eurusd", table(&["close"], 5));
        warehouse.inject_failure("reg_eurusd", "syntax error", false, None);
        let h = harness(
            warehouse,
            PoolOptions {
                retry: RetryPolicy::new(3, Backoff::None),
                ..options()
            },
        )
        .await;

        let results = h
            .pool
            .run(&entity(), vec![item("reg_eurusd", &["close"])], Arc::new(AcceptedColumns::new()))
            .await;
        assert_eq!(results[0].status, TableStatus::Error);
        assert_eq!(h.warehouse.fetch_calls_for("reg_eurusd"), 1);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let names = ["a_eurusd", "b_eurusd", "c_eurusd", "d_eurusd"];
        let mut warehouse = InMemoryWarehouse::new();
        for name in names {
            warehouse = warehouse.with_table(name, table(&["x"], 3));
            warehouse.inject_delay(name, Duration::from_millis(100));
        }
        let h = harness(
            warehouse,
            PoolOptions {
                concurrency: 2,
                ..options()
            },
        )
        .await;

        let start = Instant::now();
        let results = h
            .pool
            .run(
                &entity(),
                names.iter().map(|n| item(n, &["x"])).collect(),
                Arc::new(AcceptedColumns::new()),
            )
            .await;
        // Two waves of two.
        assert!(start.elapsed() >= Duration::from_millis(200));
        assert!(results.iter().all(|r| r.status == TableStatus::Saved));
    }

    #[tokio::test]
    async fn test_exhausted_budget_stops_queries() {
        let warehouse = InMemoryWarehouse::new().with_table("reg_eurusd", table(&["close"], 5));
        let h = harness(warehouse, options()).await;
        let cost = Arc::new(CostAccountant::new(6.25, Some(0.0)));
        let pool = ExtractionPool::new(
            h.warehouse.clone(),
            h.checkpoints.clone(),
            cost,
            EventBus::new(),
            options(),
        );

        let results = pool
            .run(&entity(), vec![item("reg_eurusd", &["close"])], Arc::new(AcceptedColumns::new()))
            .await;
        assert_eq!(results[0].status, TableStatus::Error);
        assert!(results[0].error.as_deref().unwrap().contains("budget"));
        assert_eq!(h.warehouse.fetch_calls(), 0);
    }
}
