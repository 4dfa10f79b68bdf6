//! In-memory query service.
//!
//! Tables are Arrow record batches registered up front. Faults (slow or
//! failing fetches) can be injected per table, and every call is counted so
//! callers can assert exactly which queries were issued.

use arrow::array::{Array, RecordBatch};
use async_trait::async_trait;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use super::{FetchRequest, FetchResult, QueryService, TablePattern, shape};
use crate::error::QueryError;

#[derive(Debug, Clone)]
struct Failure {
    message: String,
    retryable: bool,
    /// Failures left before fetches succeed again; `None` fails forever.
    remaining: Option<u32>,
}

#[derive(Debug, Clone, Default)]
struct Faults {
    delay: Option<Duration>,
    failure: Option<Failure>,
}

/// A [`QueryService`] over in-memory tables.
#[derive(Debug, Default)]
pub struct InMemoryWarehouse {
    tables: RwLock<IndexMap<String, RecordBatch>>,
    faults: Mutex<HashMap<String, Faults>>,
    fetches: Mutex<HashMap<String, u64>>,
    list_tables_calls: AtomicU64,
    list_columns_calls: AtomicU64,
    estimate_calls: AtomicU64,
}

impl InMemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a table (builder style).
    pub fn with_table(self, name: impl Into<String>, batch: RecordBatch) -> Self {
        self.insert_table(name, batch);
        self
    }

    /// Register or replace a table.
    pub fn insert_table(&self, name: impl Into<String>, batch: RecordBatch) {
        write(&self.tables).insert(name.into(), batch);
    }

    /// Delay every fetch of `table` by `delay`.
    pub fn inject_delay(&self, table: &str, delay: Duration) {
        lock(&self.faults)
            .entry(table.to_string())
            .or_default()
            .delay = Some(delay);
    }

    /// Fail the next `times` fetches of `table` (every fetch if `None`).
    pub fn inject_failure(
        &self,
        table: &str,
        message: impl Into<String>,
        retryable: bool,
        times: Option<u32>,
    ) {
        lock(&self.faults)
            .entry(table.to_string())
            .or_default()
            .failure = Some(Failure {
            message: message.into(),
            retryable,
            remaining: times,
        });
    }

    /// Remove every injected fault.
    pub fn clear_faults(&self) {
        lock(&self.faults).clear();
    }

    /// Fetch attempts across all tables, retries included.
    pub fn fetch_calls(&self) -> u64 {
        lock(&self.fetches).values().sum()
    }

    /// Fetch attempts for one table, retries included.
    pub fn fetch_calls_for(&self, table: &str) -> u64 {
        lock(&self.fetches).get(table).copied().unwrap_or_default()
    }

    pub fn list_tables_calls(&self) -> u64 {
        self.list_tables_calls.load(Ordering::Relaxed)
    }

    pub fn list_columns_calls(&self) -> u64 {
        self.list_columns_calls.load(Ordering::Relaxed)
    }

    pub fn estimate_calls(&self) -> u64 {
        self.estimate_calls.load(Ordering::Relaxed)
    }

    /// Every call of any kind.
    pub fn total_calls(&self) -> u64 {
        self.fetch_calls()
            + self.list_tables_calls()
            + self.list_columns_calls()
            + self.estimate_calls()
    }

    /// Reset every counter to zero.
    pub fn reset_counters(&self) {
        lock(&self.fetches).clear();
        self.list_tables_calls.store(0, Ordering::Relaxed);
        self.list_columns_calls.store(0, Ordering::Relaxed);
        self.estimate_calls.store(0, Ordering::Relaxed);
    }

    fn table(&self, name: &str) -> Result<RecordBatch, QueryError> {
        read(&self.tables)
            .get(name)
            .cloned()
            .ok_or_else(|| QueryError::TableNotFound {
                table: name.to_string(),
            })
    }

    /// Take the next failure for `table`, if one is armed.
    fn next_failure(&self, table: &str) -> Option<QueryError> {
        let mut faults = lock(&self.faults);
        let failure = faults.get_mut(table)?.failure.as_mut()?;
        match &mut failure.remaining {
            Some(0) => return None,
            Some(n) => *n -= 1,
            None => {}
        }
        Some(QueryError::Service {
            table: table.to_string(),
            message: failure.message.clone(),
            retryable: failure.retryable,
        })
    }
}

/// Memory size of the projected columns over the whole table: like a
/// columnar warehouse, the row filter does not reduce what is billed.
fn scanned_bytes(batch: &RecordBatch, request: &FetchRequest) -> u64 {
    let schema = batch.schema();
    request
        .projection()
        .into_iter()
        .filter_map(|name| schema.index_of(name).ok())
        .map(|i| batch.column(i).get_buffer_memory_size() as u64)
        .sum()
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl QueryService for InMemoryWarehouse {
    async fn list_tables(&self, pattern: &str) -> Result<Vec<String>, QueryError> {
        self.list_tables_calls.fetch_add(1, Ordering::Relaxed);
        let pattern = TablePattern::new(pattern);
        let mut names: Vec<String> = read(&self.tables)
            .keys()
            .filter(|name| pattern.matches(name))
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }

    async fn list_columns(
        &self,
        tables: &[String],
    ) -> Result<HashMap<String, Vec<String>>, QueryError> {
        self.list_columns_calls.fetch_add(1, Ordering::Relaxed);
        let registered = read(&self.tables);
        Ok(tables
            .iter()
            .filter_map(|name| {
                let batch = registered.get(name)?;
                let columns = batch
                    .schema()
                    .fields()
                    .iter()
                    .map(|f| f.name().clone())
                    .collect();
                Some((name.clone(), columns))
            })
            .collect())
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResult, QueryError> {
        *lock(&self.fetches).entry(request.table.clone()).or_default() += 1;

        let delay = lock(&self.faults)
            .get(&request.table)
            .and_then(|f| f.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.next_failure(&request.table) {
            return Err(err);
        }

        let table = self.table(&request.table)?;
        let bytes_scanned = scanned_bytes(&table, request);
        let batch = shape(&table, request)?;
        Ok(FetchResult {
            batch,
            bytes_scanned,
        })
    }

    async fn estimate(&self, request: &FetchRequest) -> Result<u64, QueryError> {
        self.estimate_calls.fetch_add(1, Ordering::Relaxed);
        let table = self.table(&request.table)?;
        Ok(scanned_bytes(&table, request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warehouse::tests::{DAY_MICROS, range};
    use arrow::array::{Float64Array, TimestampMicrosecondArray};
    use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
    use std::sync::Arc;

    fn table(days: i64) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new(
                "interval_time",
                DataType::Timestamp(TimeUnit::Microsecond, None),
                false,
            ),
            Field::new("close", DataType::Float64, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(TimestampMicrosecondArray::from(
                    (0..days).map(|d| d * DAY_MICROS).collect::<Vec<_>>(),
                )),
                Arc::new(Float64Array::from(
                    (0..days).map(|d| d as f64).collect::<Vec<_>>(),
                )),
            ],
        )
        .unwrap()
    }

    fn request(table: &str) -> FetchRequest {
        FetchRequest {
            table: table.into(),
            columns: vec!["close".into()],
            time_key: "interval_time".into(),
            range: range(0, 4),
            row_ceiling: None,
        }
    }

    #[tokio::test]
    async fn test_list_and_fetch() {
        let warehouse = InMemoryWarehouse::new()
            .with_table("reg_eurusd", table(10))
            .with_table("reg_gbpusd", table(10));

        let tables = warehouse.list_tables("*_eurusd").await.unwrap();
        assert_eq!(tables, vec!["reg_eurusd"]);

        let columns = warehouse
            .list_columns(&["reg_eurusd".into(), "missing".into()])
            .await
            .unwrap();
        assert_eq!(columns["reg_eurusd"], vec!["interval_time", "close"]);
        assert!(!columns.contains_key("missing"));

        let result = warehouse.fetch(&request("reg_eurusd")).await.unwrap();
        assert_eq!(result.batch.num_rows(), 5);
        assert!(result.bytes_scanned > 0);
        assert_eq!(
            warehouse.estimate(&request("reg_eurusd")).await.unwrap(),
            result.bytes_scanned
        );

        assert_eq!(warehouse.fetch_calls_for("reg_eurusd"), 1);
        assert_eq!(warehouse.list_tables_calls(), 1);
        assert_eq!(warehouse.list_columns_calls(), 1);
        assert_eq!(warehouse.estimate_calls(), 1);
        assert_eq!(warehouse.total_calls(), 4);
    }

    #[tokio::test]
    async fn test_injected_failure_runs_out() {
        let warehouse = InMemoryWarehouse::new().with_table("reg_eurusd", table(3));
        warehouse.inject_failure("reg_eurusd", "backend unavailable", true, Some(2));

        for _ in 0..2 {
            let err = warehouse.fetch(&request("reg_eurusd")).await.unwrap_err();
            assert!(err.is_retryable());
        }
        assert!(warehouse.fetch(&request("reg_eurusd")).await.is_ok());
        assert_eq!(warehouse.fetch_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_injected_delay() {
        let warehouse = InMemoryWarehouse::new().with_table("reg_eurusd", table(3));
        warehouse.inject_delay("reg_eurusd", Duration::from_secs(30));

        let start = tokio::time::Instant::now();
        warehouse.fetch(&request("reg_eurusd")).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_unknown_table() {
        let warehouse = InMemoryWarehouse::new();
        let err = warehouse.fetch(&request("nope")).await.unwrap_err();
        assert!(matches!(err, QueryError::TableNotFound { .. }));

        warehouse.reset_counters();
        assert_eq!(warehouse.total_calls(), 0);
    }
}
