//! Run-scoped cache of table column lists.
//!
//! Column lists are resolved in bulk: [`ColumnCache::resolve`] issues at most
//! one `list_columns` call per invocation, and only for tables it has not
//! seen. Results are shared across entities for the lifetime of the run.

use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

use crate::error::QueryError;
use crate::warehouse::{QueryServiceRef, data_columns};

/// Column lists (time key excluded) by table name.
pub type ColumnSet = HashMap<String, Vec<String>>;

pub struct ColumnCache {
    service: QueryServiceRef,
    time_key: String,
    columns: Mutex<ColumnSet>,
}

impl ColumnCache {
    pub fn new(service: QueryServiceRef, time_key: impl Into<String>) -> Self {
        Self {
            service,
            time_key: time_key.into(),
            columns: Mutex::new(HashMap::new()),
        }
    }

    fn cached(&self) -> std::sync::MutexGuard<'_, ColumnSet> {
        self.columns.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Column lists for `tables`. Tables the service does not know, or that
    /// have no columns besides the time key, map to an empty list.
    pub async fn resolve(&self, tables: &[String]) -> Result<ColumnSet, QueryError> {
        let missing: Vec<String> = {
            let cached = self.cached();
            let mut missing: Vec<String> = tables
                .iter()
                .filter(|t| !cached.contains_key(*t))
                .cloned()
                .collect();
            missing.sort();
            missing.dedup();
            missing
        };

        if !missing.is_empty() {
            debug!(tables = missing.len(), "Resolving column metadata");
            let mut fetched = self.service.list_columns(&missing).await?;
            let mut cached = self.cached();
            for table in missing {
                let columns = fetched
                    .remove(&table)
                    .map(|all| data_columns(&all, &self.time_key))
                    .unwrap_or_default();
                cached.entry(table).or_insert(columns);
            }
        }

        let cached = self.cached();
        Ok(tables
            .iter()
            .map(|t| (t.clone(), cached.get(t).cloned().unwrap_or_default()))
            .collect())
    }

    /// Column list for a single table, resolving it if it is not cached.
    pub async fn columns_for(&self, table: &str) -> Result<Vec<String>, QueryError> {
        let mut resolved = self.resolve(&[table.to_string()]).await?;
        Ok(resolved.remove(table).unwrap_or_default())
    }

    /// Number of cached tables.
    pub fn len(&self) -> usize {
        self.cached().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
