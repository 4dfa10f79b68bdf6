//! The tabular query service the pipeline extracts from.
//!
//! [`QueryService`] is the seam to the warehouse. Two implementations ship
//! with the crate:
//!
//! - [`ParquetWarehouse`]: one Parquet file per table on object storage
//! - [`InMemoryWarehouse`]: record batches held in memory, with fault injection

mod memory;
mod parquet;
mod pattern;

pub use memory::InMemoryWarehouse;
pub use parquet::ParquetWarehouse;
pub use pattern::TablePattern;

use arrow::array::{Array, ArrayRef, Int32Array, Int64Array, RecordBatch, Scalar, StringArray};
use arrow::compute::kernels::cmp::{gt_eq, lt_eq};
use arrow::compute::{and, cast, filter_record_batch};
use arrow::datatypes::{DataType, TimeUnit};
use arrow::error::ArrowError;
use async_trait::async_trait;
use snafu::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{ColumnNotFoundSnafu, ComputeSnafu, QueryError, UnsupportedTimeKeySnafu};
use crate::model::DateRange;

/// A bounded query: `time_key BETWEEN range.start AND range.end`, projected
/// to `columns` and capped at `row_ceiling` rows.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub table: String,
    /// Columns to return besides the time key.
    pub columns: Vec<String>,
    pub time_key: String,
    pub range: DateRange,
    pub row_ceiling: Option<usize>,
}

impl FetchRequest {
    /// Every projected column, time key first.
    pub fn projection(&self) -> Vec<&str> {
        std::iter::once(self.time_key.as_str())
            .chain(
                self.columns
                    .iter()
                    .map(String::as_str)
                    .filter(|c| *c != self.time_key),
            )
            .collect()
    }
}

/// Rows returned by a fetch, plus what the warehouse billed for them.
#[derive(Debug, Clone)]
pub struct FetchResult {
    /// Time key first, then the requested columns in request order.
    pub batch: RecordBatch,
    pub bytes_scanned: u64,
}

/// Warehouse operations the pipeline depends on.
#[async_trait]
pub trait QueryService: Send + Sync {
    /// Tables whose name matches a glob pattern (`*`, `?`).
    async fn list_tables(&self, pattern: &str) -> Result<Vec<String>, QueryError>;

    /// Column names (time key included) for many tables in one call.
    /// Unknown tables are absent from the result.
    async fn list_columns(
        &self,
        tables: &[String],
    ) -> Result<HashMap<String, Vec<String>>, QueryError>;

    /// Run a bounded query.
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResult, QueryError>;

    /// Bytes `fetch` would scan for `request`, without running it.
    async fn estimate(&self, request: &FetchRequest) -> Result<u64, QueryError>;
}

/// A shared query service.
pub type QueryServiceRef = Arc<dyn QueryService>;

/// Project, range-filter and cap `batch` as `request` describes.
///
/// Both shipped services produce rows this way, so they agree on edge cases:
/// null time keys never match, and the ceiling keeps the first rows in
/// table order.
pub(crate) fn shape(batch: &RecordBatch, request: &FetchRequest) -> Result<RecordBatch, QueryError> {
    let table = request.table.as_str();
    let schema = batch.schema();

    let indices = request
        .projection()
        .into_iter()
        .map(|name| {
            schema.index_of(name).map_err(|_| {
                ColumnNotFoundSnafu {
                    table,
                    column: name,
                }
                .build()
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    let projected = batch.project(&indices).context(ComputeSnafu { table })?;

    let key = projected.column(0);
    let bounds = bounds(key.data_type(), &request.range).context(ComputeSnafu { table })?;
    let Some((lower, upper)) = bounds else {
        return UnsupportedTimeKeySnafu {
            table,
            data_type: key.data_type().to_string(),
        }
        .fail();
    };
    let mask = and(
        &gt_eq(key, &Scalar::new(lower)).context(ComputeSnafu { table })?,
        &lt_eq(key, &Scalar::new(upper)).context(ComputeSnafu { table })?,
    )
    .context(ComputeSnafu { table })?;
    let filtered = filter_record_batch(&projected, &mask).context(ComputeSnafu { table })?;

    Ok(match request.row_ceiling {
        Some(ceiling) if filtered.num_rows() > ceiling => filtered.slice(0, ceiling),
        _ => filtered,
    })
}

/// Range bounds as single-element arrays of the key's type, or `None` for
/// key types that cannot be compared against dates.
fn bounds(data_type: &DataType, range: &DateRange) -> Result<Option<(ArrayRef, ArrayRef)>, ArrowError> {
    let (start, end) = (range.start_micros(), range.end_micros());
    let pair = |lower: ArrayRef, upper: ArrayRef| -> Result<_, ArrowError> {
        Ok(Some((cast(&lower, data_type)?, cast(&upper, data_type)?)))
    };
    let int64 = |a: i64, b: i64| -> (ArrayRef, ArrayRef) {
        let lower: ArrayRef = Arc::new(Int64Array::from(vec![a]));
        let upper: ArrayRef = Arc::new(Int64Array::from(vec![b]));
        (lower, upper)
    };

    match data_type {
        DataType::Timestamp(unit, _) => {
            let scale = |micros: i64| match unit {
                TimeUnit::Second => micros / 1_000_000,
                TimeUnit::Millisecond => micros / 1_000,
                TimeUnit::Microsecond => micros,
                TimeUnit::Nanosecond => micros.saturating_mul(1_000),
            };
            let (lower, upper) = int64(scale(start), scale(end));
            pair(lower, upper)
        }
        DataType::Date32 => {
            let days = |micros: i64| (micros / 86_400_000_000) as i32;
            let lower: ArrayRef = Arc::new(Int32Array::from(vec![days(start)]));
            let upper: ArrayRef = Arc::new(Int32Array::from(vec![days(end)]));
            pair(lower, upper)
        }
        DataType::Date64 => {
            let (lower, upper) = int64(start / 1_000, end / 1_000);
            pair(lower, upper)
        }
        // Epoch seconds.
        DataType::Int64 => {
            let (lower, upper) = int64(start / 1_000_000, end / 1_000_000);
            pair(lower, upper)
        }
        DataType::Utf8 | DataType::LargeUtf8 => {
            let lower: ArrayRef = Arc::new(StringArray::from(vec![range.start.to_string()]));
            let upper: ArrayRef = Arc::new(StringArray::from(vec![range.end.to_string()]));
            pair(lower, upper)
        }
        _ => Ok(None),
    }
}

/// Column names of `columns` that the pipeline should fetch: everything but
/// the time key.
pub fn data_columns(columns: &[String], time_key: &str) -> Vec<String> {
    columns
        .iter()
        .filter(|c| c.as_str() != time_key)
        .cloned()
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use arrow::array::{Date32Array, Float64Array, TimestampMicrosecondArray};
    use arrow::datatypes::{Field, Schema};
    use chrono::NaiveDate;

    pub(crate) const DAY_MICROS: i64 = 86_400_000_000;

    pub(crate) fn range(start_day: i64, end_day: i64) -> DateRange {
        let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap();
        DateRange::new(
            epoch + chrono::Days::new(start_day as u64),
            epoch + chrono::Days::new(end_day as u64),
        )
    }

    fn daily(days: &[i64]) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new(
                "interval_time",
                DataType::Timestamp(TimeUnit::Microsecond, None),
                true,
            ),
            Field::new("close", DataType::Float64, true),
            Field::new("open", DataType::Float64, true),
        ]));
        let times: Vec<i64> = days.iter().map(|d| d * DAY_MICROS).collect();
        let close: Vec<f64> = days.iter().map(|d| *d as f64).collect();
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(TimestampMicrosecondArray::from(times)),
                Arc::new(Float64Array::from(close.clone())),
                Arc::new(Float64Array::from(close)),
            ],
        )
        .unwrap()
    }

    fn request(columns: &[&str], range: DateRange, ceiling: Option<usize>) -> FetchRequest {
        FetchRequest {
            table: "reg_eurusd".into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            time_key: "interval_time".into(),
            range,
            row_ceiling: ceiling,
        }
    }

    #[test]
    fn test_shape_filters_inclusive_range_and_projects() {
        let batch = daily(&[0, 1, 2, 3, 4, 5]);
        let out = shape(&batch, &request(&["open"], range(1, 3), None)).unwrap();

        assert_eq!(out.num_rows(), 3);
        assert_eq!(out.schema().field(0).name(), "interval_time");
        assert_eq!(out.schema().field(1).name(), "open");
        assert_eq!(out.num_columns(), 2);
    }

    #[test]
    fn test_shape_applies_row_ceiling() {
        let batch = daily(&[0, 1, 2, 3, 4, 5]);
        let out = shape(&batch, &request(&["close"], range(0, 5), Some(2))).unwrap();
        assert_eq!(out.num_rows(), 2);
    }

    #[test]
    fn test_shape_missing_column_is_an_error() {
        let batch = daily(&[0]);
        let err = shape(&batch, &request(&["volume"], range(0, 1), None)).unwrap_err();
        assert!(matches!(err, QueryError::ColumnNotFound { column, .. } if column == "volume"));
    }

    #[test]
    fn test_shape_date32_key() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("interval_time", DataType::Date32, false),
            Field::new("close", DataType::Float64, true),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Date32Array::from(vec![0, 1, 2, 3])),
                Arc::new(Float64Array::from(vec![0.0, 1.0, 2.0, 3.0])),
            ],
        )
        .unwrap();
        let out = shape(&batch, &request(&["close"], range(2, 3), None)).unwrap();
        assert_eq!(out.num_rows(), 2);
    }

    #[test]
    fn test_shape_rejects_boolean_time_key() {
        let schema = Arc::new(Schema::new(vec![Field::new(
            "interval_time",
            DataType::Boolean,
            false,
        )]));
        let batch = RecordBatch::try_new(
            schema,
            vec![Arc::new(arrow::array::BooleanArray::from(vec![true]))],
        )
        .unwrap();
        let err = shape(&batch, &request(&[], range(0, 1), None)).unwrap_err();
        assert!(matches!(err, QueryError::UnsupportedTimeKey { .. }));
    }

    #[test]
    fn test_projection_deduplicates_time_key() {
        let req = request(&["interval_time", "close"], range(0, 1), None);
        assert_eq!(req.projection(), vec!["interval_time", "close"]);
    }
}
