//! Query service over Parquet files on object storage.
//!
//! Each table is `{name}.parquet` directly under the warehouse root. Bytes
//! scanned are the uncompressed sizes of the projected column chunks, which
//! is how columnar warehouses bill: by columns read, not rows returned.
//!
//! Column listing and estimates only read the file footer, with two ranged
//! requests: the fixed 8-byte tail, then the metadata it points at.

use arrow::array::RecordBatch;
use arrow::compute::concat_batches;
use arrow::record_batch::RecordBatchReader;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt, TryStreamExt};
use object_store::path::Path;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::{ProjectionMask, parquet_to_arrow_schema};
use parquet::file::metadata::{ParquetMetaData, ParquetMetaDataReader};
use snafu::prelude::*;
use std::collections::{HashMap, HashSet};
use tracing::debug;

use avalanche_core::StorageProviderRef;

use super::{FetchRequest, FetchResult, QueryService, TablePattern, shape};
use crate::error::{
    ColumnNotFoundSnafu, ComputeSnafu, FooterSnafu, QueryError, QueryTaskSnafu, ReadSnafu,
    TableNotFoundSnafu, WarehouseStorageSnafu,
};

const TABLE_SUFFIX: &str = ".parquet";

/// Metadata length (u32, little endian) followed by the magic.
const FOOTER_LEN: u64 = 8;
const PARQUET_MAGIC: &[u8] = b"PAR1";

/// Concurrent footer reads for `list_columns`.
const METADATA_CONCURRENCY: usize = 16;

/// A [`QueryService`] reading Parquet files from a storage root.
#[derive(Debug, Clone)]
pub struct ParquetWarehouse {
    storage: StorageProviderRef,
}

impl ParquetWarehouse {
    pub fn new(storage: StorageProviderRef) -> Self {
        Self { storage }
    }

    fn table_path(table: &str) -> Path {
        Path::from(format!("{table}{TABLE_SUFFIX}"))
    }

    async fn read_table(&self, table: &str) -> Result<Bytes, QueryError> {
        match self.storage.get(Self::table_path(table)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.is_not_found() => Err(QueryError::TableNotFound {
                table: table.to_string(),
            }),
            Err(source) => Err(source).context(WarehouseStorageSnafu { table }),
        }
    }

    /// Decode a table's footer metadata without downloading its data.
    async fn read_metadata(&self, table: &str) -> Result<ParquetMetaData, QueryError> {
        let path = Self::table_path(table);
        let size = self
            .storage
            .head(&path)
            .await
            .context(WarehouseStorageSnafu { table })?
            .context(TableNotFoundSnafu { table })?
            .size;
        ensure!(
            size >= FOOTER_LEN,
            FooterSnafu {
                table,
                reason: format!("file is only {size} bytes"),
            }
        );

        let tail = self
            .storage
            .get_range(&path, size - FOOTER_LEN..size)
            .await
            .context(WarehouseStorageSnafu { table })?;
        ensure!(
            &tail[4..] == PARQUET_MAGIC,
            FooterSnafu {
                table,
                reason: "missing magic",
            }
        );
        let metadata_len = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]) as u64;
        ensure!(
            metadata_len + FOOTER_LEN <= size,
            FooterSnafu {
                table,
                reason: format!("metadata length {metadata_len} exceeds file size {size}"),
            }
        );

        let start = size - FOOTER_LEN - metadata_len;
        let encoded = self
            .storage
            .get_range(&path, start..size - FOOTER_LEN)
            .await
            .context(WarehouseStorageSnafu { table })?;
        let table = table.to_string();
        tokio::task::spawn_blocking(move || {
            ParquetMetaDataReader::decode_metadata(&encoded).context(ReadSnafu { table })
        })
        .await
        .context(QueryTaskSnafu)?
    }

    async fn columns_of(&self, table: String) -> Result<Option<(String, Vec<String>)>, QueryError> {
        let metadata = match self.read_metadata(&table).await {
            Ok(metadata) => metadata,
            Err(QueryError::TableNotFound { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        let columns = top_level_columns(&table, &metadata)?;
        Ok(Some((table, columns)))
    }
}

/// Top-level column names, in file order.
fn top_level_columns(table: &str, metadata: &ParquetMetaData) -> Result<Vec<String>, QueryError> {
    let file = metadata.file_metadata();
    let schema = parquet_to_arrow_schema(file.schema_descr(), file.key_value_metadata())
        .context(ReadSnafu { table })?;
    Ok(schema.fields().iter().map(|f| f.name().clone()).collect())
}

/// Uncompressed bytes of the column chunks whose top-level column is in
/// `columns`, summed over every row group.
fn projected_bytes(metadata: &ParquetMetaData, columns: &[&str]) -> u64 {
    let wanted: HashSet<&str> = columns.iter().copied().collect();
    metadata
        .row_groups()
        .iter()
        .flat_map(|rg| rg.columns())
        .filter(|chunk| {
            chunk
                .column_descr()
                .path()
                .parts()
                .first()
                .is_some_and(|root| wanted.contains(root.as_str()))
        })
        .map(|chunk| chunk.uncompressed_size().max(0) as u64)
        .sum()
}

/// Read the projected columns of a table file and shape them per `request`.
fn read_projected(bytes: Bytes, request: &FetchRequest) -> Result<FetchResult, QueryError> {
    let table = request.table.as_str();
    let builder = ParquetRecordBatchReaderBuilder::try_new(bytes).context(ReadSnafu { table })?;

    let projection = request.projection();
    let arrow_schema = builder.schema().clone();
    let mut roots = Vec::with_capacity(projection.len());
    for name in &projection {
        let index = arrow_schema.index_of(name).map_err(|_| {
            ColumnNotFoundSnafu {
                table,
                column: *name,
            }
            .build()
        })?;
        roots.push(index);
    }

    let bytes_scanned = projected_bytes(builder.metadata(), &projection);
    let mask = ProjectionMask::roots(builder.parquet_schema(), roots);
    let reader = builder
        .with_projection(mask)
        .build()
        .context(ReadSnafu { table })?;
    let schema = reader.schema();
    let batches = reader
        .collect::<Result<Vec<RecordBatch>, _>>()
        .context(ComputeSnafu { table })?;
    let batch = concat_batches(&schema, &batches).context(ComputeSnafu { table })?;

    Ok(FetchResult {
        batch: shape(&batch, request)?,
        bytes_scanned,
    })
}

#[async_trait]
impl QueryService for ParquetWarehouse {
    async fn list_tables(&self, pattern: &str) -> Result<Vec<String>, QueryError> {
        let pattern = TablePattern::new(pattern);
        let objects = self
            .storage
            .list_with_prefix("")
            .await
            .context(WarehouseStorageSnafu { table: pattern.as_str() })?;

        let tables: Vec<String> = objects
            .iter()
            .filter_map(|object| {
                let name = object.path.as_ref().strip_suffix(TABLE_SUFFIX)?;
                (!name.contains('/') && pattern.matches(name)).then(|| name.to_string())
            })
            .collect();
        debug!(pattern = pattern.as_str(), count = tables.len(), "Listed tables");
        Ok(tables)
    }

    async fn list_columns(
        &self,
        tables: &[String],
    ) -> Result<HashMap<String, Vec<String>>, QueryError> {
        stream::iter(tables.iter().cloned())
            .map(|table| self.columns_of(table))
            .buffer_unordered(METADATA_CONCURRENCY)
            .try_filter_map(|entry| async move { Ok(entry) })
            .try_collect()
            .await
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResult, QueryError> {
        let bytes = self.read_table(&request.table).await?;
        let request = request.clone();
        tokio::task::spawn_blocking(move || read_projected(bytes, &request))
            .await
            .context(QueryTaskSnafu)?
    }

    async fn estimate(&self, request: &FetchRequest) -> Result<u64, QueryError> {
        let table = request.table.as_str();
        let metadata = self.read_metadata(table).await?;
        let columns = top_level_columns(table, &metadata)?;
        let projection = request.projection();
        for name in &projection {
            if !columns.iter().any(|c| c == name) {
                return ColumnNotFoundSnafu {
                    table,
                    column: *name,
                }
                .fail();
            }
        }
        Ok(projected_bytes(&metadata, &projection))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact;
    use crate::config::ParquetCompression;
    use crate::warehouse::tests::{DAY_MICROS, range};
    use arrow::array::{Float64Array, TimestampMicrosecondArray};
    use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
    use avalanche_core::StorageProvider;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn table(days: i64) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new(
                "interval_time",
                DataType::Timestamp(TimeUnit::Microsecond, None),
                false,
            ),
            Field::new("close", DataType::Float64, true),
            Field::new("volume", DataType::Float64, true),
        ]));
        let values: Vec<f64> = (0..days).map(|d| d as f64).collect();
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(TimestampMicrosecondArray::from(
                    (0..days).map(|d| d * DAY_MICROS).collect::<Vec<_>>(),
                )),
                Arc::new(Float64Array::from(values.clone())),
                Arc::new(Float64Array::from(values)),
            ],
        )
        .unwrap()
    }

    async fn warehouse(temp_dir: &TempDir) -> ParquetWarehouse {
        let storage = StorageProvider::for_url(temp_dir.path().to_str().unwrap())
            .await
            .unwrap();
        for name in ["reg_eurusd", "cov_eurusd_gbpusd", "reg_gbpusd"] {
            let bytes = artifact::encode(&table(10), ParquetCompression::Snappy, &[]).unwrap();
            storage
                .put(&Path::from(format!("{name}.parquet")), bytes)
                .await
                .unwrap();
        }
        storage
            .put(&Path::from("notes.txt"), Bytes::from_static(b"ignored"))
            .await
            .unwrap();
        ParquetWarehouse::new(Arc::new(storage))
    }

    fn request(columns: &[&str]) -> FetchRequest {
        FetchRequest {
            table: "reg_eurusd".into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            time_key: "interval_time".into(),
            range: range(2, 5),
            row_ceiling: None,
        }
    }

    #[tokio::test]
    async fn test_list_tables_matches_pattern() {
        let temp_dir = TempDir::new().unwrap();
        let warehouse = warehouse(&temp_dir).await;

        let tables = warehouse.list_tables("*eurusd*").await.unwrap();
        assert_eq!(tables, vec!["cov_eurusd_gbpusd", "reg_eurusd"]);
        assert!(warehouse.list_tables("*.txt").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_columns_skips_unknown_tables() {
        let temp_dir = TempDir::new().unwrap();
        let warehouse = warehouse(&temp_dir).await;

        let columns = warehouse
            .list_columns(&["reg_eurusd".into(), "missing".into()])
            .await
            .unwrap();
        assert_eq!(columns.len(), 1);
        assert_eq!(columns["reg_eurusd"], vec!["interval_time", "close", "volume"]);
    }

    #[tokio::test]
    async fn test_fetch_filters_and_bills_projected_columns() {
        let temp_dir = TempDir::new().unwrap();
        let warehouse = warehouse(&temp_dir).await;

        let narrow = warehouse.fetch(&request(&["close"])).await.unwrap();
        assert_eq!(narrow.batch.num_rows(), 4);
        assert_eq!(narrow.batch.num_columns(), 2);

        let wide = warehouse.fetch(&request(&["close", "volume"])).await.unwrap();
        assert!(wide.bytes_scanned > narrow.bytes_scanned);
        assert_eq!(
            warehouse.estimate(&request(&["close"])).await.unwrap(),
            narrow.bytes_scanned
        );
    }

    #[tokio::test]
    async fn test_footer_reads_match_full_reads() {
        let temp_dir = TempDir::new().unwrap();
        let warehouse = warehouse(&temp_dir).await;

        let bytes = warehouse.read_table("reg_eurusd").await.unwrap();
        let full = ParquetRecordBatchReaderBuilder::try_new(bytes).unwrap();
        let footer = warehouse.read_metadata("reg_eurusd").await.unwrap();
        assert_eq!(
            footer.file_metadata().num_rows(),
            full.metadata().file_metadata().num_rows()
        );
        assert_eq!(
            projected_bytes(&footer, &["close", "volume"]),
            projected_bytes(full.metadata(), &["close", "volume"])
        );

        assert!(matches!(
            warehouse.read_metadata("missing").await.unwrap_err(),
            QueryError::TableNotFound { .. }
        ));
        assert!(matches!(
            warehouse.estimate(&request(&["spread"])).await.unwrap_err(),
            QueryError::ColumnNotFound { .. }
        ));
    }

    #[tokio::test]
    async fn test_truncated_file_has_invalid_footer() {
        let temp_dir = TempDir::new().unwrap();
        let warehouse = warehouse(&temp_dir).await;
        warehouse
            .storage
            .put(&Path::from("short.parquet"), Bytes::from_static(b"PAR1"))
            .await
            .unwrap();
        warehouse
            .storage
            .put(&Path::from("junk.parquet"), Bytes::from_static(b"not a parquet file"))
            .await
            .unwrap();

        for table in ["short", "junk"] {
            assert!(matches!(
                warehouse.list_columns(&[table.into()]).await.unwrap_err(),
                QueryError::Footer { .. }
            ));
        }
    }

    #[tokio::test]
    async fn test_fetch_missing_table_and_column() {
        let temp_dir = TempDir::new().unwrap();
        let warehouse = warehouse(&temp_dir).await;

        let mut req = request(&["close"]);
        req.table = "nope".into();
        assert!(matches!(
            warehouse.fetch(&req).await.unwrap_err(),
            QueryError::TableNotFound { .. }
        ));

        assert!(matches!(
            warehouse.fetch(&request(&["spread"])).await.unwrap_err(),
            QueryError::ColumnNotFound { .. }
        ));
    }
}
