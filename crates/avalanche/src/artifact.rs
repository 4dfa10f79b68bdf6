//! Parquet encoding for checkpoint artifacts.
//!
//! Every artifact is a single Parquet file holding one logical record batch.
//! Table artifacts carry provenance in the file's key/value metadata.

use arrow::array::RecordBatch;
use arrow::compute::concat_batches;
use arrow::datatypes::Schema;
use bytes::Bytes;
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::basic::{Compression, GzipLevel, ZstdLevel};
use parquet::file::metadata::KeyValue;
use parquet::file::properties::WriterProperties;
use snafu::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::ParquetCompression;
use crate::error::{ArtifactError, AssembleSnafu, DecodeSnafu, EncodeSnafu};

/// Metadata key: source table name.
pub const TABLE_KEY: &str = "avalanche.table";
/// Metadata key: entity code.
pub const ENTITY_KEY: &str = "avalanche.entity";
/// Metadata key: bytes the warehouse scanned to produce the rows.
pub const BYTES_SCANNED_KEY: &str = "avalanche.bytes_scanned";

/// Keys the Arrow writer embeds for its own use.
const ARROW_KEY_PREFIX: &str = "ARROW:";

/// A decoded artifact.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub batch: RecordBatch,
    pub metadata: HashMap<String, String>,
}

impl Artifact {
    /// Bytes scanned recorded at extraction time, if present.
    pub fn bytes_scanned(&self) -> Option<u64> {
        self.metadata.get(BYTES_SCANNED_KEY)?.parse().ok()
    }
}

fn codec(compression: ParquetCompression) -> Compression {
    match compression {
        ParquetCompression::Uncompressed => Compression::UNCOMPRESSED,
        ParquetCompression::Snappy => Compression::SNAPPY,
        ParquetCompression::Gzip => Compression::GZIP(GzipLevel::default()),
        ParquetCompression::Zstd => Compression::ZSTD(ZstdLevel::default()),
        ParquetCompression::Lz4 => Compression::LZ4,
    }
}

/// Encode `batch` as a Parquet file. `metadata` is written in the given order
/// so identical inputs produce identical bytes.
pub fn encode(
    batch: &RecordBatch,
    compression: ParquetCompression,
    metadata: &[(&str, String)],
) -> Result<Bytes, ArtifactError> {
    let key_values = (!metadata.is_empty()).then(|| {
        metadata
            .iter()
            .map(|(key, value)| KeyValue::new(key.to_string(), value.clone()))
            .collect()
    });
    let properties = WriterProperties::builder()
        .set_compression(codec(compression))
        .set_key_value_metadata(key_values)
        .build();

    // Schema-level metadata would otherwise leak into every joined dataset.
    let schema = Arc::new(Schema::new(batch.schema().fields().clone()));
    let batch = batch.clone().with_schema(schema.clone()).context(AssembleSnafu)?;

    let mut writer =
        ArrowWriter::try_new(Vec::new(), schema, Some(properties)).context(EncodeSnafu)?;
    writer.write(&batch).context(EncodeSnafu)?;
    let buffer = writer.into_inner().context(EncodeSnafu)?;
    Ok(Bytes::from(buffer))
}

/// Decode a Parquet file produced by [`encode`].
pub fn decode(bytes: Bytes) -> Result<Artifact, ArtifactError> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(bytes).context(DecodeSnafu)?;

    let metadata: HashMap<String, String> = builder
        .metadata()
        .file_metadata()
        .key_value_metadata()
        .into_iter()
        .flatten()
        .filter(|kv| !kv.key.starts_with(ARROW_KEY_PREFIX))
        .filter_map(|kv| Some((kv.key.clone(), kv.value.clone()?)))
        .collect();

    let schema = Arc::new(Schema::new(builder.schema().fields().clone()));
    let reader = builder.build().context(DecodeSnafu)?;
    let batches = reader
        .collect::<Result<Vec<_>, _>>()
        .context(AssembleSnafu)?;
    let batch = concat_batches(&schema, &batches).context(AssembleSnafu)?;

    Ok(Artifact { batch, metadata })
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Float64Array, TimestampMicrosecondArray};
    use arrow::datatypes::{DataType, Field, TimeUnit};

    fn sample() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new(
                "interval_time",
                DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
                false,
            ),
            Field::new("reg_close", DataType::Float64, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(
                    TimestampMicrosecondArray::from(vec![0, 60_000_000, 120_000_000])
                        .with_timezone("UTC"),
                ),
                Arc::new(Float64Array::from(vec![Some(1.1), None, Some(1.3)])),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_encode_decode_preserves_rows_and_metadata() {
        let batch = sample();
        let bytes = encode(
            &batch,
            ParquetCompression::Zstd,
            &[
                (TABLE_KEY, "reg_eurusd".to_string()),
                (ENTITY_KEY, "eurusd".to_string()),
                (BYTES_SCANNED_KEY, "4096".to_string()),
            ],
        )
        .unwrap();

        let artifact = decode(bytes).unwrap();
        assert_eq!(artifact.batch, batch);
        assert_eq!(artifact.metadata.get(TABLE_KEY).unwrap(), "reg_eurusd");
        assert_eq!(artifact.bytes_scanned(), Some(4096));
        assert!(artifact.metadata.keys().all(|k| !k.starts_with("ARROW:")));
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let batch = sample();
        let a = encode(&batch, ParquetCompression::Snappy, &[]).unwrap();
        let b = encode(&batch, ParquetCompression::Snappy, &[]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_empty_batch_keeps_schema() {
        let batch = sample().slice(0, 0);
        let artifact = decode(encode(&batch, ParquetCompression::Lz4, &[]).unwrap()).unwrap();
        assert_eq!(artifact.batch.num_rows(), 0);
        assert_eq!(artifact.batch.schema().fields().len(), 2);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode(Bytes::from_static(b"not parquet")).is_err());
    }
}
