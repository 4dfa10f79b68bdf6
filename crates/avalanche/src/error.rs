//! Error types for the avalanche pipeline.

use snafu::prelude::*;

// Re-export common errors
pub use avalanche_core::error::{ConfigError, MetricsError, StorageError};

/// Errors from Parquet artifact encoding and decoding.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ArtifactError {
    /// Failed to encode a record batch as Parquet.
    #[snafu(display("Failed to encode artifact: {source}"))]
    Encode {
        source: parquet::errors::ParquetError,
    },

    /// Failed to decode Parquet bytes.
    #[snafu(display("Failed to decode artifact: {source}"))]
    Decode {
        source: parquet::errors::ParquetError,
    },

    /// Decoded batches could not be assembled.
    #[snafu(display("Failed to assemble decoded batches: {source}"))]
    Assemble { source: arrow::error::ArrowError },
}

/// Errors returned by a [`QueryService`](crate::warehouse::QueryService).
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum QueryError {
    /// The table does not exist in the warehouse.
    #[snafu(display("Table '{table}' not found"))]
    TableNotFound { table: String },

    /// A requested column does not exist in the table.
    #[snafu(display("Column '{column}' not found in table '{table}'"))]
    ColumnNotFound { table: String, column: String },

    /// The time key has a type that cannot be range-filtered.
    #[snafu(display("Time key of table '{table}' has unsupported type {data_type}"))]
    UnsupportedTimeKey { table: String, data_type: String },

    /// Underlying storage request failed.
    #[snafu(display("Storage error reading '{table}': {source}"))]
    WarehouseStorage { table: String, source: StorageError },

    /// Table data could not be decoded.
    #[snafu(display("Failed to read table '{table}': {source}"))]
    Read {
        table: String,
        source: parquet::errors::ParquetError,
    },

    /// The file does not end in a valid Parquet footer.
    #[snafu(display("Invalid Parquet footer in '{table}': {reason}"))]
    Footer { table: String, reason: String },

    /// Filtering or projection failed.
    #[snafu(display("Failed to shape rows of '{table}': {source}"))]
    Compute {
        table: String,
        source: arrow::error::ArrowError,
    },

    /// The service rejected or failed the request.
    #[snafu(display("Query on '{table}' failed: {message}"))]
    Service {
        table: String,
        message: String,
        retryable: bool,
    },

    /// A blocking decode task panicked or was cancelled.
    #[snafu(display("Query task failed: {source}"))]
    QueryTask { source: tokio::task::JoinError },
}

impl QueryError {
    /// Whether the same request could succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            QueryError::WarehouseStorage { source, .. } => source.is_transient(),
            QueryError::Service { retryable, .. } => *retryable,
            _ => false,
        }
    }
}

/// Errors from the checkpoint store.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CheckpointError {
    /// Storage request failed.
    #[snafu(display("Checkpoint storage error at '{path}': {source}"))]
    CheckpointStorage { path: String, source: StorageError },

    /// Artifact could not be encoded or decoded.
    #[snafu(display("Checkpoint artifact error at '{path}': {source}"))]
    CheckpointArtifact { path: String, source: ArtifactError },

    /// Completion manifest could not be serialized.
    #[snafu(display("Failed to serialize completion manifest: {source}"))]
    Manifest { source: serde_json::Error },

    /// The table name collides with the target artifact.
    #[snafu(display("Table '{table}' collides with the target checkpoint"))]
    ReservedTable { table: String },

    /// A blocking encode/decode task panicked or was cancelled.
    #[snafu(display("Checkpoint task failed: {source}"))]
    CheckpointTask { source: tokio::task::JoinError },
}

impl CheckpointError {
    /// Check if this error represents a missing checkpoint.
    pub fn is_not_found(&self) -> bool {
        match self {
            CheckpointError::CheckpointStorage { source, .. } => source.is_not_found(),
            _ => false,
        }
    }
}

/// Errors that abort a single table's extraction. They are recorded on the
/// table's result and never propagate past the worker pool.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ExtractError {
    /// Warehouse query failed after retries.
    #[snafu(display("{source}"))]
    Fetch { source: QueryError },

    /// Query did not finish within the per-table timeout.
    #[snafu(display("Timed out after {timeout:?}"))]
    Timeout { timeout: std::time::Duration },

    /// The run's cost budget was spent before the query was issued.
    #[snafu(display("Cost budget exhausted (${spent_usd:.2} of ${budget_usd:.2})"))]
    BudgetExhausted { spent_usd: f64, budget_usd: f64 },

    /// Column renaming failed.
    #[snafu(display("Failed to prefix columns: {source}"))]
    Prefix { source: arrow::error::ArrowError },

    /// Persisting the result failed.
    #[snafu(display("{source}"))]
    Save { source: CheckpointError },

    /// The worker task panicked.
    #[snafu(display("Worker failed: {source}"))]
    Worker { source: tokio::task::JoinError },
}

/// Errors from the merge engine.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MergeError {
    /// The accumulator lacks the join key.
    #[snafu(display("Target dataset has no time key column '{column}'"))]
    TargetTimeKey { column: String },

    /// Checkpoint enumeration or persistence failed.
    #[snafu(display("Merge checkpoint error: {source}"))]
    MergeCheckpoint { source: CheckpointError },

    /// The left join itself failed.
    #[snafu(display("Join with '{table}' failed: {source}"))]
    Join {
        table: String,
        source: arrow::error::ArrowError,
    },
}

/// Top-level pipeline errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PipelineError {
    /// Configuration error.
    #[snafu(display("Configuration error: {source}"))]
    Config { source: ConfigError },

    /// Storage error.
    #[snafu(display("Storage error: {source}"))]
    Storage { source: StorageError },

    /// Query service error outside a single table's extraction.
    #[snafu(display("Query error: {source}"))]
    Query { source: QueryError },

    /// Checkpoint error.
    #[snafu(display("Checkpoint error: {source}"))]
    Checkpoint { source: CheckpointError },

    /// Merge error.
    #[snafu(display("Merge error: {source}"))]
    Merge { source: MergeError },

    /// Failed to parse metrics address.
    #[snafu(display("Failed to parse metrics address: {source}"))]
    AddressParse { source: std::net::AddrParseError },

    /// Metrics error.
    #[snafu(display("Metrics error: {source}"))]
    Metrics { source: MetricsError },
}

impl From<StorageError> for PipelineError {
    fn from(source: StorageError) -> Self {
        PipelineError::Storage { source }
    }
}

impl From<ConfigError> for PipelineError {
    fn from(source: ConfigError) -> Self {
        PipelineError::Config { source }
    }
}

impl From<QueryError> for PipelineError {
    fn from(source: QueryError) -> Self {
        PipelineError::Query { source }
    }
}

impl From<CheckpointError> for PipelineError {
    fn from(source: CheckpointError) -> Self {
        PipelineError::Checkpoint { source }
    }
}

impl From<MergeError> for PipelineError {
    fn from(source: MergeError) -> Self {
        PipelineError::Merge { source }
    }
}

impl From<MetricsError> for PipelineError {
    fn from(source: MetricsError) -> Self {
        PipelineError::Metrics { source }
    }
}

impl From<QueryError> for ExtractError {
    fn from(source: QueryError) -> Self {
        ExtractError::Fetch { source }
    }
}

impl From<CheckpointError> for ExtractError {
    fn from(source: CheckpointError) -> Self {
        ExtractError::Save { source }
    }
}

impl From<CheckpointError> for MergeError {
    fn from(source: CheckpointError) -> Self {
        MergeError::MergeCheckpoint { source }
    }
}
