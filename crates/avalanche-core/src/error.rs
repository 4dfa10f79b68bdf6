//! Common error types shared across the avalanche crates.

use snafu::prelude::*;

// ============ Storage Errors ============

/// Errors that can occur during storage operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StorageError {
    /// Invalid storage URL format.
    #[snafu(display("Invalid storage URL: {url}"))]
    InvalidUrl { url: String },

    /// Object store operation failed.
    #[snafu(display("Storage operation failed: {source}"))]
    ObjectStore { source: object_store::Error },

    /// IO error during storage operations.
    #[snafu(display("IO error: {source}"))]
    Io { source: std::io::Error },

    /// S3 configuration error.
    #[snafu(display("S3 configuration error: {source}"))]
    S3Config { source: object_store::Error },

    /// GCS configuration error.
    #[snafu(display("GCS configuration error: {source}"))]
    GcsConfig { source: object_store::Error },
}

impl StorageError {
    /// Check if this error represents a "not found" condition (404, NoSuchKey, etc.)
    pub fn is_not_found(&self) -> bool {
        match self {
            StorageError::ObjectStore { source } => {
                matches!(source, object_store::Error::NotFound { .. })
            }
            _ => false,
        }
    }

    /// Whether retrying the same request could plausibly succeed.
    ///
    /// Configuration and addressing errors are permanent; missing objects
    /// stay missing.
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::ObjectStore { source } => !matches!(
                source,
                object_store::Error::NotFound { .. }
                    | object_store::Error::InvalidPath { .. }
                    | object_store::Error::NotSupported { .. }
                    | object_store::Error::NotImplemented
                    | object_store::Error::PermissionDenied { .. }
                    | object_store::Error::Unauthenticated { .. }
            ),
            StorageError::Io { .. } => true,
            _ => false,
        }
    }
}

// ============ Config Errors ============

/// Errors that can occur during configuration parsing and validation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// No entities configured.
    #[snafu(display("At least one entity must be configured"))]
    NoEntities,

    /// Entity code is empty or contains characters unsafe for paths.
    #[snafu(display("Invalid entity code '{entity}'"))]
    InvalidEntity { entity: String },

    /// Date range is inverted.
    #[snafu(display("Date range start {start} is after end {end}"))]
    InvalidDateRange { start: String, end: String },

    /// Warehouse URL is empty.
    #[snafu(display("Warehouse URL cannot be empty"))]
    EmptyWarehouseUrl,

    /// Output URL is empty.
    #[snafu(display("Output URL cannot be empty"))]
    EmptyOutputUrl,

    /// Time key column name is empty.
    #[snafu(display("Time key column name cannot be empty"))]
    EmptyTimeKey,

    /// No table include patterns.
    #[snafu(display("Discovery needs at least one include pattern"))]
    NoIncludePatterns,

    /// A numeric setting must be positive.
    #[snafu(display("'{field}' must be greater than zero"))]
    NotPositive { field: String },

    /// Environment variable interpolation failed.
    #[snafu(display("Environment variable interpolation failed:\n{message}"))]
    EnvInterpolation { message: String },

    /// Failed to parse YAML configuration.
    #[snafu(display("Failed to parse YAML: {source}"))]
    YamlParse { source: serde_yaml::Error },

    /// Failed to read configuration file.
    #[snafu(display("Failed to read configuration file {}: {source}", path.display()))]
    ReadFile {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
}

// ============ Metrics Errors ============

/// Errors that can occur during metrics initialization.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MetricsError {
    /// Failed to initialize Prometheus recorder.
    #[snafu(display("Failed to initialize Prometheus recorder"))]
    PrometheusInit {
        source: metrics_exporter_prometheus::BuildError,
    },

    /// Metrics server already initialized (double-init attempted).
    #[snafu(display("Metrics server already initialized"))]
    AlreadyInitialized,

    /// Failed to bind the metrics listener.
    #[snafu(display("Failed to bind metrics listener on {addr}: {source}"))]
    Bind {
        addr: std::net::SocketAddr,
        source: std::io::Error,
    },
}
