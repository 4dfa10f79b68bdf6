//! avalanche-core: Shared components for the avalanche extraction pipeline.
//!
//! This crate contains infrastructure the pipeline crate builds on:
//!
//! - `storage/` - Object storage abstraction (GCS, S3, local) with atomic writes
//! - `metrics/` - Internal events and the optional Prometheus endpoint
//! - `config/` - Shared configuration types and environment variable interpolation
//! - `retry` - Bounded retry policy with pluggable backoff
//! - `error` - Common error types
//! - `tracing` - Subscriber initialization for the CLI

pub mod config;
pub mod error;
pub mod metrics;
pub mod retry;
pub mod storage;
pub mod tracing;

// Re-export commonly used items
pub use config::{KB, MB, MetricsConfig, ParquetCompression, RetryConfig, interpolate};
pub use error::{ConfigError, MetricsError, StorageError};
pub use metrics::{init_global as init_metrics, init_test as init_metrics_test};
pub use retry::{Backoff, RetryPolicy};
pub use storage::{ObjectInfo, StorageProvider, StorageProviderRef};
pub use tracing::init_tracing;
