//! Common configuration types shared by the avalanche crates.

mod vars;

pub use vars::{InterpolationResult, interpolate};

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::retry::{Backoff, RetryPolicy};

/// Byte size constants (binary/IEC units).
pub const KB: usize = 1024;
pub const MB: usize = 1024 * KB;

/// Metrics configuration for the optional Prometheus endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    /// Address to bind the metrics HTTP server (e.g. "0.0.0.0:9090").
    /// Metrics are still recorded in-process when unset, just not exposed.
    #[serde(default)]
    pub address: Option<String>,
}

/// Parquet compression codec.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ParquetCompression {
    Uncompressed,
    #[default]
    Snappy,
    Gzip,
    Zstd,
    Lz4,
}

/// Retry configuration for warehouse queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Total attempts per query, including the first (1 disables retries).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Upper bound on any single delay, in milliseconds.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Growth factor between consecutive delays.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Add up to 50% random jitter to each delay.
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    1_000
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> bool {
    true
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl RetryConfig {
    /// Build the retry policy described by this configuration.
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Backoff::Exponential {
                initial: Duration::from_millis(self.initial_backoff_ms),
                max: Duration::from_millis(self.max_backoff_ms),
                multiplier: self.multiplier,
            },
        )
        .with_jitter(self.jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_config_defaults_from_empty_yaml() {
        let config: RetryConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.initial_backoff_ms, 1_000);
        assert!(config.jitter);
    }

    #[test]
    fn test_retry_config_builds_policy() {
        let config = RetryConfig {
            max_attempts: 4,
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
            multiplier: 3.0,
            jitter: false,
        };
        let policy = config.policy();
        assert_eq!(policy.max_attempts(), 4);
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(300));
        assert_eq!(policy.delay_for(3), Duration::from_millis(900));
        assert_eq!(policy.delay_for(4), Duration::from_millis(1_000));
    }

    #[test]
    fn test_parquet_compression_parses_lowercase() {
        let c: ParquetCompression = serde_yaml::from_str("zstd").unwrap();
        assert_eq!(c, ParquetCompression::Zstd);
        assert_eq!(ParquetCompression::default(), ParquetCompression::Snappy);
    }

    #[test]
    fn test_metrics_config_rejects_unknown_fields() {
        let result: Result<MetricsConfig, _> = serde_yaml::from_str("port: 9090");
        assert!(result.is_err());
    }
}
