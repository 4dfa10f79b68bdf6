//! Configuration for the avalanche pipeline.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::model::{DateRange, Entity};
pub use avalanche_core::config::{
    InterpolationResult, MetricsConfig, ParquetCompression, RetryConfig, interpolate,
};
pub use avalanche_core::{KB, MB};

/// The warehouse holding the source tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WarehouseConfig {
    /// Root URL of the table files (local path, `gs://`, `s3://`).
    pub url: String,
    /// Storage options (credentials, region, etc.).
    #[serde(default)]
    pub storage_options: HashMap<String, String>,
    /// Name of the time column every table is keyed by.
    #[serde(default = "default_time_key")]
    pub time_key: String,
    /// Name of the per-entity target table; `{entity}` is substituted.
    #[serde(default = "default_target_table")]
    pub target_table: String,
}

fn default_time_key() -> String {
    "interval_time".to_string()
}

fn default_target_table() -> String {
    "targets_{entity}".to_string()
}

/// Where checkpoints and merged datasets are written.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputConfig {
    /// Root URL for `checkpoints/` and `features/`.
    pub url: String,
    #[serde(default)]
    pub storage_options: HashMap<String, String>,
    /// Compression codec for every artifact.
    #[serde(default)]
    pub compression: ParquetCompression,
}

/// Table discovery patterns. `*` matches any run of characters, `?` a single
/// character, and `{entity}` is replaced with the entity code.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiscoveryConfig {
    #[serde(default = "default_include")]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Entity codes used to classify tables. Defaults to `entities`.
    #[serde(default)]
    pub universe: Vec<String>,
}

fn default_include() -> Vec<String> {
    vec!["*_{entity}".to_string(), "*_{entity}_*".to_string()]
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            include: default_include(),
            exclude: Vec::new(),
            universe: Vec::new(),
        }
    }
}

/// Per-table extraction settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtractionConfig {
    /// Tables fetched concurrently for one entity.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Maximum rows returned per table query.
    #[serde(default = "default_row_ceiling")]
    pub row_ceiling: Option<usize>,
    /// Timeout per table, covering every retry attempt.
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    /// Fewer target rows than this fails the entity.
    #[serde(default = "default_min_target_rows")]
    pub min_target_rows: usize,
}

fn default_concurrency() -> usize {
    8
}

fn default_row_ceiling() -> Option<usize> {
    Some(5_000_000)
}

fn default_fetch_timeout_secs() -> u64 {
    600
}

fn default_min_target_rows() -> usize {
    1
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            row_ceiling: default_row_ceiling(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            min_target_rows: default_min_target_rows(),
        }
    }
}

impl ExtractionConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

/// Merge batching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MergeConfig {
    /// Maximum artifacts loaded per batch.
    #[serde(default = "default_merge_batch_size")]
    pub batch_size: usize,
    /// Optional cap on estimated decoded bytes per batch, in MB.
    #[serde(default)]
    pub memory_budget_mb: Option<usize>,
    /// Decoded size estimate as a multiple of artifact size on storage.
    #[serde(default = "default_expansion_factor")]
    pub expansion_factor: f64,
}

fn default_merge_batch_size() -> usize {
    25
}

fn default_expansion_factor() -> f64 {
    4.0
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            batch_size: default_merge_batch_size(),
            memory_budget_mb: None,
            expansion_factor: default_expansion_factor(),
        }
    }
}

impl MergeConfig {
    pub fn memory_budget_bytes(&self) -> Option<u64> {
        self.memory_budget_mb.map(|mb| (mb * MB) as u64)
    }
}

/// Warehouse pricing and the run's spending cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CostConfig {
    /// On-demand price per TiB scanned.
    #[serde(default = "default_usd_per_tib")]
    pub usd_per_tib: f64,
    /// Stop issuing queries once this much has been spent.
    #[serde(default)]
    pub max_cost_usd: Option<f64>,
}

fn default_usd_per_tib() -> f64 {
    6.25
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            usd_per_tib: default_usd_per_tib(),
            max_cost_usd: None,
        }
    }
}

/// Main configuration for avalanche.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Entity codes processed by `full`, in order.
    pub entities: Vec<String>,
    pub date_range: DateRange,
    pub warehouse: WarehouseConfig,
    pub output: OutputConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub merge: MergeConfig,
    #[serde(default)]
    pub cost: CostConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    /// Load configuration from a file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        // Interpolate environment variables
        let result = interpolate(contents);
        if !result.is_ok() {
            return Err(ConfigError::EnvInterpolation {
                message: result.errors.join("\n"),
            });
        }

        let mut config: Config = serde_yaml::from_str(&result.text)
            .map_err(|source| ConfigError::YamlParse { source })?;

        config.normalize();
        config.validate()?;

        Ok(config)
    }

    fn normalize(&mut self) {
        for code in self
            .entities
            .iter_mut()
            .chain(self.discovery.universe.iter_mut())
        {
            *code = code.trim().to_ascii_lowercase();
        }
        if self.discovery.universe.is_empty() {
            self.discovery.universe = self.entities.clone();
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.entities.is_empty() {
            return Err(ConfigError::NoEntities);
        }
        for code in self.entities.iter().chain(&self.discovery.universe) {
            validate_entity_code(code)?;
        }
        if self.date_range.start > self.date_range.end {
            return Err(ConfigError::InvalidDateRange {
                start: self.date_range.start.to_string(),
                end: self.date_range.end.to_string(),
            });
        }
        if self.warehouse.url.is_empty() {
            return Err(ConfigError::EmptyWarehouseUrl);
        }
        if self.output.url.is_empty() {
            return Err(ConfigError::EmptyOutputUrl);
        }
        if self.warehouse.time_key.is_empty() {
            return Err(ConfigError::EmptyTimeKey);
        }
        if self.discovery.include.is_empty() {
            return Err(ConfigError::NoIncludePatterns);
        }

        let positive = [
            ("extraction.concurrency", self.extraction.concurrency > 0),
            ("extraction.fetch_timeout_secs", self.extraction.fetch_timeout_secs > 0),
            ("extraction.row_ceiling", self.extraction.row_ceiling != Some(0)),
            ("merge.batch_size", self.merge.batch_size > 0),
            ("merge.memory_budget_mb", self.merge.memory_budget_mb != Some(0)),
            ("merge.expansion_factor", self.merge.expansion_factor > 0.0),
            ("cost.usd_per_tib", self.cost.usd_per_tib >= 0.0),
            ("retry.max_attempts", self.retry.max_attempts > 0),
        ];
        if let Some((field, _)) = positive.iter().find(|(_, ok)| !ok) {
            return Err(ConfigError::NotPositive {
                field: field.to_string(),
            });
        }

        Ok(())
    }

    /// The configured entities, in processing order.
    pub fn entities(&self) -> Vec<Entity> {
        self.entities
            .iter()
            .map(|code| Entity::new(code.clone(), self.date_range))
            .collect()
    }

    /// Build an entity for `code` with the configured date range.
    pub fn entity(&self, code: &str) -> Result<Entity, ConfigError> {
        let code = code.trim().to_ascii_lowercase();
        validate_entity_code(&code)?;
        Ok(Entity::new(code, self.date_range))
    }
}

/// Entity codes become path segments and table-name segments, so only
/// lowercase ASCII letters and digits are allowed.
fn validate_entity_code(code: &str) -> Result<(), ConfigError> {
    if code.is_empty()
        || !code
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
    {
        return Err(ConfigError::InvalidEntity {
            entity: code.to_string(),
        });
    }
    Ok(())
}

/// Substitute `{entity}` in a name template.
pub fn render_template(template: &str, entity: &str) -> String {
    template.replace("{entity}", entity)
}
