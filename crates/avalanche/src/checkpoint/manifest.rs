//! Completion manifest written to `_COMPLETE`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default schema version for completion manifests.
fn default_schema_version() -> u32 {
    1
}

/// Content of an entity's completion marker.
///
/// The marker is only valid while every file it names still exists: the
/// merged dataset and each constituent table artifact.
///
/// # Example
///
/// ```json
/// {
///   "schema_version": 1,
///   "entity": "eurusd",
///   "tables": ["cov_eurusd_gbpusd", "reg_eurusd"],
///   "rows": 1440,
///   "columns": 87,
///   "completed_at": "2026-01-28T12:00:00Z"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionManifest {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub entity: String,
    /// Table artifacts the merged dataset was built from.
    pub tables: Vec<String>,
    /// Rows in the merged dataset.
    pub rows: usize,
    /// Columns in the merged dataset, time key included.
    pub columns: usize,
    pub completed_at: DateTime<Utc>,
}

impl CompletionManifest {
    pub fn new(entity: impl Into<String>, tables: Vec<String>, rows: usize, columns: usize) -> Self {
        Self {
            schema_version: default_schema_version(),
            entity: entity.into(),
            tables,
            rows,
            columns,
            completed_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_json_roundtrip() {
        let manifest = CompletionManifest::new("eurusd", vec!["reg_eurusd".into()], 10, 3);
        let json = serde_json::to_string(&manifest).unwrap();
        let parsed: CompletionManifest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, manifest);
    }

    #[test]
    fn test_schema_version_defaults_to_one() {
        let json = r#"{
            "entity": "eurusd",
            "tables": [],
            "rows": 0,
            "columns": 1,
            "completed_at": "2026-01-28T12:00:00Z"
        }"#;
        let parsed: CompletionManifest = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.schema_version, 1);
        assert!(parsed.tables.is_empty());
    }
}
