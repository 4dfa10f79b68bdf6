//! Durable per-entity, per-table result storage.
//!
//! Layout under the output root:
//!
//! ```text
//! checkpoints/{entity}/{table}.artifact   one per extracted table
//! checkpoints/{entity}/targets.artifact   the entity's target rows
//! checkpoints/{entity}/_COMPLETE          completion manifest (JSON)
//! checkpoints/{entity}/{table}.artifact.corrupt   quarantined, never listed
//! features/{entity}_merged.artifact       the merged dataset
//! ```
//!
//! Existence of a table artifact means that table is done for the entity.
//! Every write goes through `{path}.tmp` and a rename, so a killed process
//! never leaves a truncated artifact behind under its final name.

pub mod manifest;

pub use manifest::CompletionManifest;

use arrow::array::RecordBatch;
use bytes::Bytes;
use object_store::path::Path;
use snafu::prelude::*;
use tracing::{debug, info, warn};

use avalanche_core::StorageProviderRef;

use crate::artifact::{self, Artifact, BYTES_SCANNED_KEY, ENTITY_KEY, TABLE_KEY};
use crate::config::ParquetCompression;
use crate::error::{
    CheckpointArtifactSnafu, CheckpointError, CheckpointStorageSnafu, CheckpointTaskSnafu,
    ManifestSnafu, ReservedTableSnafu,
};

/// Directory holding per-entity checkpoints.
pub const CHECKPOINT_DIR: &str = "checkpoints";
/// Directory holding merged datasets.
pub const FEATURES_DIR: &str = "features";
/// File extension of every artifact.
pub const ARTIFACT_SUFFIX: &str = ".artifact";
/// Suffix appended to a quarantined artifact.
pub const CORRUPT_SUFFIX: &str = ".corrupt";
/// File name of the target artifact within an entity directory.
pub const TARGETS_FILE: &str = "targets.artifact";
/// File name of the completion marker within an entity directory.
pub const COMPLETE_MARKER: &str = "_COMPLETE";

/// State of an entity's completion marker.
#[derive(Debug, Clone, PartialEq)]
pub enum MarkerStatus {
    /// No marker was written.
    Absent,
    /// The marker and every file it names exist.
    Complete(CompletionManifest),
    /// A marker existed but was invalid and has been deleted. Carries the
    /// manifest when it could still be parsed.
    Stale(Option<CompletionManifest>),
}

/// A table artifact found in an entity's checkpoint directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactInfo {
    pub table: String,
    /// Size on storage, in bytes.
    pub size: u64,
}

/// Reads and writes checkpoint artifacts on a storage root.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    storage: StorageProviderRef,
    compression: ParquetCompression,
}

impl CheckpointStore {
    pub fn new(storage: StorageProviderRef, compression: ParquetCompression) -> Self {
        Self {
            storage,
            compression,
        }
    }

    pub fn storage(&self) -> &StorageProviderRef {
        &self.storage
    }

    fn entity_dir(entity: &str) -> String {
        format!("{CHECKPOINT_DIR}/{entity}")
    }

    /// Path of a table artifact.
    pub fn artifact_path(entity: &str, table: &str) -> Path {
        Path::from(format!(
            "{}/{table}{ARTIFACT_SUFFIX}",
            Self::entity_dir(entity)
        ))
    }

    /// Whether a source table's artifact would land on the target artifact.
    pub fn is_reserved(table: &str) -> bool {
        TARGETS_FILE.strip_suffix(ARTIFACT_SUFFIX) == Some(table)
    }

    /// Path of the target artifact.
    pub fn targets_path(entity: &str) -> Path {
        Path::from(format!("{}/{TARGETS_FILE}", Self::entity_dir(entity)))
    }

    /// Path of the completion marker.
    pub fn marker_path(entity: &str) -> Path {
        Path::from(format!("{}/{COMPLETE_MARKER}", Self::entity_dir(entity)))
    }

    /// Path of the merged dataset.
    pub fn merged_path(entity: &str) -> Path {
        Path::from(format!("{FEATURES_DIR}/{entity}_merged{ARTIFACT_SUFFIX}"))
    }

    async fn exists_at(&self, path: &Path) -> Result<bool, CheckpointError> {
        self.storage
            .exists(path)
            .await
            .context(CheckpointStorageSnafu {
                path: path.to_string(),
            })
    }

    async fn write(
        &self,
        path: &Path,
        batch: RecordBatch,
        metadata: Vec<(&'static str, String)>,
    ) -> Result<u64, CheckpointError> {
        let compression = self.compression;
        let encoded = tokio::task::spawn_blocking(move || {
            artifact::encode(&batch, compression, &metadata)
        })
        .await
        .context(CheckpointTaskSnafu)?
        .context(CheckpointArtifactSnafu {
            path: path.to_string(),
        })?;

        let size = encoded.len() as u64;
        self.storage
            .atomic_write(path, encoded)
            .await
            .context(CheckpointStorageSnafu {
                path: path.to_string(),
            })?;
        Ok(size)
    }

    async fn read(&self, path: &Path) -> Result<Artifact, CheckpointError> {
        let bytes = self
            .storage
            .get(path.clone())
            .await
            .context(CheckpointStorageSnafu {
                path: path.to_string(),
            })?;
        tokio::task::spawn_blocking(move || artifact::decode(bytes))
            .await
            .context(CheckpointTaskSnafu)?
            .context(CheckpointArtifactSnafu {
                path: path.to_string(),
            })
    }

    /// Whether `table` has been extracted for `entity`.
    pub async fn exists(&self, entity: &str, table: &str) -> Result<bool, CheckpointError> {
        self.exists_at(&Self::artifact_path(entity, table)).await
    }

    /// Persist one table's prefixed rows. Returns the artifact size.
    pub async fn save(
        &self,
        entity: &str,
        table: &str,
        batch: RecordBatch,
        bytes_scanned: u64,
    ) -> Result<u64, CheckpointError> {
        ensure!(
            !Self::is_reserved(table),
            ReservedTableSnafu {
                table: table.to_string()
            }
        );
        let path = Self::artifact_path(entity, table);
        let metadata = vec![
            (TABLE_KEY, table.to_string()),
            (ENTITY_KEY, entity.to_string()),
            (BYTES_SCANNED_KEY, bytes_scanned.to_string()),
        ];
        let size = self.write(&path, batch, metadata).await?;
        debug!(entity, table, size, "Saved checkpoint artifact");
        Ok(size)
    }

    /// Load a table artifact.
    pub async fn load(&self, entity: &str, table: &str) -> Result<Artifact, CheckpointError> {
        self.read(&Self::artifact_path(entity, table)).await
    }

    /// Move an undecodable table artifact aside as `{table}.artifact.corrupt`.
    /// It stops being listed, so the table counts as pending again.
    pub async fn quarantine(&self, entity: &str, table: &str) -> Result<(), CheckpointError> {
        let from = Self::artifact_path(entity, table);
        let to = Path::from(format!("{from}{CORRUPT_SUFFIX}"));
        self.storage
            .rename(&from, &to)
            .await
            .context(CheckpointStorageSnafu {
                path: from.to_string(),
            })?;
        warn!(entity, table, path = %to, "Quarantined unreadable artifact");
        Ok(())
    }

    pub async fn targets_exist(&self, entity: &str) -> Result<bool, CheckpointError> {
        self.exists_at(&Self::targets_path(entity)).await
    }

    /// Persist the entity's target rows, columns unprefixed.
    pub async fn save_targets(
        &self,
        entity: &str,
        table: &str,
        batch: RecordBatch,
        bytes_scanned: u64,
    ) -> Result<(), CheckpointError> {
        let metadata = vec![
            (TABLE_KEY, table.to_string()),
            (ENTITY_KEY, entity.to_string()),
            (BYTES_SCANNED_KEY, bytes_scanned.to_string()),
        ];
        self.write(&Self::targets_path(entity), batch, metadata)
            .await?;
        Ok(())
    }

    pub async fn load_targets(&self, entity: &str) -> Result<Artifact, CheckpointError> {
        self.read(&Self::targets_path(entity)).await
    }

    /// Every table artifact of `entity`, sorted by table name. The target
    /// artifact, the marker and leftover temp files are excluded.
    pub async fn list_artifacts(&self, entity: &str) -> Result<Vec<ArtifactInfo>, CheckpointError> {
        let dir = Self::entity_dir(entity);
        let objects = self
            .storage
            .list_with_prefix(&dir)
            .await
            .context(CheckpointStorageSnafu { path: dir.clone() })?;

        let dir_prefix = format!("{dir}/");
        let mut artifacts: Vec<ArtifactInfo> = objects
            .into_iter()
            .filter_map(|object| {
                let name = object.path.as_ref().strip_prefix(&dir_prefix)?;
                if name.contains('/') || name == TARGETS_FILE {
                    return None;
                }
                let table = name.strip_suffix(ARTIFACT_SUFFIX)?;
                Some(ArtifactInfo {
                    table: table.to_string(),
                    size: object.size,
                })
            })
            .collect();
        artifacts.sort_by(|a, b| a.table.cmp(&b.table));
        Ok(artifacts)
    }

    /// Validate the entity's completion marker.
    ///
    /// A marker whose merged dataset or any listed table artifact is missing
    /// is stale, as is one that cannot be parsed. A stale marker is deleted.
    /// Table artifacts are never touched.
    pub async fn marker_status(&self, entity: &str) -> Result<MarkerStatus, CheckpointError> {
        let marker = Self::marker_path(entity);
        let Some(bytes) = self
            .storage
            .get_opt(marker.clone())
            .await
            .context(CheckpointStorageSnafu {
                path: marker.to_string(),
            })?
        else {
            return Ok(MarkerStatus::Absent);
        };

        let manifest = match serde_json::from_slice::<CompletionManifest>(&bytes) {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!(entity, error = %e, "Unreadable completion marker, discarding");
                self.discard_marker(entity).await?;
                return Ok(MarkerStatus::Stale(None));
            }
        };

        if let Some(missing) = self.first_missing(entity, &manifest).await? {
            warn!(
                entity,
                missing = %missing,
                "Stale completion marker, discarding"
            );
            self.discard_marker(entity).await?;
            return Ok(MarkerStatus::Stale(Some(manifest)));
        }

        Ok(MarkerStatus::Complete(manifest))
    }

    /// The entity's completion manifest, if a valid one exists. A stale
    /// marker is deleted and reads as `None`.
    pub async fn completion_manifest(
        &self,
        entity: &str,
    ) -> Result<Option<CompletionManifest>, CheckpointError> {
        match self.marker_status(entity).await? {
            MarkerStatus::Complete(manifest) => Ok(Some(manifest)),
            MarkerStatus::Absent | MarkerStatus::Stale(_) => Ok(None),
        }
    }

    /// Parse the marker without validating or deleting it. A missing or
    /// unreadable marker is `None`.
    pub async fn read_manifest(
        &self,
        entity: &str,
    ) -> Result<Option<CompletionManifest>, CheckpointError> {
        let marker = Self::marker_path(entity);
        let bytes = self
            .storage
            .get_opt(marker.clone())
            .await
            .context(CheckpointStorageSnafu {
                path: marker.to_string(),
            })?;
        Ok(bytes.and_then(|bytes| serde_json::from_slice(&bytes).ok()))
    }

    /// The first file named by `manifest` that no longer exists.
    async fn first_missing(
        &self,
        entity: &str,
        manifest: &CompletionManifest,
    ) -> Result<Option<Path>, CheckpointError> {
        let merged = Self::merged_path(entity);
        if !self.exists_at(&merged).await? {
            return Ok(Some(merged));
        }

        let present: std::collections::HashSet<String> = self
            .list_artifacts(entity)
            .await?
            .into_iter()
            .map(|a| a.table)
            .collect();
        Ok(manifest
            .tables
            .iter()
            .find(|table| !present.contains(*table))
            .map(|table| Self::artifact_path(entity, table)))
    }

    async fn discard_marker(&self, entity: &str) -> Result<(), CheckpointError> {
        let marker = Self::marker_path(entity);
        self.storage
            .delete(&marker)
            .await
            .context(CheckpointStorageSnafu {
                path: marker.to_string(),
            })
    }

    /// Whether a marker file exists, without validating it.
    pub async fn marker_exists(&self, entity: &str) -> Result<bool, CheckpointError> {
        self.exists_at(&Self::marker_path(entity)).await
    }

    /// Whether the entity's merged dataset is final.
    pub async fn entity_complete(&self, entity: &str) -> Result<bool, CheckpointError> {
        Ok(self.completion_manifest(entity).await?.is_some())
    }

    /// Write the completion marker. Only call after the merged dataset has
    /// been persisted.
    pub async fn mark_complete(&self, manifest: &CompletionManifest) -> Result<(), CheckpointError> {
        let json = serde_json::to_vec_pretty(manifest).context(ManifestSnafu)?;
        let marker = Self::marker_path(&manifest.entity);
        self.storage
            .atomic_write(&marker, Bytes::from(json))
            .await
            .context(CheckpointStorageSnafu {
                path: marker.to_string(),
            })?;
        info!(
            entity = %manifest.entity,
            tables = manifest.tables.len(),
            rows = manifest.rows,
            columns = manifest.columns,
            "Marked entity complete"
        );
        Ok(())
    }

    /// Persist the merged dataset. Returns its size.
    pub async fn save_merged(&self, entity: &str, batch: RecordBatch) -> Result<u64, CheckpointError> {
        self.write(
            &Self::merged_path(entity),
            batch,
            vec![(ENTITY_KEY, entity.to_string())],
        )
        .await
    }

    pub async fn load_merged(&self, entity: &str) -> Result<RecordBatch, CheckpointError> {
        Ok(self.read(&Self::merged_path(entity)).await?.batch)
    }

    pub async fn merged_exists(&self, entity: &str) -> Result<bool, CheckpointError> {
        self.exists_at(&Self::merged_path(entity)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Float64Array, Int64Array};
    use arrow::datatypes::{DataType, Field, Schema};
    use avalanche_core::StorageProvider;
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn store(temp_dir: &TempDir) -> CheckpointStore {
        let storage = StorageProvider::for_url(temp_dir.path().to_str().unwrap())
            .await
            .unwrap();
        CheckpointStore::new(Arc::new(storage), ParquetCompression::Snappy)
    }

    fn batch(column: &str) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("interval_time", DataType::Int64, false),
            Field::new(column, DataType::Float64, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(vec![1, 2, 3])),
                Arc::new(Float64Array::from(vec![0.1, 0.2, 0.3])),
            ],
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_save_load_and_exists() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir).await;

        assert!(!store.exists("eurusd", "reg_eurusd").await.unwrap());
        store
            .save("eurusd", "reg_eurusd", batch("reg_close"), 512)
            .await
            .unwrap();
        assert!(store.exists("eurusd", "reg_eurusd").await.unwrap());
        assert!(!store.exists("gbpusd", "reg_eurusd").await.unwrap());

        let artifact = store.load("eurusd", "reg_eurusd").await.unwrap();
        assert_eq!(artifact.batch, batch("reg_close"));
        assert_eq!(artifact.bytes_scanned(), Some(512));
        assert_eq!(artifact.metadata[TABLE_KEY], "reg_eurusd");

        assert!(
            temp_dir
                .path()
                .join("checkpoints/eurusd/reg_eurusd.artifact")
                .exists()
        );
        assert!(
            !temp_dir
                .path()
                .join("checkpoints/eurusd/reg_eurusd.artifact.tmp")
                .exists()
        );
    }

    #[tokio::test]
    async fn test_load_missing_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir).await;
        let err = store.load("eurusd", "nope").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_list_artifacts_excludes_targets_marker_and_temp() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir).await;

        store.save("eurusd", "reg_eurusd", batch("a"), 0).await.unwrap();
        store.save("eurusd", "cov_eurusd_gbpusd", batch("b"), 0).await.unwrap();
        store.save("gbpusd", "reg_gbpusd", batch("c"), 0).await.unwrap();
        store
            .save_targets("eurusd", "targets_eurusd", batch("label"), 0)
            .await
            .unwrap();
        store
            .storage()
            .put(
                &Path::from("checkpoints/eurusd/half_eurusd.artifact.tmp"),
                Bytes::from_static(b"partial"),
            )
            .await
            .unwrap();

        let artifacts = store.list_artifacts("eurusd").await.unwrap();
        let tables: Vec<&str> = artifacts.iter().map(|a| a.table.as_str()).collect();
        assert_eq!(tables, vec!["cov_eurusd_gbpusd", "reg_eurusd"]);
        assert!(artifacts.iter().all(|a| a.size > 0));
        assert!(store.targets_exist("eurusd").await.unwrap());
        assert!(store.list_artifacts("usdjpy").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_completion_marker_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir).await;

        store.save("eurusd", "reg_eurusd", batch("a"), 0).await.unwrap();
        store.save_merged("eurusd", batch("a")).await.unwrap();
        let manifest = CompletionManifest::new("eurusd", vec!["reg_eurusd".into()], 3, 2);
        store.mark_complete(&manifest).await.unwrap();

        assert!(store.entity_complete("eurusd").await.unwrap());
        assert_eq!(
            store.completion_manifest("eurusd").await.unwrap(),
            Some(manifest)
        );
        assert_eq!(store.load_merged("eurusd").await.unwrap(), batch("a"));
    }

    #[tokio::test]
    async fn test_stale_marker_is_deleted_but_artifacts_kept() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir).await;

        store.save("eurusd", "reg_eurusd", batch("a"), 0).await.unwrap();
        let manifest = CompletionManifest::new("eurusd", vec!["reg_eurusd".into()], 3, 2);
        // Marker without a merged dataset.
        store.mark_complete(&manifest).await.unwrap();

        assert_eq!(
            store.marker_status("eurusd").await.unwrap(),
            MarkerStatus::Stale(Some(manifest))
        );
        assert!(!temp_dir.path().join("checkpoints/eurusd/_COMPLETE").exists());
        assert!(store.exists("eurusd", "reg_eurusd").await.unwrap());
        assert_eq!(
            store.marker_status("eurusd").await.unwrap(),
            MarkerStatus::Absent
        );
    }

    #[tokio::test]
    async fn test_marker_with_missing_table_is_stale() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir).await;

        store.save_merged("eurusd", batch("a")).await.unwrap();
        let manifest = CompletionManifest::new("eurusd", vec!["reg_eurusd".into()], 3, 2);
        store.mark_complete(&manifest).await.unwrap();

        assert!(!store.entity_complete("eurusd").await.unwrap());
        assert!(store.merged_exists("eurusd").await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_marker_is_discarded() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir).await;

        store
            .storage()
            .put(
                &CheckpointStore::marker_path("eurusd"),
                Bytes::from_static(b"{not json"),
            )
            .await
            .unwrap();
        assert_eq!(
            store.marker_status("eurusd").await.unwrap(),
            MarkerStatus::Stale(None)
        );
        assert!(!temp_dir.path().join("checkpoints/eurusd/_COMPLETE").exists());
    }

    #[tokio::test]
    async fn test_quarantined_artifact_is_no_longer_listed() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir).await;

        store.save("eurusd", "reg_eurusd", batch("a"), 0).await.unwrap();
        store.quarantine("eurusd", "reg_eurusd").await.unwrap();

        assert!(!store.exists("eurusd", "reg_eurusd").await.unwrap());
        assert!(store.list_artifacts("eurusd").await.unwrap().is_empty());
        assert!(
            temp_dir
                .path()
                .join("checkpoints/eurusd/reg_eurusd.artifact.corrupt")
                .exists()
        );
    }

    #[tokio::test]
    async fn test_table_named_like_target_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir).await;

        store
            .save_targets("eurusd", "targets_eurusd", batch("label"), 0)
            .await
            .unwrap();
        let err = store
            .save("eurusd", "targets", batch("a"), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, CheckpointError::ReservedTable { .. }));

        let target = store.load_targets("eurusd").await.unwrap();
        assert_eq!(target.batch, batch("label"));
        assert!(store.list_artifacts("eurusd").await.unwrap().is_empty());
    }
}
