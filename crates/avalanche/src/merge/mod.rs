//! Batched left-join of an entity's table artifacts onto its target rows.
//!
//! Artifacts are enumerated in lexicographic order and split into batches
//! bounded by count and, optionally, by estimated decoded size. A batch is
//! loaded concurrently, joined artifact by artifact, and dropped before the
//! next batch is loaded, so peak memory is the accumulator plus one batch.

mod join;

pub use join::left_join;

use arrow::array::RecordBatch;
use arrow::compute::can_cast_types;
use futures::future::join_all;
use snafu::prelude::*;
use std::collections::HashSet;
use std::time::Instant;
use tracing::{debug, info, warn};

use avalanche_core::emit;

use crate::artifact::Artifact;
use crate::checkpoint::{ArtifactInfo, CheckpointStore, CompletionManifest};
use crate::config::MergeConfig;
use crate::error::{CheckpointError, JoinSnafu, MergeError, TargetTimeKeySnafu};
use crate::metrics::MergeBatchCompleted;
use crate::pipeline::events::{EventBus, PipelineEvent};

/// Split `artifacts` into batches of at most `batch_size` artifacts and, with
/// a `memory_budget`, at most that many estimated decoded bytes. An artifact
/// whose estimate alone exceeds the budget gets a batch of its own.
pub fn plan_batches(
    artifacts: &[ArtifactInfo],
    batch_size: usize,
    memory_budget: Option<u64>,
    expansion_factor: f64,
) -> Vec<Vec<ArtifactInfo>> {
    let batch_size = batch_size.max(1);
    let mut batches = Vec::new();
    let mut current: Vec<ArtifactInfo> = Vec::new();
    let mut current_bytes = 0u64;

    for artifact in artifacts {
        let estimate = (artifact.size as f64 * expansion_factor).ceil() as u64;
        let over_budget =
            memory_budget.is_some_and(|budget| current_bytes.saturating_add(estimate) > budget);
        if !current.is_empty() && (current.len() >= batch_size || over_budget) {
            batches.push(std::mem::take(&mut current));
            current_bytes = 0;
        }
        current.push(artifact.clone());
        current_bytes = current_bytes.saturating_add(estimate);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

/// Result of merging one entity.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub dataset: RecordBatch,
    /// Table artifacts the dataset was built from, in merge order. Unreadable
    /// artifacts are not among them.
    pub tables: Vec<String>,
    /// Artifacts that contributed at least one column.
    pub joined: usize,
    /// Artifacts skipped: no new columns, no time key, or unreadable.
    pub skipped: usize,
    /// Artifacts that could not be decoded and were quarantined.
    pub unreadable: Vec<String>,
    pub batches: usize,
}

/// Builds the merged dataset for an entity from its checkpoints.
#[derive(Debug, Clone)]
pub struct MergeEngine {
    checkpoints: CheckpointStore,
    time_key: String,
    config: MergeConfig,
    events: EventBus,
}

impl MergeEngine {
    pub fn new(
        checkpoints: CheckpointStore,
        time_key: impl Into<String>,
        config: MergeConfig,
        events: EventBus,
    ) -> Self {
        Self {
            checkpoints,
            time_key: time_key.into(),
            config,
            events,
        }
    }

    /// Join every table artifact of `entity` onto `target`, persist the
    /// result and write the completion marker.
    pub async fn merge(&self, entity: &str, target: RecordBatch) -> Result<MergeOutcome, MergeError> {
        ensure!(
            target.schema().index_of(&self.time_key).is_ok(),
            TargetTimeKeySnafu {
                column: self.time_key.clone(),
            }
        );

        let artifacts = self.checkpoints.list_artifacts(entity).await?;
        let batches = plan_batches(
            &artifacts,
            self.config.batch_size,
            self.config.memory_budget_bytes(),
            self.config.expansion_factor,
        );
        info!(
            entity,
            artifacts = artifacts.len(),
            batches = batches.len(),
            "Merging checkpoints"
        );

        let mut accumulator = target;
        let mut present: HashSet<String> = accumulator
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect();
        let mut joined = 0;
        let mut skipped = 0;
        let mut unreadable = Vec::new();

        for (number, batch) in batches.iter().enumerate() {
            let start = Instant::now();
            let loaded = join_all(
                batch
                    .iter()
                    .map(|artifact| self.checkpoints.load(entity, &artifact.table)),
            )
            .await;

            let mut batch_joined = 0;
            for (info, result) in batch.iter().zip(loaded) {
                // Storage errors abort the merge; only a corrupt artifact is skipped.
                let artifact = match result {
                    Ok(artifact) => artifact,
                    Err(e @ CheckpointError::CheckpointArtifact { .. }) => {
                        warn!(entity, table = %info.table, error = %e, "Unreadable artifact, skipping");
                        self.checkpoints.quarantine(entity, &info.table).await?;
                        unreadable.push(info.table.clone());
                        skipped += 1;
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                };
                match self.join_one(&accumulator, &present, &info.table, &artifact)? {
                    Some(next) => {
                        present.extend(
                            next.schema()
                                .fields()
                                .iter()
                                .skip(accumulator.num_columns())
                                .map(|f| f.name().clone()),
                        );
                        accumulator = next;
                        batch_joined += 1;
                    }
                    None => skipped += 1,
                }
            }
            joined += batch_joined;

            emit!(MergeBatchCompleted {
                entity: entity.to_string(),
                artifacts: batch.len(),
                joined: batch_joined,
                duration: start.elapsed(),
            });
            self.events.publish(PipelineEvent::MergeBatch {
                entity: entity.to_string(),
                batch: number + 1,
                batches: batches.len(),
                joined: batch_joined,
            });
            debug!(
                entity,
                batch = number + 1,
                batches = batches.len(),
                joined = batch_joined,
                columns = accumulator.num_columns(),
                "Merged batch"
            );
        }

        self.checkpoints
            .save_merged(entity, accumulator.clone())
            .await?;
        let tables: Vec<String> = artifacts
            .into_iter()
            .map(|a| a.table)
            .filter(|table| !unreadable.contains(table))
            .collect();
        let manifest = CompletionManifest::new(
            entity,
            tables.clone(),
            accumulator.num_rows(),
            accumulator.num_columns(),
        );
        self.checkpoints.mark_complete(&manifest).await?;

        Ok(MergeOutcome {
            dataset: accumulator,
            tables,
            joined,
            skipped,
            unreadable,
            batches: batches.len(),
        })
    }

    /// Join one artifact onto the accumulator. `None` means it was skipped.
    fn join_one(
        &self,
        accumulator: &RecordBatch,
        present: &HashSet<String>,
        table: &str,
        artifact: &Artifact,
    ) -> Result<Option<RecordBatch>, MergeError> {
        let schema = artifact.batch.schema();
        let Ok(key_index) = schema.index_of(&self.time_key) else {
            warn!(table, time_key = %self.time_key, "Artifact has no time key, skipping");
            return Ok(None);
        };

        let new_columns: Vec<String> = schema
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .filter(|name| name != &self.time_key && !present.contains(name))
            .collect();
        if new_columns.is_empty() {
            debug!(table, "No new columns, skipping");
            return Ok(None);
        }

        let left_type = accumulator
            .schema()
            .field_with_name(&self.time_key)
            .map(|f| f.data_type().clone())
            .ok();
        let right_type = schema.field(key_index).data_type();
        if left_type.is_none_or(|left| !can_cast_types(right_type, &left)) {
            warn!(
                table,
                data_type = %right_type,
                "Time key cannot be aligned with the target, skipping"
            );
            return Ok(None);
        }

        let next = left_join(accumulator, &artifact.batch, &self.time_key, &new_columns)
            .context(JoinSnafu { table })?;
        Ok(Some(next))
    }
}
