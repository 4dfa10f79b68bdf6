//! Pipeline orchestration.
//!
//! Entities are processed strictly one after another. For each entity:
//!
//! 1. A valid completion marker short-circuits everything.
//! 2. The target table is fetched (or loaded from its checkpoint).
//! 3. Source tables are discovered and classified. An entity that was merged
//!    before (stale marker, or merged dataset without a marker) reuses that
//!    run's table list instead, so only artifacts that went missing are
//!    fetched again.
//! 4. Tables with an existing artifact are skipped; columns are resolved for
//!    the rest in one bulk call.
//! 5. Pending tables are extracted by the worker pool.
//! 6. Every artifact is merged onto the target and the marker is written.
//!
//! A failed target fetch is the only way an entity fails. Table failures
//! are counted and the entity still completes without them.

pub mod events;
pub mod summary;

pub use events::{EntityState, EventBus, PipelineEvent};
pub use summary::{
    CategoryCount, CountReport, DryRunReport, EntityCount, EntityEstimate, EntitySummary,
    RunSummary, TableCounts,
};

use arrow::array::RecordBatch;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use avalanche_core::{StorageProvider, StorageProviderRef, emit};

use crate::checkpoint::{CheckpointStore, MarkerStatus};
use crate::columns::ColumnCache;
use crate::config::{Config, render_template};
use crate::cost::CostAccountant;
use crate::error::{ExtractError, PipelineError, QueryError};
use crate::extract::{AcceptedColumns, ExtractionPool, PoolOptions, WorkItem, fetch_bounded};
use crate::merge::MergeEngine;
use crate::metrics::{CostEstimate, EntityProcessed};
use crate::model::{Entity, SourceTable};
use crate::warehouse::{FetchRequest, ParquetWarehouse, QueryServiceRef, TablePattern};

/// Why an entity's target could not be obtained.
enum TargetFailure {
    Fetch(ExtractError),
    TooFewRows { rows: usize, min: usize },
}

impl std::fmt::Display for TargetFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetFailure::Fetch(e) => write!(f, "target fetch failed: {e}"),
            TargetFailure::TooFewRows { rows, min } => {
                write!(f, "target has {rows} rows, at least {min} required")
            }
        }
    }
}

/// Drives entities through extraction and merge.
pub struct Orchestrator {
    config: Config,
    service: QueryServiceRef,
    checkpoints: CheckpointStore,
    columns: ColumnCache,
    cost: Arc<CostAccountant>,
    events: EventBus,
    pool: ExtractionPool,
    merger: MergeEngine,
}

impl Orchestrator {
    /// Build an orchestrator reading Parquet tables from the configured
    /// warehouse URL and writing to the configured output URL.
    pub async fn from_config(config: Config) -> Result<Self, PipelineError> {
        let warehouse = StorageProvider::for_url_with_options(
            &config.warehouse.url,
            config.warehouse.storage_options.clone(),
        )
        .await?;
        let output = StorageProvider::for_url_with_options(
            &config.output.url,
            config.output.storage_options.clone(),
        )
        .await?;
        info!(
            warehouse = %warehouse.canonical_url(),
            output = %output.canonical_url(),
            "Initialized storage"
        );

        let service: QueryServiceRef = Arc::new(ParquetWarehouse::new(Arc::new(warehouse)));
        Ok(Self::new(config, service, Arc::new(output)))
    }

    /// Build an orchestrator over any query service.
    pub fn new(config: Config, service: QueryServiceRef, output: StorageProviderRef) -> Self {
        let checkpoints = CheckpointStore::new(output, config.output.compression);
        let cost = Arc::new(CostAccountant::from_config(&config.cost));
        let events = EventBus::new();
        let columns = ColumnCache::new(service.clone(), config.warehouse.time_key.clone());
        let pool = ExtractionPool::new(
            service.clone(),
            checkpoints.clone(),
            cost.clone(),
            events.clone(),
            PoolOptions::from_config(&config),
        );
        let merger = MergeEngine::new(
            checkpoints.clone(),
            config.warehouse.time_key.clone(),
            config.merge.clone(),
            events.clone(),
        );

        Self {
            config,
            service,
            checkpoints,
            columns,
            cost,
            events,
            pool,
            merger,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    pub fn cost(&self) -> &Arc<CostAccountant> {
        &self.cost
    }

    pub fn column_cache(&self) -> &ColumnCache {
        &self.columns
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    fn target_table(&self, entity: &Entity) -> String {
        render_template(&self.config.warehouse.target_table, &entity.code)
    }

    /// Source tables for `entity`: every include pattern, minus excludes and
    /// the target table, sorted and classified.
    pub async fn discover(&self, entity: &Entity) -> Result<Vec<SourceTable>, QueryError> {
        let code = entity.code.as_str();
        let target = self.target_table(entity);
        let excludes: Vec<TablePattern> = self
            .config
            .discovery
            .exclude
            .iter()
            .map(|pattern| TablePattern::new(&render_template(pattern, code)))
            .collect();

        let mut names = BTreeSet::new();
        for pattern in &self.config.discovery.include {
            names.extend(
                self.service
                    .list_tables(&render_template(pattern, code))
                    .await?,
            );
        }

        Ok(names
            .into_iter()
            .filter(|name| *name != target && !excludes.iter().any(|p| p.matches(name)))
            .filter(|name| {
                let reserved = CheckpointStore::is_reserved(name);
                if reserved {
                    warn!(entity = %entity, table = %name, "Skipping table with reserved name");
                }
                !reserved
            })
            .map(|name| SourceTable::classify(&name, code, &self.config.discovery.universe))
            .collect())
    }

    fn classify_all(&self, code: &str, names: &[String]) -> Vec<SourceTable> {
        names
            .iter()
            .map(|name| SourceTable::classify(name, code, &self.config.discovery.universe))
            .collect()
    }

    async fn artifact_names(&self, code: &str) -> Result<Vec<String>, PipelineError> {
        Ok(self
            .checkpoints
            .list_artifacts(code)
            .await?
            .into_iter()
            .map(|a| a.table)
            .collect())
    }

    fn transition(&self, entity: &Entity, state: &mut EntityState, to: EntityState) {
        info!(entity = %entity, from = %state, to = %to, "Entity state changed");
        self.events.publish(PipelineEvent::StateChanged {
            entity: entity.code.clone(),
            from: *state,
            to,
        });
        *state = to;
    }

    fn finish(&self, entity: &Entity, start: Instant, mut summary: EntitySummary) -> EntitySummary {
        summary.elapsed = start.elapsed();
        summary.bytes_scanned = self.cost.entity_bytes(&entity.code);
        summary.cost_usd = self.cost.entity_cost_usd(&entity.code);

        emit!(EntityProcessed {
            entity: entity.code.clone(),
            success: !summary.is_failed(),
        });
        emit!(CostEstimate {
            usd: self.cost.total_cost_usd(),
        });
        self.events.publish(PipelineEvent::EntityFinished {
            entity: entity.code.clone(),
            state: summary.state,
            cost_usd: summary.cost_usd,
        });
        summary
    }

    /// The target rows, from their checkpoint or from the warehouse.
    /// Infrastructure errors are `Err`; an unusable target is `Ok(Err(..))`.
    async fn target(
        &self,
        entity: &Entity,
    ) -> Result<Result<RecordBatch, TargetFailure>, PipelineError> {
        let code = entity.code.as_str();
        if self.checkpoints.targets_exist(code).await? {
            debug!(entity = %entity, "Loading checkpointed target");
            return Ok(Ok(self.checkpoints.load_targets(code).await?.batch));
        }

        if let Err(e) = self.cost.check_budget() {
            return Ok(Err(TargetFailure::Fetch(e)));
        }
        let table = self.target_table(entity);
        let columns = self.columns.columns_for(&table).await?;
        let request = FetchRequest {
            table: table.clone(),
            columns,
            time_key: self.config.warehouse.time_key.clone(),
            range: entity.date_range,
            row_ceiling: self.config.extraction.row_ceiling,
        };
        let fetched = match fetch_bounded(
            self.service.as_ref(),
            &request,
            &self.config.retry.policy(),
            self.config.extraction.fetch_timeout(),
        )
        .await
        {
            Ok(fetched) => fetched,
            Err(e) => return Ok(Err(TargetFailure::Fetch(e))),
        };
        self.cost.record(code, &table, fetched.bytes_scanned);

        let rows = fetched.batch.num_rows();
        let min = self.config.extraction.min_target_rows;
        if rows < min {
            return Ok(Err(TargetFailure::TooFewRows { rows, min }));
        }

        self.checkpoints
            .save_targets(code, &table, fetched.batch.clone(), fetched.bytes_scanned)
            .await?;
        info!(entity = %entity, table = %table, rows, "Fetched target");
        Ok(Ok(fetched.batch))
    }

    /// Process one entity end to end.
    ///
    /// Returns `Err` only for infrastructure failures (checkpoint storage,
    /// column metadata, discovery). Table failures are counted in the
    /// summary; a target failure yields an `EntityFailed` summary.
    pub async fn run_entity(&self, entity: &Entity) -> Result<EntitySummary, PipelineError> {
        let start = Instant::now();
        let code = entity.code.as_str();
        let mut state = EntityState::NotStarted;
        info!(entity = %entity, range = %entity.date_range, "Processing entity");

        // An earlier run that got as far as merging fixed the table list.
        let previous = match self.checkpoints.marker_status(code).await? {
            MarkerStatus::Complete(manifest) => {
                info!(
                    entity = %entity,
                    completed_at = %manifest.completed_at,
                    "Entity already complete, skipping"
                );
                let summary = EntitySummary {
                    tables: TableCounts {
                        cached: manifest.tables.len(),
                        ..TableCounts::default()
                    },
                    rows: manifest.rows,
                    columns: manifest.columns,
                    from_marker: true,
                    ..EntitySummary::new(code, EntityState::Complete)
                };
                return Ok(self.finish(entity, start, summary));
            }
            MarkerStatus::Stale(Some(manifest)) => Some(manifest.tables),
            MarkerStatus::Stale(None) => Some(self.artifact_names(code).await?),
            MarkerStatus::Absent => {
                if self.checkpoints.merged_exists(code).await? {
                    Some(self.artifact_names(code).await?)
                } else {
                    None
                }
            }
        };

        let target = match self.target(entity).await? {
            Ok(target) => target,
            Err(failure) => {
                error!(entity = %entity, reason = %failure, "Entity failed");
                self.transition(entity, &mut state, EntityState::EntityFailed);
                return Ok(self.finish(entity, start, EntitySummary::failed(code, failure)));
            }
        };

        let tables = match previous {
            Some(names) => {
                info!(
                    entity = %entity,
                    tables = names.len(),
                    "Entity was merged before, reusing its table list"
                );
                self.classify_all(code, &names)
            }
            None => self.discover(entity).await?,
        };
        self.transition(entity, &mut state, EntityState::TablesResolved);

        let cached: HashSet<String> = self.artifact_names(code).await?.into_iter().collect();
        let (done, pending): (Vec<SourceTable>, Vec<SourceTable>) =
            tables.into_iter().partition(|t| cached.contains(&t.name));
        info!(
            entity = %entity,
            cached = done.len(),
            pending = pending.len(),
            "Checked checkpoints"
        );
        self.transition(entity, &mut state, EntityState::TablesChecked);

        let names: Vec<String> = pending.iter().map(|t| t.name.clone()).collect();
        let mut column_sets = self.columns.resolve(&names).await?;
        let items: Vec<WorkItem> = pending
            .into_iter()
            .map(|table| WorkItem {
                columns: column_sets.remove(&table.name).unwrap_or_default(),
                table,
            })
            .collect();

        let accepted = Arc::new(AcceptedColumns::seeded(
            target.schema().fields().iter().map(|f| f.name().clone()),
        ));
        self.transition(entity, &mut state, EntityState::Extracting);
        let results = self.pool.run(entity, items, accepted).await;
        let tables = TableCounts::from_results(&results, done.len());
        if tables.errored > 0 {
            warn!(
                entity = %entity,
                errored = tables.errored,
                "Some tables failed; delete the completion marker and merged dataset to retry them"
            );
        }

        self.transition(entity, &mut state, EntityState::Merging);
        let outcome = self.merger.merge(code, target).await?;
        self.transition(entity, &mut state, EntityState::Complete);
        info!(
            entity = %entity,
            rows = outcome.dataset.num_rows(),
            columns = outcome.dataset.num_columns(),
            %tables,
            merge_skipped = outcome.skipped,
            "Entity complete"
        );
        if !outcome.unreadable.is_empty() {
            warn!(
                entity = %entity,
                tables = ?outcome.unreadable,
                "Unreadable artifacts quarantined; delete the completion marker and merged dataset to fetch them again"
            );
        }

        let summary = EntitySummary {
            tables,
            results,
            merge_skipped: outcome.skipped,
            unreadable: outcome.unreadable,
            rows: outcome.dataset.num_rows(),
            columns: outcome.dataset.num_columns(),
            ..EntitySummary::new(code, EntityState::Complete)
        };
        Ok(self.finish(entity, start, summary))
    }

    /// Process every configured entity in order. An entity that hits an
    /// infrastructure error is reported as failed and the run continues.
    pub async fn run_all(&self) -> RunSummary {
        let start = Instant::now();
        let mut entities = Vec::with_capacity(self.config.entities.len());
        for entity in self.config.entities() {
            let summary = match self.run_entity(&entity).await {
                Ok(summary) => summary,
                Err(e) => {
                    error!(entity = %entity, error = %e, "Entity aborted");
                    let mut state = EntityState::NotStarted;
                    self.transition(&entity, &mut state, EntityState::EntityFailed);
                    self.finish(&entity, Instant::now(), EntitySummary::failed(&entity.code, e))
                }
            };
            entities.push(summary);
        }

        RunSummary {
            entities,
            total_bytes: self.cost.total_bytes(),
            total_cost_usd: self.cost.total_cost_usd(),
            elapsed: start.elapsed(),
        }
    }

    /// Estimate what a full run would scan. Issues only metadata and
    /// estimate calls; nothing is fetched or written.
    pub async fn dry_run(&self) -> Result<DryRunReport, PipelineError> {
        let mut report = DryRunReport::default();
        for entity in self.config.entities() {
            report.entities.push(self.estimate_entity(&entity).await?);
        }
        Ok(report)
    }

    async fn estimate_entity(&self, entity: &Entity) -> Result<EntityEstimate, PipelineError> {
        let code = entity.code.as_str();
        let marker = self.checkpoints.marker_exists(code).await?;
        let merged = self.checkpoints.merged_exists(code).await?;
        if marker && merged {
            return Ok(EntityEstimate {
                entity: code.to_string(),
                complete: true,
                ..EntityEstimate::default()
            });
        }

        // Mirrors run_entity: a previously merged entity keeps its table list.
        let artifacts = self.artifact_names(code).await?;
        let cached: HashSet<String> = artifacts.iter().cloned().collect();
        let tables = if marker || merged {
            match self.checkpoints.read_manifest(code).await? {
                Some(manifest) => self.classify_all(code, &manifest.tables),
                None => self.classify_all(code, &artifacts),
            }
        } else {
            self.discover(entity).await?
        };
        let mut pending: Vec<String> = tables
            .iter()
            .map(|t| t.name.clone())
            .filter(|name| !cached.contains(name))
            .collect();
        let pending_tables = pending.len();
        if !self.checkpoints.targets_exist(code).await? {
            pending.push(self.target_table(entity));
        }

        let column_sets = self.columns.resolve(&pending).await?;
        let mut estimate = EntityEstimate {
            entity: code.to_string(),
            tables: tables.len(),
            cached: tables.len() - pending_tables,
            pending: pending_tables,
            ..EntityEstimate::default()
        };
        for table in &pending {
            let columns = column_sets.get(table).cloned().unwrap_or_default();
            if columns.is_empty() && *table != self.target_table(entity) {
                continue;
            }
            let request = FetchRequest {
                table: table.clone(),
                columns,
                time_key: self.config.warehouse.time_key.clone(),
                range: entity.date_range,
                row_ceiling: self.config.extraction.row_ceiling,
            };
            match self.service.estimate(&request).await {
                Ok(bytes) => estimate.estimated_bytes += bytes,
                Err(e) => estimate.errors.push((table.clone(), e.to_string())),
            }
        }
        estimate.estimated_cost_usd = self.cost.cost_of(estimate.estimated_bytes);
        info!(
            entity = %entity,
            pending = estimate.pending,
            bytes = estimate.estimated_bytes,
            cost_usd = estimate.estimated_cost_usd,
            "Estimated entity"
        );
        Ok(estimate)
    }

    /// Count discovered tables and their columns by category.
    pub async fn count(&self) -> Result<CountReport, PipelineError> {
        let mut report = CountReport::default();
        for entity in self.config.entities() {
            let tables = self.discover(&entity).await?;
            let names: Vec<String> = tables.iter().map(|t| t.name.clone()).collect();
            let column_sets = self.columns.resolve(&names).await?;

            let mut count = EntityCount {
                entity: entity.code.clone(),
                ..EntityCount::default()
            };
            for table in &tables {
                let entry = count.by_category.entry(table.category).or_default();
                entry.tables += 1;
                entry.columns += column_sets.get(&table.name).map_or(0, Vec::len);
            }
            report.entities.push(count);
        }
        Ok(report)
    }
}
