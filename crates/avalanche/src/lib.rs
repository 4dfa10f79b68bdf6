//! Avalanche: checkpointed extraction of wide feature tables.
//!
//! This crate handles:
//! - Discovering the source tables of each entity in a warehouse
//! - Fetching them concurrently under a timeout, retry policy and cost budget
//! - Checkpointing every table so interrupted runs resume where they stopped
//! - Left-joining all tables onto the entity's target rows in bounded batches

pub mod artifact;
pub mod checkpoint;
pub mod cli;
pub mod columns;
pub mod config;
pub mod cost;
pub mod error;
pub mod extract;
pub mod merge;
pub mod metrics;
pub mod model;
pub mod pipeline;
pub mod warehouse;

// Re-export commonly used items
pub use checkpoint::{CheckpointStore, CompletionManifest};
pub use cli::{CliArgs, Command};
pub use config::Config;
pub use cost::CostAccountant;
pub use error::PipelineError;
pub use model::{DateRange, Entity, PartialResult, SourceTable, TableCategory, TableStatus};
pub use pipeline::{
    CountReport, DryRunReport, EntityState, EntitySummary, Orchestrator, PipelineEvent, RunSummary,
};
pub use warehouse::{InMemoryWarehouse, ParquetWarehouse, QueryService, QueryServiceRef};

pub use avalanche_core::{StorageProvider, StorageProviderRef, init_metrics, init_tracing};
