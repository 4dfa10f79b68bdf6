//! Avalanche CLI: checkpointed extraction of wide feature tables.

use std::net::SocketAddr;
use std::process::ExitCode;

use clap::Parser;
use snafu::ResultExt;
use tracing::info;

use avalanche::error::AddressParseSnafu;
use avalanche::{CliArgs, Command, Config, Orchestrator, PipelineError, init_metrics, init_tracing};

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let args = CliArgs::parse();

    let config = match Config::from_file(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            return ExitCode::FAILURE;
        }
    };

    match run(config, args.command).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Run failed: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Returns whether every entity succeeded.
async fn run(config: Config, command: Command) -> Result<bool, PipelineError> {
    let addr = config
        .metrics
        .address
        .as_deref()
        .map(str::parse::<SocketAddr>)
        .transpose()
        .context(AddressParseSnafu)?;
    init_metrics(addr).await?;

    let entity = match &command {
        Command::Single { entity } => Some(config.entity(entity)?),
        _ => None,
    };

    info!(
        entities = config.entities.len(),
        range = %config.date_range,
        "Starting avalanche"
    );
    let orchestrator = Orchestrator::from_config(config).await?;

    match command {
        Command::DryRun => {
            println!("{}", orchestrator.dry_run().await?);
            Ok(true)
        }
        Command::Count => {
            print!("{}", orchestrator.count().await?);
            Ok(true)
        }
        Command::Single { .. } => {
            let Some(entity) = entity else {
                return Ok(false);
            };
            let summary = orchestrator.run_entity(&entity).await?;
            println!("{summary}");
            Ok(!summary.is_failed())
        }
        Command::Full => {
            let summary = orchestrator.run_all().await;
            println!("{summary}");
            Ok(!summary.has_failures())
        }
    }
}
