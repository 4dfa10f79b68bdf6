//! Command-line interface.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(version, about)]
pub struct CliArgs {
    /// Path to the configuration file
    #[arg(short, long)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Estimate bytes scanned and cost without fetching anything
    DryRun,
    /// Count discovered tables and columns per entity and category
    Count,
    /// Process a single entity
    Single {
        /// Entity code, e.g. eurusd
        entity: String,
    },
    /// Process every configured entity
    Full,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_subcommands() {
        let args = CliArgs::parse_from(["avalanche", "-c", "run.yaml", "single", "eurusd"]);
        assert_eq!(args.config, PathBuf::from("run.yaml"));
        assert_eq!(
            args.command,
            Command::Single {
                entity: "eurusd".into()
            }
        );

        let args = CliArgs::parse_from(["avalanche", "--config", "run.yaml", "dry-run"]);
        assert_eq!(args.command, Command::DryRun);
    }

    #[test]
    fn test_config_is_required() {
        assert!(CliArgs::try_parse_from(["avalanche", "full"]).is_err());
    }
}
