//! CLI argument parsing with clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::DEFAULT_CONFIG_PATH;

#[derive(Parser)]
#[command(name = "autoban")]
#[command(author, version, about = "Keeps kernel firewall sets in sync with a block-list")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH, global = true)]
    pub config: PathBuf,

    /// Quiet mode (errors only)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Verbose mode (debug output)
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the synchronization daemon until SIGINT/SIGTERM
    Run,

    /// Run a single synchronization cycle
    Sync {
        /// Print the planned changes without applying them
        #[arg(long)]
        dry_run: bool,
    },

    /// Merge entries from FILE (or stdin) and print the disjoint ranges
    Merge {
        /// Print the minimal CIDR cover instead of ranges
        #[arg(long)]
        cidr: bool,

        /// Input file, one entry per line (default: stdin)
        file: Option<PathBuf>,
    },

    /// Show the state of the enforcing table
    Status,

    /// Remove the enforcing table, sets and rules
    Disable,

    /// Print the default configuration
    PrintConfig,

    /// Show version information
    Version,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_sync_dry_run() {
        let cli = Cli::try_parse_from(["autoban", "sync", "--dry-run"]).unwrap();
        assert!(matches!(cli.command, Commands::Sync { dry_run: true }));
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_PATH));
    }

    #[test]
    fn test_parse_merge_with_file() {
        let cli = Cli::try_parse_from(["autoban", "merge", "--cidr", "list.txt", "-v"]).unwrap();
        match cli.command {
            Commands::Merge { cidr, file } => {
                assert!(cidr);
                assert_eq!(file, Some(PathBuf::from("list.txt")));
            }
            _ => panic!("expected merge"),
        }
        assert!(cli.verbose);
    }

    #[test]
    fn test_global_config_flag() {
        let cli = Cli::try_parse_from(["autoban", "-c", "/tmp/a.yaml", "status"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("/tmp/a.yaml"));
        assert!(matches!(cli.command, Commands::Status));
    }

    #[test]
    fn test_print_config_kebab_case() {
        let cli = Cli::try_parse_from(["autoban", "print-config"]).unwrap();
        assert!(matches!(cli.command, Commands::PrintConfig));
    }
}
