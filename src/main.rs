//! autoban - keeps kernel firewall sets in sync with a block-list.

use anyhow::Result;
use clap::Parser;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use autoban::cli::{Cli, Commands};
use autoban::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = if cli.verbose {
        Level::DEBUG
    } else if cli.quiet {
        Level::ERROR
    } else {
        Level::INFO
    };

    // stdout carries command output (merge results, plans)
    let subscriber = FmtSubscriber::builder()
        .with_writer(std::io::stderr)
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .without_time()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run => autoban::commands::run::run(&cli.config).await,
        Commands::Sync { dry_run } => autoban::commands::sync::run(dry_run, &cli.config).await,
        Commands::Merge { cidr, file } => {
            autoban::commands::merge::run(file.as_deref(), cidr).await
        }
        Commands::Status => autoban::commands::status::run(&cli.config).await,
        Commands::Disable => autoban::commands::disable::run(&cli.config).await,
        Commands::PrintConfig => {
            print!("{}", Config::generate_default_yaml());
            Ok(())
        }
        Commands::Version => {
            println!("autoban {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}
