//! ZoneSync CLI
//!
//! Command-line interface for ZoneSync - local zone storage and server sync.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use zonesync_core::{Config, SyncClock, TaskExecutor, ZoneRepository};

mod commands;
mod output;

use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "zonesync")]
#[command(about = "ZoneSync - Offline-first zone storage with server sync")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Log to stderr (-v debug, -vv trace); RUST_LOG is used otherwise
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage stored zones
    Zones {
        #[command(subcommand)]
        command: ZoneCommands,
    },
    /// Run one sync cycle with the server
    Sync,
    /// Keep syncing in the background until interrupted
    Watch,
    /// Show storage and sync status
    Status,
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand)]
enum ZoneCommands {
    /// List all zones
    #[command(alias = "ls")]
    List {
        /// Include hidden zones
        #[arg(short, long)]
        all: bool,
    },
    /// Show zone details
    Show {
        /// Local zone id
        id: i64,
    },
    /// Delete a zone (and on the server when sync is active)
    #[command(alias = "rm")]
    Delete {
        /// Local zone id
        id: i64,
    },
    /// Import zones from the JSON fallback file into the database
    Import,
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (data_dir, sync_url, sync_enabled, sync_group, ...)
        key: String,
        /// Configuration value
        value: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));

    // Config commands don't need the repository
    if let Commands::Config { command } = &cli.command {
        return match command.clone() {
            Some(ConfigCommands::Show) | None => commands::config::show(&output),
            Some(ConfigCommands::Set { key, value }) => {
                commands::config::set(key, value, &output)
            }
        };
    }

    let config = Config::load().context("Failed to load configuration")?;
    let clock = Arc::new(SyncClock::system());
    let repository = Arc::new(
        ZoneRepository::open(&config, clock).context("Failed to open zone storage")?,
    );
    let executor = TaskExecutor::with_defaults();

    let result = match cli.command {
        Commands::Zones { command } => {
            handle_zone_command(command, repository.clone(), &executor, &config, &output).await
        }
        Commands::Sync => commands::sync::sync(repository.clone(), &config, &output).await,
        Commands::Watch => commands::watch::watch(repository.clone(), &config, &output).await,
        Commands::Status => commands::status::show(&repository, &config, &output).await,
        Commands::Config { .. } => unreachable!(), // Handled above
    };

    executor.shutdown();
    repository.shutdown();
    result
}

async fn handle_zone_command(
    command: ZoneCommands,
    repository: Arc<ZoneRepository>,
    executor: &TaskExecutor,
    config: &Config,
    output: &Output,
) -> Result<()> {
    match command {
        ZoneCommands::List { all } => commands::zones::list(&repository, executor, all, output).await,
        ZoneCommands::Show { id } => commands::zones::show(&repository, id, output),
        ZoneCommands::Delete { id } => commands::zones::delete(repository, config, id, output).await,
        ZoneCommands::Import => commands::zones::import(&repository, output),
    }
}

/// Initialize stderr logging
///
/// `-v` turns on debug output for the zonesync crates; without it the
/// filter comes from RUST_LOG and defaults to warnings only.
fn init_logging(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("zonesync_core=debug,zonesync_cli=debug"),
        _ => EnvFilter::new("zonesync_core=trace,zonesync_cli=trace"),
    };

    // Ignore error if already initialized
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
