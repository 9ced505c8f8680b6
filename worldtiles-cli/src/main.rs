//! WorldTiles CLI - Command-line interface
//!
//! Fetches, prefetches and manages cached tiles for the datasets defined in
//! the WorldTiles config file.

mod commands;
mod error;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use worldtiles::logging::{default_log_dir, init_logging, DEFAULT_LOG_FILE};

use commands::cache::CacheAction;
use commands::fetch::FetchArgs;
use commands::prefetch::PrefetchArgs;
use error::CliError;

#[derive(Parser)]
#[command(name = "worldtiles")]
#[command(version, about = "Fetch and cache map tiles for virtual globes", long_about = None)]
struct Cli {
    /// Config file (defaults to ~/.config/worldtiles/config.ini)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log debug output to stdout
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch a single tile into the cache
    Fetch(FetchArgs),

    /// Fetch every tile of a sector at one level
    Prefetch(PrefetchArgs),

    /// Inspect and manage the disk cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        e.exit();
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let level = if cli.verbose {
        "worldtiles=debug,info"
    } else {
        "warn"
    };
    let _guard =
        init_logging(&default_log_dir(), DEFAULT_LOG_FILE, level).map_err(CliError::LoggingInit)?;

    let config = commands::common::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Fetch(args) => commands::fetch::run(config, args).await,
        Commands::Prefetch(args) => commands::prefetch::run(config, args).await,
        Commands::Cache { action } => commands::cache::run(config, action).await,
    }
}
