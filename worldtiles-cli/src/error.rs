//! CLI error handling with user-friendly messages.
//!
//! Centralizes error handling for the CLI, providing consistent formatting
//! and appropriate exit codes.

use std::fmt;
use std::io;
use std::process;
use worldtiles::config::ConfigError;
use worldtiles::coord::CoordError;
use worldtiles::{AppError, TileError};

/// CLI-specific errors with user-friendly messages.
#[derive(Debug)]
pub enum CliError {
    /// Failed to initialize logging
    LoggingInit(io::Error),
    /// Configuration file could not be loaded
    Config(ConfigError),
    /// Failed to start the tile engine
    Engine(AppError),
    /// Dataset not defined in the configuration
    UnknownDataset { name: String, known: Vec<String> },
    /// Invalid tile address or sector
    Coord(CoordError),
    /// Tile could not be fetched
    Tile(TileError),
    /// Sector covers more tiles than the prefetch limit allows
    TooManyTiles { count: usize, limit: usize },
    /// Some tiles of a prefetch failed
    Prefetch { failed: usize, total: usize },
    /// Cache directory operation failed
    Cache(io::Error),
}

impl CliError {
    /// Exit the process with an appropriate error message and code.
    pub fn exit(&self) -> ! {
        eprintln!("Error: {}", self);

        match self {
            CliError::UnknownDataset { known, .. } if known.is_empty() => {
                eprintln!();
                eprintln!("No datasets are configured. Add a section such as:");
                eprintln!("  [dataset.NAME]");
                eprintln!("  url = https://tiles.example/{{level}}/{{row}}/{{col}}.png");
                eprintln!(
                    "to {}",
                    worldtiles::config::config_file_path().display()
                );
            }
            CliError::UnknownDataset { known, .. } => {
                eprintln!("Configured datasets: {}", known.join(", "));
            }
            CliError::TooManyTiles { .. } => {
                eprintln!("Use a smaller sector, a lower level or raise --max-tiles.");
            }
            _ => {}
        }

        process::exit(1)
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::LoggingInit(e) => write!(f, "Failed to initialize logging: {}", e),
            CliError::Config(e) => write!(f, "{}", e),
            CliError::Engine(e) => write!(f, "Failed to start tile engine: {}", e),
            CliError::UnknownDataset { name, .. } => write!(f, "Unknown dataset '{}'", name),
            CliError::Coord(e) => write!(f, "Invalid tile address: {}", e),
            CliError::Tile(e) => write!(f, "Failed to fetch tile: {}", e),
            CliError::TooManyTiles { count, limit } => {
                write!(f, "Sector covers {} tiles, more than the limit of {}", count, limit)
            }
            CliError::Prefetch { failed, total } => {
                write!(f, "{} of {} tiles could not be fetched", failed, total)
            }
            CliError::Cache(e) => write!(f, "Cache operation failed: {}", e),
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CliError::LoggingInit(e) => Some(e),
            CliError::Config(e) => Some(e),
            CliError::Engine(e) => Some(e),
            CliError::Coord(e) => Some(e),
            CliError::Tile(e) => Some(e),
            CliError::Cache(e) => Some(e),
            CliError::UnknownDataset { .. }
            | CliError::TooManyTiles { .. }
            | CliError::Prefetch { .. } => None,
        }
    }
}

impl From<ConfigError> for CliError {
    fn from(e: ConfigError) -> Self {
        CliError::Config(e)
    }
}

impl From<AppError> for CliError {
    fn from(e: AppError) -> Self {
        CliError::Engine(e)
    }
}

impl From<CoordError> for CliError {
    fn from(e: CoordError) -> Self {
        CliError::Coord(e)
    }
}

impl From<TileError> for CliError {
    fn from(e: TileError) -> Self {
        CliError::Tile(e)
    }
}
