//! Application error types.

use std::fmt;
use std::io;
use std::path::PathBuf;

use crate::config::ConfigError;
use crate::error::TransportError;

/// Errors that can occur while starting the tile engine.
#[derive(Debug)]
pub enum AppError {
    /// Configuration could not be loaded or is invalid.
    Config(ConfigError),

    /// A `[rewrite]` rule did not compile.
    Rewrite(regex::Error),

    /// The HTTP client could not be built.
    HttpClient(TransportError),

    /// The cache directory could not be created.
    CacheDirectory { path: PathBuf, source: io::Error },
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Config(e) => write!(f, "Configuration error: {}", e),
            AppError::Rewrite(e) => write!(f, "Invalid rewrite rule: {}", e),
            AppError::HttpClient(e) => write!(f, "Failed to create HTTP client: {}", e),
            AppError::CacheDirectory { path, source } => {
                write!(
                    f,
                    "Failed to create cache directory {}: {}",
                    path.display(),
                    source
                )
            }
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AppError::Config(e) => Some(e),
            AppError::Rewrite(e) => Some(e),
            AppError::HttpClient(e) => Some(e),
            AppError::CacheDirectory { source, .. } => Some(source),
        }
    }
}

impl From<ConfigError> for AppError {
    fn from(e: ConfigError) -> Self {
        AppError::Config(e)
    }
}

impl From<regex::Error> for AppError {
    fn from(e: regex::Error) -> Self {
        AppError::Rewrite(e)
    }
}
