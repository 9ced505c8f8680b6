//! Configuration file handling for ~/.config/worldtiles/config.ini.
//!
//! Parsing lives in [`super::parser`]; this module holds the settings
//! structs, their defaults and the load entry points.

use crate::dataset::{Dataset, DatasetRegistry};
use crate::retrieval::http::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT, DEFAULT_USER_AGENT};
use crate::retrieval::policy::{DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY_MS};
use crate::retrieval::service::{DEFAULT_QUEUE_CAPACITY, DEFAULT_WORKERS};
use crate::retrieval::{RetrievalConfig, RetryPolicy};
use ini::{Ini, ParseOption};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default memory cache size (512 MB).
pub const DEFAULT_MEMORY_CACHE_SIZE: u64 = 512 * 1024 * 1024;

/// Default disk cache size (20 GB).
pub const DEFAULT_DISK_CACHE_SIZE: u64 = 20 * 1024 * 1024 * 1024;

/// Configuration file errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read or parse the INI file
    #[error("Failed to read config file: {0}")]
    Read(#[from] ini::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {section}.{key} = '{value}' - {reason}")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    pub(super) fn invalid(
        section: &str,
        key: &str,
        value: &str,
        reason: impl Into<String>,
    ) -> Self {
        ConfigError::InvalidValue {
            section: section.to_string(),
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// `[cache]` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSettings {
    pub directory: PathBuf,
    pub memory_size: u64,
    pub disk_size: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            directory: default_cache_directory(),
            memory_size: DEFAULT_MEMORY_CACHE_SIZE,
            disk_size: DEFAULT_DISK_CACHE_SIZE,
        }
    }
}

/// `[retrieval]` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievalSettings {
    pub workers: usize,
    pub queue_capacity: usize,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub user_agent: String,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl RetrievalSettings {
    pub fn service_config(&self) -> RetrievalConfig {
        RetrievalConfig {
            workers: self.workers,
            queue_capacity: self.queue_capacity,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from_max_retries(self.max_retries, self.retry_delay)
    }

    /// How long a masked tile waits for its second half: the longer of the
    /// two transfer deadlines.
    pub fn mask_join_timeout(&self) -> Duration {
        self.connect_timeout.max(self.read_timeout)
    }
}

/// Complete parsed configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigFile {
    pub cache: CacheSettings,
    pub retrieval: RetrievalSettings,
    /// `(pattern, replacement)` regex pairs applied to HTTP locators.
    pub rewrite_rules: Vec<(String, String)>,
    pub datasets: Vec<Dataset>,
}

impl ConfigFile {
    /// Load configuration from the default path.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&config_file_path())
    }

    /// Load configuration from a specific path.
    ///
    /// If the file doesn't exist, returns defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let ini = Ini::load_from_file_opt(path, parse_option())?;
        super::parser::parse_ini(&ini)
    }

    /// Parse configuration from INI text.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let ini = Ini::load_from_str_opt(content, parse_option())
            .map_err(|e| ConfigError::Read(ini::Error::Parse(e)))?;
        super::parser::parse_ini(&ini)
    }

    pub fn dataset_registry(&self) -> DatasetRegistry {
        self.datasets.iter().cloned().collect()
    }
}

/// Backslashes are kept verbatim so `[rewrite]` patterns survive parsing.
fn parse_option() -> ParseOption {
    ParseOption {
        enabled_escape: false,
        ..ParseOption::default()
    }
}

/// Get the path to the config directory (~/.config/worldtiles).
pub fn config_directory() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("worldtiles")
}

/// Get the path to the config file (~/.config/worldtiles/config.ini).
pub fn config_file_path() -> PathBuf {
    config_directory().join("config.ini")
}

/// Default tile cache location (~/.cache/worldtiles/tiles).
pub fn default_cache_directory() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("worldtiles")
        .join("tiles")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ConfigFile::default();
        assert_eq!(config.cache.memory_size, DEFAULT_MEMORY_CACHE_SIZE);
        assert_eq!(config.cache.disk_size, DEFAULT_DISK_CACHE_SIZE);
        assert_eq!(config.retrieval.max_retries, 1);
        assert!(config.datasets.is_empty());
        assert_eq!(config.retrieval.mask_join_timeout(), DEFAULT_READ_TIMEOUT);
    }

    #[test]
    fn test_load_nonexistent_returns_defaults() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let config = ConfigFile::load_from(&temp_dir.path().join("missing.ini")).unwrap();
        assert_eq!(config.retrieval, RetrievalSettings::default());
    }

    #[test]
    fn test_load_from_file() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("config.ini");
        std::fs::write(
            &path,
            "[cache]\nmemory_size = 64MB\n\n[dataset.bmng]\nurl = http://h/{level}/{row}/{col}.jpg\nformat = jpg\n",
        )
        .unwrap();

        let config = ConfigFile::load_from(&path).unwrap();
        assert_eq!(config.cache.memory_size, 64 * 1024 * 1024);
        assert_eq!(config.dataset_registry().len(), 1);
    }

    #[test]
    fn test_config_path_layout() {
        assert!(config_file_path().ends_with("worldtiles/config.ini"));
    }
}
