//! Common helpers shared across CLI commands.

use std::path::Path;
use std::sync::Arc;
use worldtiles::config::{config_file_path, ConfigFile};
use worldtiles::{AppConfig, Dataset};

use crate::error::CliError;

/// Load the config file from `path`, or the default location.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig, CliError> {
    let default_path = config_file_path();
    let path = path.unwrap_or(&default_path);
    let file = ConfigFile::load_from(path)?;
    tracing::debug!(path = %path.display(), datasets = file.datasets.len(), "Configuration loaded");
    Ok(AppConfig::from_config_file(&file))
}

/// Look up a configured dataset by name.
pub fn resolve_dataset(config: &AppConfig, name: &str) -> Result<Arc<Dataset>, CliError> {
    config
        .datasets
        .get(name)
        .ok_or_else(|| CliError::UnknownDataset {
            name: name.to_string(),
            known: config.datasets.names().iter().map(|n| n.to_string()).collect(),
        })
}
