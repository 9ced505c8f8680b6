//! `worldtiles cache` - inspect and manage the disk cache.

use std::sync::Arc;

use clap::Subcommand;
use worldtiles::cache::DiskCache;
use worldtiles::config::{format_size, format_size_approx};
use worldtiles::{AppConfig, TileEngine};

use super::common::resolve_dataset;
use crate::error::CliError;

#[derive(Debug, Subcommand)]
pub enum CacheAction {
    /// Show disk cache usage
    Stats,

    /// Delete cached tiles
    Purge {
        /// Only purge this dataset
        #[arg(long)]
        dataset: Option<String>,
    },

    /// Evict the oldest tiles until the cache fits its size limit
    Gc,
}

pub async fn run(config: AppConfig, action: CacheAction) -> Result<(), CliError> {
    match action {
        CacheAction::Stats => stats(&config).await,
        CacheAction::Purge { dataset } => purge(&config, dataset.as_deref()).await,
        CacheAction::Gc => gc(config).await,
    }
}

fn disk_cache(config: &AppConfig) -> DiskCache {
    DiskCache::new(&config.cache.directory, Arc::clone(&config.datasets))
}

async fn stats(config: &AppConfig) -> Result<(), CliError> {
    let usage = disk_cache(config).usage().await.map_err(CliError::Cache)?;
    let limit = config.cache.disk_size;
    let percent = if limit > 0 {
        usage.bytes as f64 / limit as f64 * 100.0
    } else {
        0.0
    };

    println!("Disk Cache");
    println!("  Directory:  {}", config.cache.directory.display());
    println!("  Tiles:      {}", usage.files);
    println!(
        "  Size:       {} of {} ({:.1}%)",
        format_size_approx(usage.bytes),
        format_size(limit),
        percent
    );
    println!("  Memory:     {}", format_size(config.cache.memory_size));
    Ok(())
}

async fn purge(config: &AppConfig, dataset: Option<&str>) -> Result<(), CliError> {
    let disk = disk_cache(config);
    let removed = match dataset {
        Some(name) => {
            let dataset = resolve_dataset(config, name)?;
            disk.purge_dataset(&dataset.name).await
        }
        None => disk.purge_all().await,
    }
    .map_err(CliError::Cache)?;

    println!(
        "Removed {} tiles ({})",
        removed.files,
        format_size_approx(removed.bytes)
    );
    Ok(())
}

async fn gc(config: AppConfig) -> Result<(), CliError> {
    let engine = TileEngine::start(config.with_gc_interval(None)).await?;
    let result = engine.collect_garbage().await;
    engine.shutdown().await;
    let result = result.map_err(CliError::Cache)?;

    if result.files_deleted == 0 {
        println!(
            "Cache is within its limit ({})",
            format_size_approx(result.size_after)
        );
    } else {
        println!(
            "Evicted {} tiles, freed {} ({} -> {}) in {} ms",
            result.files_deleted,
            format_size_approx(result.bytes_freed),
            format_size_approx(result.size_before),
            format_size_approx(result.size_after),
            result.duration_ms
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use worldtiles::config::ConfigFile;
    use worldtiles::TileKey;

    #[tokio::test]
    async fn test_purge_single_dataset() {
        let dir = TempDir::new().unwrap();
        let file = ConfigFile::parse(
            "[dataset.a]\nurl = http://h/{level}/{row}/{col}.png\n\n[dataset.b]\nurl = http://h/{level}/{row}/{col}.png\n",
        )
        .unwrap();
        let config = AppConfig::from_config_file(&file).with_cache_directory(dir.path());
        let disk = disk_cache(&config);
        disk.write_atomic(&TileKey::new("a", 0, 0, 0), vec![1u8; 4].into())
            .await
            .unwrap();
        disk.write_atomic(&TileKey::new("b", 0, 0, 0), vec![1u8; 4].into())
            .await
            .unwrap();

        purge(&config, Some("a")).await.unwrap();

        assert!(!disk.exists(&TileKey::new("a", 0, 0, 0)).await);
        assert!(disk.exists(&TileKey::new("b", 0, 0, 0)).await);
    }
}
