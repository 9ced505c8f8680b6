//! `worldtiles fetch` - fetch a single tile and report where it is cached.

use clap::Args;
use console::style;
use worldtiles::coord::TileKey;
use worldtiles::{AppConfig, EnsureMode, TileEngine, TilePayload};

use super::common::resolve_dataset;
use crate::error::CliError;

/// Arguments for the fetch command.
#[derive(Debug, Args)]
pub struct FetchArgs {
    /// Dataset name as configured in `[dataset.NAME]`
    #[arg(long)]
    pub dataset: String,

    /// Tile level
    #[arg(long)]
    pub level: u32,

    /// Tile row (counted northward from -90°)
    #[arg(long)]
    pub row: u32,

    /// Tile column (counted eastward from -180°)
    #[arg(long)]
    pub col: u32,
}

pub async fn run(config: AppConfig, args: FetchArgs) -> Result<(), CliError> {
    let dataset = resolve_dataset(&config, &args.dataset)?;
    let key = TileKey::new(dataset.name.clone(), args.level, args.row, args.col);

    let engine = TileEngine::start(config.with_gc_interval(None)).await?;
    let orchestrator = engine.orchestrator().clone();
    let result = orchestrator.ensure(&key, 1.0, EnsureMode::Immediate).await;
    engine.shutdown().await;

    let status = result?;
    let Some(artifact) = status.artifact() else {
        return Ok(());
    };

    println!("{} {}", style("Tile").bold(), key);
    println!("  Locator:    {}", dataset.locator(&key));
    let (width, height) = artifact.dimensions();
    match &*artifact.payload {
        TilePayload::Image(_) => println!("  Image:      {}x{}", width, height),
        TilePayload::Elevation(grid) => {
            println!("  Elevation:  {}x{}", width, height);
            if let Some((min, max)) = grid.range() {
                println!("  Range:      {} .. {}", min, max);
            }
        }
    }
    if dataset.persist {
        println!("  Cached at:  {}", orchestrator.disk().path_for(&key).display());
    } else {
        println!("  Cached at:  (memory only)");
    }
    Ok(())
}
