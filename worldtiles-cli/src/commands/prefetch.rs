//! `worldtiles prefetch` - fetch every tile of a sector into the disk cache.

use std::time::Duration;

use clap::Args;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::task::JoinSet;
use worldtiles::coord::{keys_in_sector, Sector};
use worldtiles::{AppConfig, EnsureMode, TileEngine};

use super::common::resolve_dataset;
use crate::error::CliError;

/// Default cap on the number of tiles a single prefetch may request.
pub const DEFAULT_MAX_TILES: usize = 10_000;

/// Arguments for the prefetch command.
#[derive(Debug, Args)]
pub struct PrefetchArgs {
    /// Dataset name as configured in `[dataset.NAME]`
    #[arg(long)]
    pub dataset: String,

    /// Tile level
    #[arg(long)]
    pub level: u32,

    /// Sector as minlat,minlon,maxlat,maxlon
    #[arg(long, allow_hyphen_values = true)]
    pub sector: Sector,

    /// Refuse sectors with more tiles than this
    #[arg(long, default_value_t = DEFAULT_MAX_TILES)]
    pub max_tiles: usize,
}

pub async fn run(config: AppConfig, args: PrefetchArgs) -> Result<(), CliError> {
    let dataset = resolve_dataset(&config, &args.dataset)?;
    let keys = keys_in_sector(&dataset.grid, &dataset.name, args.level, &args.sector)?;
    let total = keys.clone().count();
    if total > args.max_tiles {
        return Err(CliError::TooManyTiles {
            count: total,
            limit: args.max_tiles,
        });
    }

    println!(
        "{} {} tiles of {} at level {}",
        style("Prefetching").bold(),
        total,
        dataset.name,
        args.level
    );

    let engine = TileEngine::start(config).await?;
    let orchestrator = engine.orchestrator().clone();

    let bar = ProgressBar::new(total as u64);
    bar.set_style(
        ProgressStyle::with_template("{wide_bar:0.white/dim.white} {pos:>7}/{len:7} {per_sec:12} {elapsed_precise} {eta_precise}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("██▁"),
    );
    bar.enable_steady_tick(Duration::from_millis(200));

    let mut tasks = JoinSet::new();
    for key in keys {
        let orchestrator = orchestrator.clone();
        tasks.spawn(async move {
            let result = orchestrator.ensure(&key, 1.0, EnsureMode::Immediate).await;
            (key, result)
        });
    }

    let mut failed = 0;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((_, Ok(_))) => {}
            Ok((key, Err(e))) => {
                failed += 1;
                bar.println(format!("{} {}: {}", style("failed").red(), key, e));
            }
            Err(e) => {
                failed += 1;
                tracing::warn!(error = %e, "Prefetch task panicked");
            }
        }
        bar.inc(1);
    }
    bar.finish();

    let stats = orchestrator.service().stats();
    engine.shutdown().await;

    println!(
        "Fetched {} tiles ({} requests, {} deduplicated)",
        total - failed,
        stats.submitted,
        stats.deduplicated
    );
    if failed > 0 {
        return Err(CliError::Prefetch { failed, total });
    }
    Ok(())
}
