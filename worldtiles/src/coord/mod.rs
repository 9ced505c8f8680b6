//! Tile addressing on the level/row/column grid.
//!
//! Converts geographic positions to [`TileKey`]s and back to the sector each
//! tile covers. The grid is equirectangular: see [`TileGrid`].

mod types;

pub use types::{
    CoordError, Sector, TileGrid, TileKey, TileKeysIterator, MAX_LAT, MAX_LEVEL, MAX_LON,
    MIN_LAT, MIN_LON,
};

use std::sync::Arc;

/// Returns the key of the tile containing `(lat, lon)` at `level`.
///
/// Points on the north pole or the antimeridian belong to the last row or
/// column.
pub fn key_for(
    grid: &TileGrid,
    dataset: &Arc<str>,
    level: u32,
    lat: f64,
    lon: f64,
) -> Result<TileKey, CoordError> {
    if !(MIN_LAT..=MAX_LAT).contains(&lat) {
        return Err(CoordError::InvalidLatitude(lat));
    }
    if !(MIN_LON..=MAX_LON).contains(&lon) {
        return Err(CoordError::InvalidLongitude(lon));
    }
    if level > MAX_LEVEL {
        return Err(CoordError::InvalidLevel(level));
    }

    let delta = grid.delta(level);
    let row = (((lat - MIN_LAT) / delta).floor() as u32).min(grid.rows(level) - 1);
    let col = (((lon - MIN_LON) / delta).floor() as u32).min(grid.cols(level) - 1);

    Ok(TileKey::new(dataset.clone(), level, row, col))
}

/// Returns the geographic sector covered by `key`.
pub fn sector_of(grid: &TileGrid, key: &TileKey) -> Sector {
    let delta = grid.delta(key.level);
    let min_lat = MIN_LAT + key.row as f64 * delta;
    let min_lon = MIN_LON + key.col as f64 * delta;
    Sector {
        min_lat,
        min_lon,
        max_lat: (min_lat + delta).min(MAX_LAT),
        max_lon: (min_lon + delta).min(MAX_LON),
    }
}

/// Iterates over all tiles at `level` that intersect `sector`.
pub fn keys_in_sector(
    grid: &TileGrid,
    dataset: &Arc<str>,
    level: u32,
    sector: &Sector,
) -> Result<TileKeysIterator, CoordError> {
    let low = key_for(grid, dataset, level, sector.min_lat, sector.min_lon)?;
    let high = key_for(grid, dataset, level, sector.max_lat, sector.max_lon)?;

    Ok(TileKeysIterator {
        dataset: dataset.clone(),
        level,
        min_col: low.col,
        max_row: high.row,
        max_col: high.col,
        row: low.row,
        col: low.col,
        done: false,
    })
}
