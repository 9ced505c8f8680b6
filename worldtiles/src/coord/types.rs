//! Coordinate types for the level/row/column tile grid.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// Minimum latitude covered by the grid.
pub const MIN_LAT: f64 = -90.0;
/// Maximum latitude covered by the grid.
pub const MAX_LAT: f64 = 90.0;
/// Minimum longitude covered by the grid.
pub const MIN_LON: f64 = -180.0;
/// Maximum longitude covered by the grid.
pub const MAX_LON: f64 = 180.0;
/// Deepest level accepted by the grid.
pub const MAX_LEVEL: u32 = 30;

/// Errors produced by coordinate conversions.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoordError {
    #[error("latitude {0} is outside [-90, 90]")]
    InvalidLatitude(f64),
    #[error("longitude {0} is outside [-180, 180]")]
    InvalidLongitude(f64),
    #[error("level {0} exceeds maximum of 30")]
    InvalidLevel(u32),
    #[error("invalid sector '{0}': expected minlat,minlon,maxlat,maxlon")]
    InvalidSector(String),
}

/// Identity of one tile: dataset plus grid address.
///
/// Used as the key of both the memory and the disk cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileKey {
    pub dataset: Arc<str>,
    pub level: u32,
    pub row: u32,
    pub col: u32,
}

impl TileKey {
    pub fn new(dataset: impl Into<Arc<str>>, level: u32, row: u32, col: u32) -> Self {
        Self {
            dataset: dataset.into(),
            level,
            row,
            col,
        }
    }
}

impl fmt::Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}/{}", self.dataset, self.level, self.row, self.col)
    }
}

/// Geographic rectangle in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sector {
    pub min_lat: f64,
    pub min_lon: f64,
    pub max_lat: f64,
    pub max_lon: f64,
}

impl Sector {
    /// Creates a sector, validating bounds and ordering.
    pub fn new(min_lat: f64, min_lon: f64, max_lat: f64, max_lon: f64) -> Result<Self, CoordError> {
        for lat in [min_lat, max_lat] {
            if !(MIN_LAT..=MAX_LAT).contains(&lat) {
                return Err(CoordError::InvalidLatitude(lat));
            }
        }
        for lon in [min_lon, max_lon] {
            if !(MIN_LON..=MAX_LON).contains(&lon) {
                return Err(CoordError::InvalidLongitude(lon));
            }
        }
        if min_lat > max_lat || min_lon > max_lon {
            return Err(CoordError::InvalidSector(format!(
                "{},{},{},{}",
                min_lat, min_lon, max_lat, max_lon
            )));
        }
        Ok(Self {
            min_lat,
            min_lon,
            max_lat,
            max_lon,
        })
    }

    /// Whether the point lies inside the sector (edges inclusive).
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        (self.min_lat..=self.max_lat).contains(&lat) && (self.min_lon..=self.max_lon).contains(&lon)
    }
}

impl FromStr for Sector {
    type Err = CoordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<f64> = s
            .split(',')
            .map(|p| p.trim().parse::<f64>())
            .collect::<Result<_, _>>()
            .map_err(|_| CoordError::InvalidSector(s.to_string()))?;
        match parts.as_slice() {
            [min_lat, min_lon, max_lat, max_lon] => {
                Sector::new(*min_lat, *min_lon, *max_lat, *max_lon)
            }
            _ => Err(CoordError::InvalidSector(s.to_string())),
        }
    }
}

/// Equirectangular tile grid.
///
/// Level 0 tiles span `level_zero_delta` degrees on each side; every level
/// halves the span. Rows count northward from -90, columns eastward from -180.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileGrid {
    pub level_zero_delta: f64,
}

impl TileGrid {
    pub const fn new(level_zero_delta: f64) -> Self {
        Self { level_zero_delta }
    }

    /// Tile span in degrees at `level`.
    pub fn delta(&self, level: u32) -> f64 {
        self.level_zero_delta / 2f64.powi(level as i32)
    }

    /// Number of tile rows covering the globe at `level`.
    pub fn rows(&self, level: u32) -> u32 {
        ((MAX_LAT - MIN_LAT) / self.delta(level)).ceil() as u32
    }

    /// Number of tile columns covering the globe at `level`.
    pub fn cols(&self, level: u32) -> u32 {
        ((MAX_LON - MIN_LON) / self.delta(level)).ceil() as u32
    }
}

impl Default for TileGrid {
    fn default() -> Self {
        Self::new(36.0)
    }
}

/// Iterator over every tile key inside a row/column rectangle, row-major.
#[derive(Debug, Clone)]
pub struct TileKeysIterator {
    pub(super) dataset: Arc<str>,
    pub(super) level: u32,
    pub(super) min_col: u32,
    pub(super) max_row: u32,
    pub(super) max_col: u32,
    pub(super) row: u32,
    pub(super) col: u32,
    pub(super) done: bool,
}

impl Iterator for TileKeysIterator {
    type Item = TileKey;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let key = TileKey::new(self.dataset.clone(), self.level, self.row, self.col);
        if self.col < self.max_col {
            self.col += 1;
        } else if self.row < self.max_row {
            self.row += 1;
            self.col = self.min_col;
        } else {
            self.done = true;
        }
        Some(key)
    }
}
