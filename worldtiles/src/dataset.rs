//! Dataset descriptors and tile address expansion.
//!
//! A [`Dataset`] describes one tiled layer: where its tiles come from, how
//! their bytes are decoded, which transforms run on them and how they are laid
//! out in the disk cache. Address functions are pure: the same key always
//! yields the same relative path and locator.

use crate::coord::{TileGrid, TileKey};
use crate::process::ImageTransform;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::SystemTime;

/// Sample encoding of elevation tiles (always little-endian).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    Int16,
    Float32,
}

impl SampleFormat {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::Int16 => 2,
            SampleFormat::Float32 => 4,
        }
    }
}

/// What a dataset's tiles decode into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    /// Raster imagery decoded to RGBA8.
    Image,
    /// Raw elevation grid.
    Elevation(SampleFormat),
}

/// Pixel dimensions of a tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileShape {
    pub width: u32,
    pub height: u32,
}

impl TileShape {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn pixels(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

impl Default for TileShape {
    fn default() -> Self {
        Self::new(256, 256)
    }
}

impl fmt::Display for TileShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for TileShape {
    type Err = String;

    /// Parses `"WIDTHxHEIGHT"`, e.g. `"512x512"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .trim()
            .split_once(['x', 'X'])
            .ok_or_else(|| format!("expected WIDTHxHEIGHT, got '{}'", s))?;
        let width: u32 = w.trim().parse().map_err(|_| format!("invalid width '{}'", w))?;
        let height: u32 = h.trim().parse().map_err(|_| format!("invalid height '{}'", h))?;
        if width == 0 || height == 0 {
            return Err(format!("tile dimensions must be non-zero, got '{}'", s));
        }
        Ok(Self { width, height })
    }
}

/// Descriptor of one tiled layer.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub name: Arc<str>,
    /// URL or path template with `{level}`, `{row}`, `{col}`, `{dataset}`
    /// placeholders (`{z}`, `{y}`, `{x}` are accepted as aliases).
    pub url_template: String,
    /// Template for the matching mask layer, if tiles are mask-composited.
    pub mask_url_template: Option<String>,
    /// File extension of persisted tiles (`png`, `jpg`, `bil`, ...).
    pub format: String,
    pub content: ContentKind,
    pub shape: TileShape,
    pub grid: TileGrid,
    /// Pixel transforms applied in order after decode.
    pub transforms: Vec<ImageTransform>,
    /// Whether tiles are written to the disk cache.
    pub persist: bool,
    /// Whether the source serves zip-compressed bodies that are stored as-is.
    pub compressed: bool,
    /// Artifacts stored at or before this instant are stale.
    pub expiry: Option<SystemTime>,
}

impl Dataset {
    /// Creates an image dataset with default shape and grid.
    pub fn image(name: &str, url_template: &str, format: &str) -> Self {
        Self {
            name: Arc::from(name),
            url_template: url_template.to_string(),
            mask_url_template: None,
            format: format.to_string(),
            content: ContentKind::Image,
            shape: TileShape::default(),
            grid: TileGrid::default(),
            transforms: Vec::new(),
            persist: true,
            compressed: false,
            expiry: None,
        }
    }

    /// Creates an elevation dataset with the given sample format and shape.
    pub fn elevation(name: &str, url_template: &str, sample: SampleFormat, shape: TileShape) -> Self {
        Self {
            content: ContentKind::Elevation(sample),
            shape,
            ..Self::image(name, url_template, "bil")
        }
    }

    /// Whether tiles of this dataset are composed from a primary and a mask.
    pub fn is_masked(&self) -> bool {
        self.mask_url_template.is_some()
    }

    /// Cache-relative path: `{dataset}/{level}/{row}/{row}_{col}.{ext}`.
    pub fn relative_path(&self, key: &TileKey) -> String {
        relative_path(key, &self.format)
    }

    /// Locator of the primary tile.
    pub fn locator(&self, key: &TileKey) -> String {
        self.expand(&self.url_template, key)
    }

    /// Locator of the mask tile, for masked datasets.
    pub fn mask_locator(&self, key: &TileKey) -> Option<String> {
        self.mask_url_template
            .as_deref()
            .map(|template| self.expand(template, key))
    }

    fn expand(&self, template: &str, key: &TileKey) -> String {
        let level = key.level.to_string();
        let row = key.row.to_string();
        let col = key.col.to_string();
        let url = template
            .replace("{dataset}", &key.dataset)
            .replace("{level}", &level)
            .replace("{z}", &level)
            .replace("{row}", &row)
            .replace("{y}", &row)
            .replace("{col}", &col)
            .replace("{x}", &col);

        if self.compressed && (url.starts_with("http://") || url.starts_with("https://")) {
            format!("zip+{}", url)
        } else {
            url
        }
    }
}

/// Cache-relative path for `key` with the given extension.
pub fn relative_path(key: &TileKey, ext: &str) -> String {
    format!(
        "{}/{}/{}/{}_{}.{}",
        key.dataset, key.level, key.row, key.row, key.col, ext
    )
}

/// Lookup table of configured datasets by name.
#[derive(Debug, Clone, Default)]
pub struct DatasetRegistry {
    datasets: HashMap<Arc<str>, Arc<Dataset>>,
}

impl DatasetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a dataset, keyed by its name.
    pub fn insert(&mut self, dataset: Dataset) -> Arc<Dataset> {
        let dataset = Arc::new(dataset);
        self.datasets.insert(dataset.name.clone(), dataset.clone());
        dataset
    }

    pub fn get(&self, name: &str) -> Option<Arc<Dataset>> {
        self.datasets.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.datasets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }

    /// Dataset names in sorted order.
    pub fn names(&self) -> Vec<Arc<str>> {
        let mut names: Vec<_> = self.datasets.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Dataset>> {
        self.datasets.values()
    }
}

impl FromIterator<Dataset> for DatasetRegistry {
    fn from_iter<I: IntoIterator<Item = Dataset>>(iter: I) -> Self {
        let mut registry = Self::new();
        for dataset in iter {
            registry.insert(dataset);
        }
        registry
    }
}
