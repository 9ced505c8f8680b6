//! Configuration for WorldTiles.
//!
//! The INI file at `~/.config/worldtiles/config.ini` holds cache sizing,
//! retrieval tuning, URL rewrite rules and one `[dataset.NAME]` section per
//! tiled layer:
//!
//! ```ini
//! [cache]
//! memory_size = 512MB
//! disk_size = 20GB
//!
//! [dataset.bmng]
//! url = https://tiles.example/bmng/{level}/{row}/{col}.jpg
//! format = jpg
//! ```

mod file;
mod parser;
mod size;

pub use file::{
    config_directory, config_file_path, default_cache_directory, CacheSettings, ConfigError,
    ConfigFile, RetrievalSettings, DEFAULT_DISK_CACHE_SIZE, DEFAULT_MEMORY_CACHE_SIZE,
};
pub use parser::{DATASET_SECTION_PREFIX, REWRITE_SEPARATOR};
pub use size::{format_size, format_size_approx, parse_size, SizeParseError};
