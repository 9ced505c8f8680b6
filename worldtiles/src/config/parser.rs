//! INI parsing logic for converting `Ini` → `ConfigFile`.
//!
//! This is the single place where INI key names are mapped to struct fields.

use super::file::{ConfigError, ConfigFile};
use super::size::parse_size;
use crate::coord::TileGrid;
use crate::dataset::{ContentKind, Dataset, SampleFormat, TileShape};
use crate::process::ImageTransform;
use ini::{Ini, Properties};
use regex::Regex;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::{Duration, SystemTime};

/// Prefix of per-dataset section names, e.g. `[dataset.bmng]`.
pub const DATASET_SECTION_PREFIX: &str = "dataset.";

/// Separator between pattern and replacement in `[rewrite]` values.
pub const REWRITE_SEPARATOR: &str = "=>";

/// Parse an `Ini` object into a `ConfigFile`.
///
/// Starts from `ConfigFile::default()` and overlays any values found in the INI.
pub(super) fn parse_ini(ini: &Ini) -> Result<ConfigFile, ConfigError> {
    let mut config = ConfigFile::default();

    // [cache] section
    if let Some(section) = ini.section(Some("cache")) {
        if let Some(v) = section.get("directory") {
            let v = v.trim();
            if !v.is_empty() {
                config.cache.directory = expand_tilde(v);
            }
        }
        if let Some(v) = section.get("memory_size") {
            config.cache.memory_size = parse_size(v).map_err(|_| {
                ConfigError::invalid("cache", "memory_size", v, "expected format like '512MB' or '2GB'")
            })?;
        }
        if let Some(v) = section.get("disk_size") {
            config.cache.disk_size = parse_size(v).map_err(|_| {
                ConfigError::invalid("cache", "disk_size", v, "expected format like '20GB' or '500MB'")
            })?;
        }
    }

    // [retrieval] section
    if let Some(section) = ini.section(Some("retrieval")) {
        let r = &mut config.retrieval;
        if let Some(v) = section.get("workers") {
            r.workers = parse_positive("retrieval", "workers", v)?;
        }
        if let Some(v) = section.get("queue_capacity") {
            r.queue_capacity = parse_positive("retrieval", "queue_capacity", v)?;
        }
        if let Some(v) = section.get("connect_timeout_secs") {
            r.connect_timeout =
                Duration::from_secs(parse_positive("retrieval", "connect_timeout_secs", v)? as u64);
        }
        if let Some(v) = section.get("read_timeout_secs") {
            r.read_timeout =
                Duration::from_secs(parse_positive("retrieval", "read_timeout_secs", v)? as u64);
        }
        if let Some(v) = section.get("max_retries") {
            r.max_retries = parse_number("retrieval", "max_retries", v)?;
        }
        if let Some(v) = section.get("retry_delay_ms") {
            r.retry_delay = Duration::from_millis(parse_number("retrieval", "retry_delay_ms", v)?);
        }
        if let Some(v) = section.get("user_agent") {
            let v = v.trim();
            if !v.is_empty() {
                r.user_agent = v.to_string();
            }
        }
    }

    // [rewrite] section: any key, value "PATTERN => REPLACEMENT"
    if let Some(section) = ini.section(Some("rewrite")) {
        for (key, value) in section.iter() {
            let (pattern, replacement) = value.split_once(REWRITE_SEPARATOR).ok_or_else(|| {
                ConfigError::invalid("rewrite", key, value, "expected 'PATTERN => REPLACEMENT'")
            })?;
            let pattern = pattern.trim();
            Regex::new(pattern)
                .map_err(|e| ConfigError::invalid("rewrite", key, value, e.to_string()))?;
            config
                .rewrite_rules
                .push((pattern.to_string(), replacement.trim().to_string()));
        }
    }

    // [dataset.NAME] sections
    for (name, section) in ini.iter() {
        let Some(dataset) = name.and_then(|n| n.strip_prefix(DATASET_SECTION_PREFIX)) else {
            continue;
        };
        let section_name = format!("{}{}", DATASET_SECTION_PREFIX, dataset);
        if dataset.is_empty() || dataset.contains(['/', '\\']) {
            return Err(ConfigError::invalid(
                &section_name,
                "",
                dataset,
                "dataset name must be non-empty and contain no path separators",
            ));
        }
        if config.datasets.iter().any(|d| &*d.name == dataset) {
            return Err(ConfigError::invalid(&section_name, "", dataset, "duplicate dataset"));
        }
        config
            .datasets
            .push(parse_dataset(&section_name, dataset, section)?);
    }

    Ok(config)
}

fn parse_dataset(section_name: &str, name: &str, section: &Properties) -> Result<Dataset, ConfigError> {
    let s = section_name;
    let url = section
        .get("url")
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ConfigError::invalid(s, "url", "", "a url template is required"))?;

    let mut dataset = match section.get("content").map(|v| v.trim().to_lowercase()) {
        None => Dataset::image(name, url, "png"),
        Some(v) => match v.as_str() {
            "image" => Dataset::image(name, url, "png"),
            "elevation16" => Dataset::elevation(name, url, SampleFormat::Int16, TileShape::default()),
            "elevation32" => Dataset::elevation(name, url, SampleFormat::Float32, TileShape::default()),
            _ => {
                return Err(ConfigError::invalid(
                    s,
                    "content",
                    &v,
                    "must be one of: image, elevation16, elevation32",
                ))
            }
        },
    };

    if let Some(v) = section.get("format") {
        let v = v.trim().trim_start_matches('.').to_lowercase();
        if v.is_empty() || !v.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(ConfigError::invalid(s, "format", &v, "expected a file extension like 'png'"));
        }
        dataset.format = v;
    }

    if let Some(v) = section.get("tile_size") {
        dataset.shape = TileShape::from_str(v).map_err(|e| ConfigError::invalid(s, "tile_size", v, e))?;
    }

    if let Some(v) = section.get("level_zero_delta") {
        let delta: f64 = v
            .trim()
            .parse()
            .map_err(|_| ConfigError::invalid(s, "level_zero_delta", v, "must be a number of degrees"))?;
        if !(delta > 0.0 && delta <= 180.0) {
            return Err(ConfigError::invalid(s, "level_zero_delta", v, "must be in (0, 180]"));
        }
        dataset.grid = TileGrid::new(delta);
    }

    if let Some(v) = section.get("mask_url") {
        let v = v.trim();
        if !v.is_empty() {
            dataset.mask_url_template = Some(v.to_string());
        }
    }

    if let Some(v) = section.get("transforms") {
        dataset.transforms = parse_transforms(s, v, section)?;
    }

    if let Some(v) = section.get("persist") {
        dataset.persist = parse_bool(s, "persist", v)?;
    }
    if let Some(v) = section.get("compressed") {
        dataset.compressed = parse_bool(s, "compressed", v)?;
    }
    if let Some(v) = section.get("expiry") {
        let secs: u64 = parse_number(s, "expiry", v)?;
        dataset.expiry = Some(SystemTime::UNIX_EPOCH + Duration::from_secs(secs));
    }

    validate_dataset(s, &dataset)?;
    Ok(dataset)
}

/// Builds the transform list named by `transforms`, reading each step's
/// parameters from its own key.
fn parse_transforms(
    s: &str,
    list: &str,
    section: &Properties,
) -> Result<Vec<ImageTransform>, ConfigError> {
    let mut transforms = Vec::new();
    for step in list.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        let transform = match step.to_lowercase().as_str() {
            "color_key" => {
                let color = section
                    .get("color_key")
                    .ok_or_else(|| ConfigError::invalid(s, "color_key", "", "required by the color_key transform"))?;
                let tolerance = match section.get("color_key_tolerance") {
                    Some(v) => parse_number(s, "color_key_tolerance", v)?,
                    None => 0,
                };
                ImageTransform::ColorKey {
                    color: parse_color(s, color)?,
                    tolerance,
                }
            }
            "resize" => {
                let shape = section
                    .get("resize")
                    .ok_or_else(|| ConfigError::invalid(s, "resize", "", "required by the resize transform"))?;
                ImageTransform::Resize(
                    TileShape::from_str(shape).map_err(|e| ConfigError::invalid(s, "resize", shape, e))?,
                )
            }
            other => {
                return Err(ConfigError::invalid(
                    s,
                    "transforms",
                    other,
                    "must be a comma list of: color_key, resize",
                ))
            }
        };
        transforms.push(transform);
    }
    Ok(transforms)
}

fn validate_dataset(s: &str, dataset: &Dataset) -> Result<(), ConfigError> {
    let opaque_format = matches!(dataset.format.as_str(), "jpg" | "jpeg");

    match dataset.content {
        ContentKind::Elevation(_) => {
            if !dataset.transforms.is_empty() {
                return Err(ConfigError::invalid(
                    s,
                    "transforms",
                    "",
                    "elevation datasets do not support image transforms",
                ));
            }
            if dataset.is_masked() {
                return Err(ConfigError::invalid(
                    s,
                    "mask_url",
                    "",
                    "elevation datasets cannot be masked",
                ));
            }
        }
        ContentKind::Image if opaque_format => {
            if dataset.transforms.iter().any(ImageTransform::produces_alpha) {
                return Err(ConfigError::invalid(
                    s,
                    "transforms",
                    &dataset.format,
                    "color_key produces transparency, which jpg cannot store",
                ));
            }
            if dataset.is_masked() {
                return Err(ConfigError::invalid(
                    s,
                    "format",
                    &dataset.format,
                    "masked datasets need a format with alpha, e.g. png",
                ));
            }
        }
        ContentKind::Image => {}
    }
    Ok(())
}

fn parse_color(s: &str, v: &str) -> Result<[u8; 3], ConfigError> {
    let hex = v.trim().trim_start_matches('#');
    let invalid = || ConfigError::invalid(s, "color_key", v, "expected a hex color like 'ff00ff'");
    if hex.len() != 6 || !hex.is_ascii() {
        return Err(invalid());
    }
    let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| invalid());
    Ok([channel(0)?, channel(2)?, channel(4)?])
}

fn parse_bool(section: &str, key: &str, v: &str) -> Result<bool, ConfigError> {
    match v.trim().to_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(ConfigError::invalid(section, key, v, "must be true or false")),
    }
}

fn parse_number<T: FromStr>(section: &str, key: &str, v: &str) -> Result<T, ConfigError> {
    v.trim()
        .parse()
        .map_err(|_| ConfigError::invalid(section, key, v, "must be a non-negative integer"))
}

fn parse_positive(section: &str, key: &str, v: &str) -> Result<usize, ConfigError> {
    match parse_number::<usize>(section, key, v)? {
        0 => Err(ConfigError::invalid(section, key, v, "must be a positive integer")),
        n => Ok(n),
    }
}

/// Expand a leading `~` to the home directory.
fn expand_tilde(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path)),
        None => PathBuf::from(path),
    }
}
