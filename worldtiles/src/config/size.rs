//! Human-readable size parsing (e.g., "2GB", "500MB").

use thiserror::Error;

const KB: u64 = 1024;
const MB: u64 = 1024 * KB;
const GB: u64 = 1024 * MB;
const TB: u64 = 1024 * GB;

/// Error parsing a size string.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Invalid size '{input}' - expected format like '2GB', '500MB', or '1024KB'")]
pub struct SizeParseError {
    input: String,
}

/// Parse a human-readable size string into bytes.
///
/// Bare numbers are bytes; `K`/`KB`, `M`/`MB`, `G`/`GB` and `T`/`TB` are
/// binary multiples. Case-insensitive, whitespace tolerant.
///
/// ```
/// use worldtiles::config::parse_size;
///
/// assert_eq!(parse_size("1024").unwrap(), 1024);
/// assert_eq!(parse_size("1 KB").unwrap(), 1024);
/// assert_eq!(parse_size("500mb").unwrap(), 500 * 1024 * 1024);
/// ```
pub fn parse_size(s: &str) -> Result<u64, SizeParseError> {
    let error = || SizeParseError {
        input: s.to_string(),
    };
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Err(error());
    }

    let upper = trimmed.to_uppercase();
    let digits_end = upper
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(upper.len());
    let (number, suffix) = upper.split_at(digits_end);

    let multiplier = match suffix.trim() {
        "" | "B" => 1,
        "K" | "KB" => KB,
        "M" | "MB" => MB,
        "G" | "GB" => GB,
        "T" | "TB" => TB,
        _ => return Err(error()),
    };

    let number: u64 = number.parse().map_err(|_| error())?;
    number.checked_mul(multiplier).ok_or_else(error)
}

/// Format a byte count using the largest unit that divides it exactly.
pub fn format_size(bytes: u64) -> String {
    for (unit, name) in [(TB, "TB"), (GB, "GB"), (MB, "MB"), (KB, "KB")] {
        if bytes >= unit && bytes % unit == 0 {
            return format!("{}{}", bytes / unit, name);
        }
    }
    format!("{}", bytes)
}

/// Format a byte count approximately, for display (e.g. `1.5 GB`).
pub fn format_size_approx(bytes: u64) -> String {
    let value = bytes as f64;
    if bytes >= GB {
        format!("{:.1} GB", value / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", value / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", value / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
