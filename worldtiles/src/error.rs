//! Error taxonomy for the tile engine.
//!
//! Errors are split by the stage that produces them:
//!
//! - [`TransportError`]: a retriever could not deliver bytes
//! - [`DecodeError`]: delivered bytes could not be turned into a payload
//! - [`TileError`]: what the orchestrator reports for a tile as a whole
//!
//! All of them are `Clone` because a single failure fans out to every
//! subscriber waiting on the same tile.

use thiserror::Error;

/// Failure to obtain bytes from a locator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Connection-level failure (DNS, TLS, reset, body read).
    #[error("request to {url} failed: {message}")]
    Http { url: String, message: String },

    /// The server answered with a non-success status.
    #[error("HTTP {code} from {url}")]
    Status { url: String, code: u16 },

    /// The resource does not exist (HTTP 404 or missing file).
    #[error("not found: {0}")]
    NotFound(String),

    /// Connect or read deadline expired.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Local filesystem failure while reading a `file://` locator.
    #[error("I/O error on {path}: {message}")]
    Io { path: String, message: String },

    /// No retriever is registered for the locator's scheme.
    #[error("unsupported locator scheme: {0}")]
    UnsupportedScheme(String),

    /// The transfer was interrupted before completion.
    #[error("transfer aborted: {0}")]
    Aborted(String),
}

/// Failure to turn fetched bytes into a tile payload.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("image decode failed: {0}")]
    Image(String),

    #[error("elevation data has {actual} bytes, expected {expected}")]
    ElevationShape { expected: usize, actual: usize },

    #[error("decompression failed: {0}")]
    Decompress(String),

    #[error("mask is {mask_width}x{mask_height}, tile is {width}x{height}")]
    MaskShape {
        width: u32,
        height: u32,
        mask_width: u32,
        mask_height: u32,
    },

    #[error("image encode failed: {0}")]
    Encode(String),

    #[error("empty payload")]
    Empty,
}

/// Terminal error reported for a tile.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TileError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Writing the tile to the disk cache failed after all write retries.
    #[error("cache write to {path} failed: {message}")]
    CacheWrite { path: String, message: String },

    #[error("request cancelled")]
    Cancelled,

    #[error("unknown dataset: {0}")]
    UnknownDataset(String),
}

impl TileError {
    /// Whether another fetch attempt could plausibly succeed.
    ///
    /// Decode errors are deterministic for the same bytes, so they are not
    /// retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TileError::Transport(_) | TileError::CacheWrite { .. })
    }

    /// Whether retrying means fetching the tile again.
    ///
    /// Cache writes are retried by the post-processor against the bytes it
    /// already holds; once that budget is spent the tile gives up.
    pub fn needs_refetch(&self) -> bool {
        matches!(self, TileError::Transport(_))
    }
}
