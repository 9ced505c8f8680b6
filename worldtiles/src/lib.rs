//! WorldTiles - tile fetch, cache and compose engine for virtual globes.
//!
//! Given the tiles a renderer needs, WorldTiles fetches them through a
//! bounded worker pool (HTTP, local files or pass-through compressed HTTP),
//! decodes and post-processes them, persists them to an on-disk cache and
//! keeps decoded artifacts in a byte-bounded LRU. The renderer is notified
//! when tiles become ready.
//!
//! # Modules
//!
//! - [`coord`] / [`dataset`]: tile addressing and dataset descriptors
//! - [`retrieval`]: transports, worker pool, retry policy
//! - [`process`]: decode, transforms, mask compositing
//! - [`cache`]: memory LRU and disk cache
//! - [`orchestrator`]: per-tile request state machine
//! - [`app`]: engine bootstrap from [`config`]

pub mod app;
pub mod cache;
pub mod compression;
pub mod config;
pub mod coord;
pub mod dataset;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod process;
pub mod retrieval;

pub use app::{AppConfig, AppError, TileEngine};
pub use cache::{CachedArtifact, TilePayload};
pub use coord::{Sector, TileGrid, TileKey};
pub use dataset::{Dataset, DatasetRegistry, TileShape};
pub use error::{DecodeError, TileError, TransportError};
pub use orchestrator::{EnsureMode, TileEvent, TileRequestOrchestrator, TileStatus};
