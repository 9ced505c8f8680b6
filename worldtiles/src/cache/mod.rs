//! Tile caching: decoded artifacts in memory, raw tiles on disk.
//!
//! - [`TileCache`] holds decoded [`CachedArtifact`]s in a byte-bounded LRU.
//! - [`DiskCache`] persists tile bytes with atomic publish.
//!
//! Memory entries are only created after the disk write for the same tile
//! succeeded, except for datasets configured without persistence.

pub mod artifact;
pub mod disk;
pub mod memory;

pub use artifact::{CachedArtifact, ElevationGrid, TilePayload};
pub use disk::{DiskCache, DiskUsage, EvictionResult};
pub use memory::{MemoryStats, PutOutcome, TileCache};
