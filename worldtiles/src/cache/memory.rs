//! Byte-bounded LRU cache of decoded tile artifacts.
//!
//! Recency is strict: every [`TileCache::get`] moves the entry to the
//! most-recently-used position, and eviction always removes the
//! least-recently-used entry first until the resident size fits the capacity.
//! An artifact larger than the whole capacity is still stored (the renderer
//! asked for it) but every other entry is evicted and it is demoted to the
//! LRU position, so it is the first to go on the next insert.
//!
//! The cache is guarded by a `parking_lot::Mutex`; artifacts are fully built
//! before insertion, so readers never observe partial entries.

use super::artifact::CachedArtifact;
use crate::coord::TileKey;
use lru::LruCache;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::trace;

/// Result of [`TileCache::put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// New entry; `evicted` older entries were dropped to make room.
    Inserted { evicted: usize },
    /// An entry with an equal or lower generation was replaced.
    Replaced { evicted: usize },
    /// The resident entry has a newer generation; nothing changed.
    Superseded,
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub hits: u64,
    pub misses: u64,
    /// Entries dropped because the capacity was exceeded.
    pub evictions: u64,
    pub entries: usize,
    pub size_bytes: usize,
    pub capacity_bytes: usize,
}

impl MemoryStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Entry {
    artifact: Arc<CachedArtifact>,
    last_access: Instant,
}

struct State {
    entries: LruCache<TileKey, Entry>,
    size_bytes: usize,
}

/// In-memory tile cache.
pub struct TileCache {
    state: Mutex<State>,
    capacity_bytes: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl TileCache {
    /// Creates a cache holding at most `capacity_bytes` of decoded data.
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            state: Mutex::new(State {
                entries: LruCache::unbounded(),
                size_bytes: 0,
            }),
            capacity_bytes,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Returns the artifact for `key`, marking it most recently used.
    pub fn get(&self, key: &TileKey) -> Option<Arc<CachedArtifact>> {
        let mut state = self.state.lock();
        match state.entries.get_mut(key) {
            Some(entry) => {
                entry.last_access = Instant::now();
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.artifact.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Returns the artifact for `key` without touching recency or counters.
    pub fn peek(&self, key: &TileKey) -> Option<Arc<CachedArtifact>> {
        self.state
            .lock()
            .entries
            .peek(key)
            .map(|entry| entry.artifact.clone())
    }

    pub fn contains(&self, key: &TileKey) -> bool {
        self.state.lock().entries.contains(key)
    }

    /// When `key` was last returned by [`get`](Self::get) or inserted.
    pub fn last_access(&self, key: &TileKey) -> Option<Instant> {
        self.state
            .lock()
            .entries
            .peek(key)
            .map(|entry| entry.last_access)
    }

    /// Inserts or replaces the artifact for its key.
    ///
    /// An artifact whose generation is lower than the resident one is
    /// rejected with [`PutOutcome::Superseded`].
    pub fn put(&self, artifact: Arc<CachedArtifact>) -> PutOutcome {
        let key = artifact.key.clone();
        let size = artifact.byte_size;
        let mut state = self.state.lock();

        if let Some(existing) = state.entries.peek(&key) {
            if existing.artifact.generation > artifact.generation {
                trace!(
                    key = %key,
                    resident = existing.artifact.generation,
                    offered = artifact.generation,
                    "Rejected superseded artifact"
                );
                return PutOutcome::Superseded;
            }
        }

        let replaced = state.entries.put(
            key.clone(),
            Entry {
                artifact,
                last_access: Instant::now(),
            },
        );
        if let Some(old) = &replaced {
            state.size_bytes -= old.artifact.byte_size;
        }
        state.size_bytes += size;

        let mut evicted = 0;
        while state.size_bytes > self.capacity_bytes && state.entries.len() > 1 {
            // The new entry sits at the MRU end, so it is never popped here.
            let Some((_, lru)) = state.entries.pop_lru() else {
                break;
            };
            state.size_bytes -= lru.artifact.byte_size;
            evicted += 1;
        }

        if size > self.capacity_bytes {
            state.entries.demote(&key);
            trace!(key = %key, size, capacity = self.capacity_bytes, "Stored oversize artifact");
        }

        if evicted > 0 {
            self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
            trace!(key = %key, evicted, size_bytes = state.size_bytes, "Evicted LRU artifacts");
        }

        if replaced.is_some() {
            PutOutcome::Replaced { evicted }
        } else {
            PutOutcome::Inserted { evicted }
        }
    }

    pub fn remove(&self, key: &TileKey) -> Option<Arc<CachedArtifact>> {
        let mut state = self.state.lock();
        let entry = state.entries.pop(key)?;
        state.size_bytes -= entry.artifact.byte_size;
        Some(entry.artifact)
    }

    /// Removes every entry belonging to `dataset`. Returns how many.
    pub fn remove_dataset(&self, dataset: &str) -> usize {
        let mut state = self.state.lock();
        let keys: Vec<TileKey> = state
            .entries
            .iter()
            .filter(|(key, _)| &*key.dataset == dataset)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &keys {
            if let Some(entry) = state.entries.pop(key) {
                state.size_bytes -= entry.artifact.byte_size;
            }
        }
        keys.len()
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.size_bytes = 0;
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity_bytes(&self) -> usize {
        self.capacity_bytes
    }

    pub fn size_bytes(&self) -> usize {
        self.state.lock().size_bytes
    }

    /// Resident keys, most recently used first.
    pub fn keys(&self) -> Vec<TileKey> {
        self.state
            .lock()
            .entries
            .iter()
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn stats(&self) -> MemoryStats {
        let state = self.state.lock();
        MemoryStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: state.entries.len(),
            size_bytes: state.size_bytes,
            capacity_bytes: self.capacity_bytes,
        }
    }
}

impl std::fmt::Debug for TileCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileCache")
            .field("stats", &self.stats())
            .finish()
    }
}
