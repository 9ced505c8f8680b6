//! On-disk tile cache with atomic publish.
//!
//! Tiles live at `{root}/{dataset}/{level}/{row}/{row}_{col}.{ext}`. Writes
//! are staged in a uniquely named temp file in the destination directory,
//! fsynced, then renamed over the final path, so readers see either the old
//! file, the new file, or nothing; never a partial write.
//!
//! Size management follows an mtime-based LRU approximation: when usage
//! exceeds the limit the oldest files are removed until usage drops to 90% of
//! the limit. [`DiskCache::touch`] refreshes a file's mtime when its content is
//! revalidated.
//!
//! All blocking filesystem work runs inside `spawn_blocking`.

use crate::coord::TileKey;
use crate::dataset::{self, DatasetRegistry};
use bytes::Bytes;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tracing::{debug, info, warn};

/// Target percentage of the limit after eviction (0.9 = 90%).
const EVICTION_TARGET_PERCENTAGE: f64 = 0.9;

/// Prefix of staging files created by [`DiskCache::write_atomic`].
pub const TEMP_PREFIX: &str = ".tmp-";

/// Extension used for tiles of datasets missing from the registry.
const FALLBACK_EXTENSION: &str = "bin";

/// Totals from a cache directory scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskUsage {
    pub files: usize,
    pub bytes: u64,
}

/// Result of an eviction run.
#[derive(Debug, Clone, Default)]
pub struct EvictionResult {
    /// Number of files deleted
    pub files_deleted: usize,
    /// Total bytes freed
    pub bytes_freed: u64,
    /// Cache size before eviction
    pub size_before: u64,
    /// Cache size after eviction
    pub size_after: u64,
    /// Duration of eviction in milliseconds
    pub duration_ms: u64,
}

/// Persistent tile store keyed by [`TileKey`].
#[derive(Debug, Clone)]
pub struct DiskCache {
    root: PathBuf,
    datasets: Arc<DatasetRegistry>,
}

impl DiskCache {
    pub fn new(root: impl Into<PathBuf>, datasets: Arc<DatasetRegistry>) -> Self {
        Self {
            root: root.into(),
            datasets,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of the tile file for `key`.
    pub fn path_for(&self, key: &TileKey) -> PathBuf {
        let relative = match self.datasets.get(&key.dataset) {
            Some(ds) => ds.relative_path(key),
            None => dataset::relative_path(key, FALLBACK_EXTENSION),
        };
        self.root.join(relative)
    }

    pub async fn exists(&self, key: &TileKey) -> bool {
        tokio::fs::try_exists(self.path_for(key))
            .await
            .unwrap_or(false)
    }

    /// Reads the tile bytes, or `None` if the tile is not cached.
    pub async fn read(&self, key: &TileKey) -> io::Result<Option<Bytes>> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Atomically publishes `data` as the tile for `key`.
    ///
    /// Returns the final path.
    pub async fn write_atomic(&self, key: &TileKey, data: Bytes) -> io::Result<PathBuf> {
        let path = self.path_for(key);
        let target = path.clone();
        blocking(move || write_atomic_blocking(&target, &data)).await?;
        debug!(key = %key, path = %path.display(), "Tile persisted");
        Ok(path)
    }

    /// Removes the tile file. Returns whether a file was deleted.
    pub async fn delete(&self, key: &TileKey) -> io::Result<bool> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Modification time of the tile file, if present.
    pub async fn modified(&self, key: &TileKey) -> io::Result<Option<SystemTime>> {
        match tokio::fs::metadata(self.path_for(key)).await {
            Ok(meta) => meta.modified().map(Some),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Sets the tile file's mtime to now. Returns whether the file exists.
    pub async fn touch(&self, key: &TileKey) -> io::Result<bool> {
        let path = self.path_for(key);
        blocking(move || {
            match fs::OpenOptions::new().write(true).open(&path) {
                Ok(file) => file.set_modified(SystemTime::now()).map(|_| true),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
                Err(e) => Err(e),
            }
        })
        .await
    }

    /// Scans the cache directory for total size and file count.
    pub async fn usage(&self) -> io::Result<DiskUsage> {
        let root = self.root.clone();
        blocking(move || {
            let files = collect_cache_files(&root);
            Ok(DiskUsage {
                files: files.len(),
                bytes: files.iter().map(|(_, _, size)| size).sum(),
            })
        })
        .await
    }

    /// Deletes the least recently modified files when usage exceeds `limit`,
    /// until usage is at most 90% of `limit`.
    pub async fn evict_to(&self, limit: u64) -> io::Result<EvictionResult> {
        let root = self.root.clone();
        let result = blocking(move || Ok(evict_blocking(&root, limit))).await?;
        if result.files_deleted > 0 {
            info!(
                files_deleted = result.files_deleted,
                bytes_freed = result.bytes_freed,
                size_before = result.size_before,
                size_after = result.size_after,
                duration_ms = result.duration_ms,
                "Disk cache eviction complete"
            );
        }
        Ok(result)
    }

    /// Removes every cached tile of `dataset`. Returns the usage removed.
    pub async fn purge_dataset(&self, dataset: &str) -> io::Result<DiskUsage> {
        let dir = self.root.join(dataset);
        blocking(move || purge_dir(&dir)).await
    }

    /// Removes every cached tile.
    pub async fn purge_all(&self) -> io::Result<DiskUsage> {
        let root = self.root.clone();
        blocking(move || {
            let mut total = DiskUsage::default();
            let entries = match fs::read_dir(&root) {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(total),
                Err(e) => return Err(e),
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    let removed = purge_dir(&path)?;
                    total.files += removed.files;
                    total.bytes += removed.bytes;
                }
            }
            Ok(total)
        })
        .await
    }
}

async fn blocking<T, F>(f: F) -> io::Result<T>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(io::Error::other)?
}

fn write_atomic_blocking(path: &Path, data: &[u8]) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "tile path has no parent"))?;
    fs::create_dir_all(parent)?;

    let mut staged = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .tempfile_in(parent)?;
    staged.write_all(data)?;
    staged.as_file().sync_all()?;
    staged.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn purge_dir(dir: &Path) -> io::Result<DiskUsage> {
    let files = collect_cache_files(dir);
    let usage = DiskUsage {
        files: files.len(),
        bytes: files.iter().map(|(_, _, size)| size).sum(),
    };
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(usage),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(DiskUsage::default()),
        Err(e) => Err(e),
    }
}

/// Collects `(path, mtime, size)` for every file below `dir`.
///
/// Unreadable entries are skipped; the cache may be modified concurrently.
/// Staging files of in-flight writes are not tiles and are left alone.
fn collect_cache_files(dir: &Path) -> Vec<(PathBuf, SystemTime, u64)> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let Ok(entries) = fs::read_dir(&current) else {
            continue;
        };
        for entry in entries.flatten() {
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if meta.is_dir() {
                pending.push(entry.path());
            } else if meta.is_file() {
                if entry.file_name().to_string_lossy().starts_with(TEMP_PREFIX) {
                    continue;
                }
                let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                files.push((entry.path(), mtime, meta.len()));
            }
        }
    }
    files
}

fn evict_blocking(root: &Path, limit: u64) -> EvictionResult {
    let start = Instant::now();
    let mut files = collect_cache_files(root);
    let size_before: u64 = files.iter().map(|(_, _, size)| size).sum();

    if size_before <= limit {
        return EvictionResult {
            size_before,
            size_after: size_before,
            duration_ms: start.elapsed().as_millis() as u64,
            ..Default::default()
        };
    }

    let target = (limit as f64 * EVICTION_TARGET_PERCENTAGE) as u64;
    files.sort_by_key(|(_, mtime, _)| *mtime);

    let mut remaining = size_before;
    let mut bytes_freed = 0u64;
    let mut files_deleted = 0usize;
    for (path, _mtime, size) in files {
        if remaining <= target {
            break;
        }
        match fs::remove_file(&path) {
            Ok(()) => {
                remaining = remaining.saturating_sub(size);
                bytes_freed += size;
                files_deleted += 1;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to delete cache file during eviction");
            }
        }
    }

    EvictionResult {
        files_deleted,
        bytes_freed,
        size_before,
        size_after: remaining,
        duration_ms: start.elapsed().as_millis() as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Dataset;
    use std::time::Duration;
    use tempfile::TempDir;

    fn cache() -> (TempDir, DiskCache) {
        let dir = TempDir::new().unwrap();
        let registry: DatasetRegistry = vec![Dataset::image("sat", "http://h/{level}", "jpg")]
            .into_iter()
            .collect();
        let cache = DiskCache::new(dir.path(), Arc::new(registry));
        (dir, cache)
    }

    fn set_mtime(path: &Path, secs_ago: u64) {
        let time = SystemTime::now() - Duration::from_secs(secs_ago);
        filetime::set_file_mtime(path, filetime::FileTime::from_system_time(time)).unwrap();
    }

    #[test]
    fn test_path_layout() {
        let (dir, cache) = cache();
        let key = TileKey::new("sat", 2, 5, 9);
        assert_eq!(cache.path_for(&key), dir.path().join("sat/2/5/5_9.jpg"));

        let unknown = TileKey::new("other", 0, 1, 2);
        assert_eq!(cache.path_for(&unknown), dir.path().join("other/0/1/1_2.bin"));
    }

    #[tokio::test]
    async fn test_write_read_delete() {
        let (_dir, cache) = cache();
        let key = TileKey::new("sat", 1, 2, 3);

        assert!(!cache.exists(&key).await);
        assert!(cache.read(&key).await.unwrap().is_none());

        let path = cache
            .write_atomic(&key, Bytes::from_static(b"jpeg-bytes"))
            .await
            .unwrap();
        assert!(path.ends_with("sat/1/2/2_3.jpg"));
        assert!(cache.exists(&key).await);
        assert_eq!(cache.read(&key).await.unwrap().unwrap(), Bytes::from_static(b"jpeg-bytes"));

        assert!(cache.delete(&key).await.unwrap());
        assert!(!cache.delete(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_write_replaces_and_leaves_no_temp_files() {
        let (_dir, cache) = cache();
        let key = TileKey::new("sat", 0, 0, 0);
        cache.write_atomic(&key, Bytes::from_static(b"one")).await.unwrap();
        cache.write_atomic(&key, Bytes::from_static(b"two")).await.unwrap();

        assert_eq!(cache.read(&key).await.unwrap().unwrap(), Bytes::from_static(b"two"));
        let parent = cache.path_for(&key).parent().unwrap().to_path_buf();
        let names: Vec<_> = fs::read_dir(parent)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["0_0.jpg".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_publish_whole_files() {
        let (_dir, cache) = cache();
        let key = TileKey::new("sat", 3, 3, 3);
        let payloads: Vec<Bytes> = (0..8u8).map(|i| Bytes::from(vec![i; 64 * 1024])).collect();

        let writers: Vec<_> = payloads
            .iter()
            .cloned()
            .map(|data| {
                let cache = cache.clone();
                let key = key.clone();
                tokio::spawn(async move { cache.write_atomic(&key, data).await })
            })
            .collect();

        let reader = {
            let cache = cache.clone();
            let key = key.clone();
            let payloads = payloads.clone();
            tokio::spawn(async move {
                for _ in 0..50 {
                    if let Some(read) = cache.read(&key).await.unwrap() {
                        assert!(payloads.contains(&read), "observed a partial tile");
                    }
                    tokio::task::yield_now().await;
                }
            })
        };

        for writer in writers {
            writer.await.unwrap().unwrap();
        }
        reader.await.unwrap();

        let final_bytes = cache.read(&key).await.unwrap().unwrap();
        assert!(payloads.contains(&final_bytes));
    }

    #[tokio::test]
    async fn test_touch_and_modified() {
        let (_dir, cache) = cache();
        let key = TileKey::new("sat", 0, 1, 1);
        assert!(!cache.touch(&key).await.unwrap());
        assert!(cache.modified(&key).await.unwrap().is_none());

        cache.write_atomic(&key, Bytes::from_static(b"x")).await.unwrap();
        set_mtime(&cache.path_for(&key), 3600);
        let before = cache.modified(&key).await.unwrap().unwrap();

        assert!(cache.touch(&key).await.unwrap());
        let after = cache.modified(&key).await.unwrap().unwrap();
        assert!(after > before);
    }

    #[tokio::test]
    async fn test_evict_oldest_first() {
        let (_dir, cache) = cache();
        for col in 0..5u32 {
            let key = TileKey::new("sat", 0, 0, col);
            cache.write_atomic(&key, Bytes::from(vec![0u8; 100])).await.unwrap();
            // col 0 is the oldest
            set_mtime(&cache.path_for(&key), 1000 - col as u64 * 100);
        }
        assert_eq!(cache.usage().await.unwrap(), DiskUsage { files: 5, bytes: 500 });

        let result = cache.evict_to(400).await.unwrap();
        // target is 360 bytes: two files go
        assert_eq!(result.files_deleted, 2);
        assert_eq!(result.size_after, 300);
        assert!(!cache.exists(&TileKey::new("sat", 0, 0, 0)).await);
        assert!(!cache.exists(&TileKey::new("sat", 0, 0, 1)).await);
        assert!(cache.exists(&TileKey::new("sat", 0, 0, 4)).await);

        let noop = cache.evict_to(10_000).await.unwrap();
        assert_eq!(noop.files_deleted, 0);
    }

    #[tokio::test]
    async fn test_eviction_ignores_staging_files() {
        let (_dir, cache) = cache();
        let key = TileKey::new("sat", 0, 0, 0);
        let path = cache.write_atomic(&key, Bytes::from(vec![0u8; 100])).await.unwrap();
        set_mtime(&path, 500);

        // An older staging file of a write still in progress.
        let staged = path.with_file_name(format!("{}inflight", TEMP_PREFIX));
        std::fs::write(&staged, vec![0u8; 1000]).unwrap();
        set_mtime(&staged, 1000);

        assert_eq!(cache.usage().await.unwrap(), DiskUsage { files: 1, bytes: 100 });

        let result = cache.evict_to(50).await.unwrap();
        assert_eq!(result.size_before, 100);
        assert_eq!(result.files_deleted, 1);
        assert!(!cache.exists(&key).await);
        assert!(staged.exists());
    }

    #[tokio::test]
    async fn test_purge_dataset() {
        let (_dir, cache) = cache();
        cache
            .write_atomic(&TileKey::new("sat", 0, 0, 0), Bytes::from_static(b"abc"))
            .await
            .unwrap();
        cache
            .write_atomic(&TileKey::new("other", 0, 0, 0), Bytes::from_static(b"de"))
            .await
            .unwrap();

        let removed = cache.purge_dataset("sat").await.unwrap();
        assert_eq!(removed, DiskUsage { files: 1, bytes: 3 });
        assert_eq!(cache.usage().await.unwrap().files, 1);

        let removed = cache.purge_all().await.unwrap();
        assert_eq!(removed.files, 1);
        assert_eq!(cache.usage().await.unwrap(), DiskUsage::default());
    }
}
