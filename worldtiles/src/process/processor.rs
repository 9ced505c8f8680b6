//! Turns retrieval results into cached artifacts.
//!
//! For a fetched tile the post-processor decodes the bytes, runs the
//! dataset's transforms, persists the result to the disk cache and only then
//! inserts the artifact into the memory cache. A not-modified answer reuses
//! the resident artifact (or the disk copy) without touching the network
//! again.

use super::decode::{decode_image, decode_payload, encode_image};
use super::transform::{apply_transforms, compose_mask};
use crate::cache::{CachedArtifact, DiskCache, PutOutcome, TileCache, TilePayload};
use crate::coord::TileKey;
use crate::dataset::{ContentKind, Dataset};
use crate::error::{DecodeError, TileError, TransportError};
use crate::retrieval::{FetchedBytes, RetrievalOutcome, RetrievalResult, RetryPolicy, Validators};
use bytes::Bytes;
use image::DynamicImage;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// What to do with one retrieval result.
#[derive(Debug, Clone)]
pub struct ProcessJob {
    pub key: TileKey,
    pub dataset: Arc<Dataset>,
    /// Generation of the submission that produced the result.
    pub generation: u64,
}

/// Output of a decode pass: the payload and the bytes to persist.
struct Decoded {
    payload: TilePayload,
    persist: Bytes,
}

/// Decodes, transforms, persists and caches fetched tiles.
pub struct DownloadPostProcessor {
    memory: Arc<TileCache>,
    disk: Arc<DiskCache>,
    write_retry: RetryPolicy,
    decodes: Arc<AtomicU64>,
}

impl DownloadPostProcessor {
    pub fn new(memory: Arc<TileCache>, disk: Arc<DiskCache>, write_retry: RetryPolicy) -> Self {
        Self {
            memory,
            disk,
            write_retry,
            decodes: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn memory(&self) -> &Arc<TileCache> {
        &self.memory
    }

    pub fn disk(&self) -> &Arc<DiskCache> {
        &self.disk
    }

    /// Number of decode passes performed so far.
    pub fn decode_count(&self) -> u64 {
        self.decodes.load(Ordering::Relaxed)
    }

    /// Processes the result of a single (unmasked) retrieval.
    pub async fn process(
        &self,
        result: RetrievalResult,
        job: &ProcessJob,
    ) -> Result<Arc<CachedArtifact>, TileError> {
        match result.outcome {
            RetrievalOutcome::Failed(e) => Err(TileError::Transport(e)),
            RetrievalOutcome::Cancelled => Err(TileError::Cancelled),
            RetrievalOutcome::NotModified => self.not_modified(job).await,
            RetrievalOutcome::Fetched(fetched) => {
                if let Some(newer) = self.superseding(job) {
                    return Ok(newer);
                }
                let validators = fetched.validators.clone();
                let decoded = self.decode_fetched(fetched, job).await?;
                self.publish(decoded, validators, job).await
            }
        }
    }

    /// Processes the joined primary and mask results of a masked tile.
    pub async fn process_masked(
        &self,
        primary: RetrievalResult,
        mask: RetrievalResult,
        job: &ProcessJob,
    ) -> Result<Arc<CachedArtifact>, TileError> {
        let (primary, mask) = match (primary.outcome, mask.outcome) {
            (RetrievalOutcome::Failed(e), _) | (_, RetrievalOutcome::Failed(e)) => {
                return Err(TileError::Transport(e))
            }
            (RetrievalOutcome::Cancelled, _) | (_, RetrievalOutcome::Cancelled) => {
                return Err(TileError::Cancelled)
            }
            (RetrievalOutcome::Fetched(p), RetrievalOutcome::Fetched(m)) => (p, m),
            _ => return self.not_modified(job).await,
        };

        if let Some(newer) = self.superseding(job) {
            return Ok(newer);
        }

        let validators = primary.validators.clone();
        let dataset = job.dataset.clone();
        let decodes = self.decodes.clone();
        let decoded = blocking_decode(move || {
            decodes.fetch_add(1, Ordering::Relaxed);
            let primary_bytes = inflate_if_needed(&primary)?;
            let mask_bytes = inflate_if_needed(&mask)?;
            let mut image = decode_image(&primary_bytes)?;
            let mask = DynamicImage::ImageRgba8(decode_image(&mask_bytes)?).to_luma8();
            compose_mask(&mut image, &mask)?;
            let image = apply_transforms(image, &dataset.transforms);
            let persist = encode_image(&image, &dataset.format)?;
            Ok(Decoded {
                payload: TilePayload::Image(image),
                persist,
            })
        })
        .await?;

        self.publish(decoded, validators, job).await
    }

    /// Decodes the disk copy of a tile into the memory cache.
    ///
    /// Disk bytes are stored post-transform, so no transforms run here.
    /// Returns `Ok(None)` when the tile is not on disk.
    pub async fn decode_from_disk(
        &self,
        job: &ProcessJob,
    ) -> Result<Option<Arc<CachedArtifact>>, TileError> {
        let bytes = match self.disk.read(&job.key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Ok(None),
            Err(e) => {
                warn!(key = %job.key, error = %e, "Failed to read cached tile");
                return Ok(None);
            }
        };
        let modified = self.disk.modified(&job.key).await.ok().flatten();

        let dataset = job.dataset.clone();
        let decodes = self.decodes.clone();
        let payload = blocking_decode(move || {
            decodes.fetch_add(1, Ordering::Relaxed);
            decode_payload(&bytes, false, &dataset)
        })
        .await?;

        let artifact = Arc::new(CachedArtifact::new(
            job.key.clone(),
            payload,
            job.generation,
            Validators {
                etag: None,
                last_modified: modified,
            },
        ));
        debug!(key = %job.key, "Decoded tile from disk cache");
        Ok(Some(self.insert(artifact)))
    }

    /// Handles a validator match: no new bytes, no decode if resident.
    async fn not_modified(&self, job: &ProcessJob) -> Result<Arc<CachedArtifact>, TileError> {
        let artifact = match self.memory.peek(&job.key) {
            Some(resident) => {
                let refreshed = Arc::new(resident.refreshed(job.generation.max(resident.generation)));
                self.insert(refreshed)
            }
            None => self.decode_from_disk(job).await?.ok_or_else(|| {
                TileError::Transport(TransportError::NotFound(format!(
                    "{} not modified but not cached",
                    job.key
                )))
            })?,
        };

        if let Err(e) = self.disk.touch(&job.key).await {
            warn!(key = %job.key, error = %e, "Failed to refresh cached tile mtime");
        }
        debug!(key = %job.key, "Tile not modified");
        Ok(artifact)
    }

    async fn decode_fetched(
        &self,
        fetched: FetchedBytes,
        job: &ProcessJob,
    ) -> Result<Decoded, TileError> {
        let dataset = job.dataset.clone();
        let decodes = self.decodes.clone();
        blocking_decode(move || {
            decodes.fetch_add(1, Ordering::Relaxed);
            let payload = decode_payload(&fetched.bytes, fetched.compressed, &dataset)?;
            match (payload, dataset.content) {
                (TilePayload::Image(image), ContentKind::Image) if !dataset.transforms.is_empty() => {
                    let image = apply_transforms(image, &dataset.transforms);
                    let persist = encode_image(&image, &dataset.format)?;
                    Ok(Decoded {
                        payload: TilePayload::Image(image),
                        persist,
                    })
                }
                (payload, _) => Ok(Decoded {
                    payload,
                    persist: fetched.bytes,
                }),
            }
        })
        .await
    }

    /// Persists (when configured) and then caches a decoded tile.
    async fn publish(
        &self,
        decoded: Decoded,
        validators: Validators,
        job: &ProcessJob,
    ) -> Result<Arc<CachedArtifact>, TileError> {
        if let Some(newer) = self.superseding(job) {
            return Ok(newer);
        }

        if job.dataset.persist {
            self.persist(&job.key, decoded.persist).await?;
        }

        let artifact = Arc::new(CachedArtifact::new(
            job.key.clone(),
            decoded.payload,
            job.generation,
            validators,
        ));
        Ok(self.insert(artifact))
    }

    /// Writes with retries; only the write is repeated, never the fetch.
    async fn persist(&self, key: &TileKey, bytes: Bytes) -> Result<(), TileError> {
        let mut attempt = 0;
        loop {
            match self.disk.write_atomic(key, bytes.clone()).await {
                Ok(_) => return Ok(()),
                Err(e) => {
                    attempt += 1;
                    match self.write_retry.delay_for_attempt(attempt) {
                        Some(delay) => {
                            warn!(key = %key, attempt, error = %e, "Cache write failed, retrying");
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            return Err(TileError::CacheWrite {
                                path: self.disk.path_for(key).display().to_string(),
                                message: e.to_string(),
                            })
                        }
                    }
                }
            }
        }
    }

    /// Inserts into memory; a newer resident artifact wins.
    fn insert(&self, artifact: Arc<CachedArtifact>) -> Arc<CachedArtifact> {
        match self.memory.put(artifact.clone()) {
            PutOutcome::Superseded => self.memory.peek(&artifact.key).unwrap_or(artifact),
            _ => artifact,
        }
    }

    /// The resident artifact when it is newer than this job's generation.
    fn superseding(&self, job: &ProcessJob) -> Option<Arc<CachedArtifact>> {
        self.memory
            .peek(&job.key)
            .filter(|resident| resident.generation > job.generation)
            .inspect(|resident| {
                debug!(
                    key = %job.key,
                    resident = resident.generation,
                    generation = job.generation,
                    "Discarding result superseded by newer artifact"
                )
            })
    }
}

/// Masked tiles are images, whose magic bytes never collide with gzip/zip,
/// so `decompress` may sniff regardless of the retriever's flag.
fn inflate_if_needed(fetched: &FetchedBytes) -> Result<Bytes, DecodeError> {
    crate::compression::decompress(&fetched.bytes)
}

async fn blocking_decode<T, F>(f: F) -> Result<T, TileError>
where
    F: FnOnce() -> Result<T, DecodeError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result.map_err(TileError::Decode),
        Err(e) => Err(TileError::Decode(DecodeError::Image(format!(
            "decode task failed: {}",
            e
        )))),
    }
}
