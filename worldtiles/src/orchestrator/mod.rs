//! Tile request orchestration.
//!
//! The [`TileRequestOrchestrator`] decides, per tile, whether a request is
//! needed and drives it to a terminal state:
//!
//! ```text
//! Unrequested ──► Queued ──► Fetching ──► Ready
//!                   ▲            │
//!                   │            ▼
//!                   └──── Failed (retry pending) ──► GaveUp
//! ```
//!
//! Resident fresh artifacts are returned directly. Tiles on disk are decoded
//! without touching the network. Everything else goes through the
//! [`RetrievalService`], which deduplicates by locator. Masked datasets
//! submit two requests whose results are joined before processing.
//!
//! A background request made while the service is saturated is deferred;
//! immediate callers already waiting on that tile claim it themselves.
//! Only transport failures are refetched. A cache write that still fails
//! after the processor's own retries gives up.
//!
//! Every submission carries a monotonic generation. A completion whose
//! generation no longer matches the tile's record (because the tile was
//! cancelled, reset or resubmitted in the meantime) is ignored.

mod types;

pub use types::{
    EnsureMode, OrchestratorConfig, TileEvent, TileStatus, DEFAULT_EVENT_CAPACITY,
    DEFAULT_MASK_JOIN_TIMEOUT,
};

use crate::cache::{CachedArtifact, DiskCache, TileCache};
use crate::coord::TileKey;
use crate::dataset::{Dataset, DatasetRegistry};
use crate::error::TileError;
use crate::process::{join_pair, DownloadPostProcessor, ProcessJob};
use crate::retrieval::{
    FetchRequest, RetrievalResult, RetrievalService, TaskHandle, TaskState, Validators,
};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::{broadcast, watch};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};
use types::TileState;

/// Per-tile bookkeeping.
struct TileRecord {
    state: watch::Sender<TileState>,
    generation: u64,
    attempts: u32,
    priority: f32,
    handles: Vec<TaskHandle>,
    retry_timer: Option<AbortHandle>,
}

impl TileRecord {
    fn new() -> Self {
        let (state, _) = watch::channel(TileState::Unrequested);
        Self {
            state,
            generation: 0,
            attempts: 0,
            priority: 0.0,
            handles: Vec::new(),
            retry_timer: None,
        }
    }

    fn state(&self) -> TileState {
        self.state.borrow().clone()
    }

    fn set(&self, state: TileState) {
        self.state.send_replace(state);
    }

    fn abort_retry(&mut self) {
        if let Some(timer) = self.retry_timer.take() {
            timer.abort();
        }
    }
}

/// Outcome of claiming a tile for a new request.
enum Claim {
    Started {
        generation: u64,
        state: watch::Receiver<TileState>,
    },
    InProgress(watch::Receiver<TileState>),
    GaveUp(TileError),
}

struct Inner {
    datasets: Arc<DatasetRegistry>,
    service: Arc<RetrievalService>,
    processor: Arc<DownloadPostProcessor>,
    config: OrchestratorConfig,
    tiles: DashMap<TileKey, TileRecord>,
    expiries: DashMap<Arc<str>, SystemTime>,
    events: broadcast::Sender<TileEvent>,
    next_generation: AtomicU64,
}

/// Coordinates caches, retrieval and post-processing for tile requests.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct TileRequestOrchestrator {
    inner: Arc<Inner>,
}

impl TileRequestOrchestrator {
    pub fn new(
        datasets: Arc<DatasetRegistry>,
        service: Arc<RetrievalService>,
        processor: Arc<DownloadPostProcessor>,
        config: OrchestratorConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        info!(
            datasets = datasets.len(),
            max_retries = config.retry.max_retries(),
            mask_join_timeout_ms = config.mask_join_timeout.as_millis() as u64,
            "Tile orchestrator created"
        );
        Self {
            inner: Arc::new(Inner {
                datasets,
                service,
                processor,
                config,
                tiles: DashMap::new(),
                expiries: DashMap::new(),
                events,
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Makes sure a tile is, or becomes, available.
    ///
    /// In [`EnsureMode::Background`] this returns the tile's status right
    /// away. In [`EnsureMode::Immediate`] it waits for a terminal state and
    /// returns `Ok(Ready)` or the error the tile gave up with.
    pub async fn ensure(
        &self,
        key: &TileKey,
        priority: f32,
        mode: EnsureMode,
    ) -> Result<TileStatus, TileError> {
        let dataset = self.dataset(key)?;

        loop {
            let expiry = self.expiry_for(&dataset);
            if let Some(artifact) = self.inner.processor.memory().get(key) {
                if !artifact.is_stale(expiry) {
                    return Ok(TileStatus::Ready(artifact));
                }
                debug!(key = %key, "Resident tile is stale, revalidating");
            }

            let state = match self.claim(key, priority) {
                Claim::GaveUp(error) => {
                    return match mode {
                        EnsureMode::Background => Ok(TileStatus::GaveUp(error)),
                        EnsureMode::Immediate => Err(error),
                    };
                }
                Claim::InProgress(state) => state,
                Claim::Started { generation, state } => {
                    let job = ProcessJob {
                        key: key.clone(),
                        dataset: dataset.clone(),
                        generation,
                    };
                    if !self.start(job, priority, expiry, mode).await {
                        return Ok(TileStatus::Unrequested);
                    }
                    state
                }
            };

            if mode == EnsureMode::Background {
                return Ok(self.status(key));
            }
            match self.wait(key, state).await? {
                Some(artifact) => return Ok(TileStatus::Ready(artifact)),
                // Evicted before wakeup, or deferred by a background caller.
                None => continue,
            }
        }
    }

    /// Current status of a tile. Never triggers a request.
    pub fn status(&self, key: &TileKey) -> TileStatus {
        if let Some(dataset) = self.inner.datasets.get(&key.dataset) {
            if let Some(artifact) = self.inner.processor.memory().peek(key) {
                if !artifact.is_stale(self.expiry_for(&dataset)) {
                    return TileStatus::Ready(artifact);
                }
            }
        }

        let Some(record) = self.inner.tiles.get(key) else {
            return TileStatus::Unrequested;
        };
        match record.state() {
            TileState::Queued => {
                if record.handles.iter().any(|h| h.state() == TaskState::Running) {
                    TileStatus::Fetching
                } else {
                    TileStatus::Queued
                }
            }
            TileState::Failed { attempts, error } => TileStatus::Failed { attempts, error },
            TileState::GaveUp(error) => TileStatus::GaveUp(error),
            // Ready but no longer fresh or resident.
            TileState::Ready(_) | TileState::Unrequested | TileState::Deferred => {
                TileStatus::Unrequested
            }
        }
    }

    /// Clears a failed or given-up tile so the next `ensure` retries it.
    ///
    /// Returns `false` if the tile was not failed.
    pub fn reset(&self, key: &TileKey) -> bool {
        let Some(mut record) = self.inner.tiles.get_mut(key) else {
            return false;
        };
        if !matches!(
            record.state(),
            TileState::GaveUp(_) | TileState::Failed { .. }
        ) {
            return false;
        }
        record.abort_retry();
        record.generation = self.next_generation();
        record.attempts = 0;
        record.handles.clear();
        record.set(TileState::Unrequested);
        debug!(key = %key, "Tile reset");
        true
    }

    /// Cancels an in-progress tile.
    ///
    /// The underlying retrieval tasks are cancelled too, which also cancels
    /// them for any other subscriber joined to the same locator. Returns
    /// `false` if nothing was in progress.
    pub fn cancel(&self, key: &TileKey) -> bool {
        let handles = {
            let Some(mut record) = self.inner.tiles.get_mut(key) else {
                return false;
            };
            if !record.state().is_pending() {
                return false;
            }
            record.abort_retry();
            record.generation = self.next_generation();
            record.attempts = 0;
            record.set(TileState::Unrequested);
            std::mem::take(&mut record.handles)
        };

        for handle in &handles {
            self.inner.service.cancel(handle);
        }
        debug!(key = %key, tasks = handles.len(), "Tile cancelled");
        true
    }

    /// Marks everything of `dataset` stored at or before `at` as stale.
    ///
    /// Stale tiles are revalidated with a conditional fetch on their next
    /// `ensure`. Returns `false` for an unknown dataset.
    pub fn expire_dataset(&self, dataset: &str, at: SystemTime) -> bool {
        let Some(dataset) = self.inner.datasets.get(dataset) else {
            return false;
        };
        self.inner
            .expiries
            .entry(dataset.name.clone())
            .and_modify(|expiry| *expiry = (*expiry).max(at))
            .or_insert(at);
        info!(dataset = %dataset.name, "Dataset expired");
        true
    }

    /// Receives a [`TileEvent`] whenever a tile becomes ready or gives up.
    pub fn subscribe(&self) -> broadcast::Receiver<TileEvent> {
        self.inner.events.subscribe()
    }

    pub fn datasets(&self) -> &Arc<DatasetRegistry> {
        &self.inner.datasets
    }

    pub fn memory(&self) -> &Arc<TileCache> {
        self.inner.processor.memory()
    }

    pub fn disk(&self) -> &Arc<DiskCache> {
        self.inner.processor.disk()
    }

    pub fn processor(&self) -> &Arc<DownloadPostProcessor> {
        &self.inner.processor
    }

    pub fn service(&self) -> &Arc<RetrievalService> {
        &self.inner.service
    }

    /// Number of decode passes performed by the post-processor.
    pub fn decode_count(&self) -> u64 {
        self.inner.processor.decode_count()
    }

    fn dataset(&self, key: &TileKey) -> Result<Arc<Dataset>, TileError> {
        self.inner
            .datasets
            .get(&key.dataset)
            .ok_or_else(|| TileError::UnknownDataset(key.dataset.to_string()))
    }

    fn expiry_for(&self, dataset: &Dataset) -> Option<SystemTime> {
        let overridden = self.inner.expiries.get(&dataset.name).map(|e| *e);
        match (dataset.expiry, overridden) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    fn next_generation(&self) -> u64 {
        self.inner.next_generation.fetch_add(1, Ordering::Relaxed)
    }

    /// Claims the tile for a new request unless one is in progress.
    fn claim(&self, key: &TileKey, priority: f32) -> Claim {
        let mut record = self
            .inner
            .tiles
            .entry(key.clone())
            .or_insert_with(TileRecord::new);

        match record.state() {
            TileState::GaveUp(error) => Claim::GaveUp(error),
            state if state.is_pending() => {
                record.priority = record.priority.max(priority);
                Claim::InProgress(record.state.subscribe())
            }
            _ => {
                let generation = self.next_generation();
                record.generation = generation;
                record.priority = priority;
                record.attempts = 0;
                record.handles.clear();
                record.set(TileState::Queued);
                Claim::Started {
                    generation,
                    state: record.state.subscribe(),
                }
            }
        }
    }

    /// Marks a claimed tile `Deferred` if `generation` still owns it.
    fn release(&self, key: &TileKey, generation: u64) {
        if let Some(record) = self.inner.tiles.get_mut(key) {
            if record.generation == generation {
                record.set(TileState::Deferred);
            }
        }
    }

    /// Starts loading a claimed tile, from disk when fresh there.
    ///
    /// Returns `false` when the request was deferred because the retrieval
    /// service is saturated (background mode only).
    async fn start(
        &self,
        job: ProcessJob,
        priority: f32,
        expiry: Option<SystemTime>,
        mode: EnsureMode,
    ) -> bool {
        let modified = self
            .disk()
            .modified(&job.key)
            .await
            .ok()
            .flatten();
        if let Some(modified) = modified {
            if expiry.map_or(true, |expiry| modified > expiry) {
                self.spawn_disk_load(job, priority);
                return true;
            }
        }

        if mode == EnsureMode::Background && self.inner.service.is_saturated() {
            debug!(key = %job.key, "Retrieval service saturated, deferring tile");
            self.release(&job.key, job.generation);
            return false;
        }

        self.fetch(job, priority).await;
        true
    }

    /// Decodes the disk copy, falling back to the network if it is gone or
    /// unreadable.
    fn spawn_disk_load(&self, job: ProcessJob, priority: f32) {
        let this = self.clone();
        tokio::spawn(async move {
            match this.inner.processor.decode_from_disk(&job).await {
                Ok(Some(artifact)) => this.finish(&job, Ok(artifact)),
                Ok(None) => this.fetch(job, priority).await,
                Err(error) => {
                    warn!(key = %job.key, error = %error, "Cached tile is corrupt, refetching");
                    if let Err(e) = this.disk().delete(&job.key).await {
                        warn!(key = %job.key, error = %e, "Failed to delete corrupt tile");
                    }
                    this.fetch(job, priority).await;
                }
            }
        });
    }

    /// Submits the network request(s) for a tile.
    async fn fetch(&self, job: ProcessJob, priority: f32) {
        if !self.is_current(&job) {
            return;
        }
        if let Some(mask_locator) = job.dataset.mask_locator(&job.key) {
            self.fetch_masked(job, priority, mask_locator);
            return;
        }

        let locator = job.dataset.locator(&job.key);
        let request = match self.local_validators(&job.key).await {
            Some(validators) => FetchRequest::conditional(locator, validators),
            None => FetchRequest::new(locator),
        };

        let this = self.clone();
        let callback_job = job.clone();
        let handle = self.inner.service.submit(
            request,
            priority,
            Box::new(move |result: &RetrievalResult| {
                let result = result.clone();
                tokio::spawn(async move {
                    let outcome = this.inner.processor.process(result, &callback_job).await;
                    this.finish(&callback_job, outcome);
                });
            }),
        );
        self.track(&job, handle);
    }

    /// Masked tiles are always fetched unconditionally.
    fn fetch_masked(&self, job: ProcessJob, priority: f32, mask_locator: String) {
        let (primary, mask, join) = join_pair(job.key.to_string());
        let primary_handle = self.inner.service.submit(
            FetchRequest::new(job.dataset.locator(&job.key)),
            priority,
            primary.into_callback(),
        );
        let mask_handle =
            self.inner
                .service
                .submit(FetchRequest::new(mask_locator), priority, mask.into_callback());
        self.track(&job, primary_handle);
        self.track(&job, mask_handle);

        let this = self.clone();
        let timeout = self.inner.config.mask_join_timeout;
        tokio::spawn(async move {
            let outcome = match join.wait(timeout).await {
                Ok((primary, mask)) => {
                    this.inner
                        .processor
                        .process_masked(primary, mask, &job)
                        .await
                }
                Err(error) => Err(error),
            };
            this.finish(&job, outcome);
        });
    }

    /// Validators for a conditional fetch, if a local copy exists.
    async fn local_validators(&self, key: &TileKey) -> Option<Validators> {
        let modified = self.disk().modified(key).await.ok().flatten();
        let resident = self.memory().peek(key);
        let validators = Validators {
            etag: resident
                .as_ref()
                .and_then(|artifact| artifact.validators.etag.clone()),
            last_modified: modified.or_else(|| {
                resident
                    .as_ref()
                    .and_then(|artifact| artifact.validators.last_modified)
            }),
        };
        (!validators.is_empty()).then_some(validators)
    }

    fn is_current(&self, job: &ProcessJob) -> bool {
        self.inner
            .tiles
            .get(&job.key)
            .is_some_and(|record| record.generation == job.generation)
    }

    fn track(&self, job: &ProcessJob, handle: TaskHandle) {
        if let Some(mut record) = self.inner.tiles.get_mut(&job.key) {
            if record.generation == job.generation && record.state().is_pending() {
                record.handles.push(handle);
            }
        }
    }

    /// Records the outcome of an attempt and schedules a retry if allowed.
    fn finish(&self, job: &ProcessJob, outcome: Result<Arc<CachedArtifact>, TileError>) {
        let Some(mut record) = self.inner.tiles.get_mut(&job.key) else {
            return;
        };
        if record.generation != job.generation {
            debug!(
                key = %job.key,
                generation = job.generation,
                current = record.generation,
                "Ignoring completion of superseded request"
            );
            return;
        }
        record.handles.clear();

        match outcome {
            Ok(artifact) => {
                record.attempts = 0;
                record.set(TileState::Ready(Arc::downgrade(&artifact)));
                drop(record);
                debug!(key = %job.key, generation = job.generation, "Tile ready");
                let _ = self.inner.events.send(TileEvent::Ready(job.key.clone()));
            }
            Err(TileError::Cancelled) => {
                record.set(TileState::Unrequested);
                debug!(key = %job.key, "Tile request cancelled");
            }
            Err(error) => {
                record.attempts += 1;
                let attempts = record.attempts;
                // Cache writes were already retried by the processor.
                let delay = if error.needs_refetch() {
                    self.inner.config.retry.delay_for_attempt(attempts)
                } else {
                    None
                };

                match delay {
                    Some(delay) => {
                        warn!(
                            key = %job.key,
                            attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %error,
                            "Tile attempt failed, retrying"
                        );
                        record.set(TileState::Failed { attempts, error });
                        let this = self.clone();
                        let retry_job = job.clone();
                        let priority = record.priority;
                        let timer = tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            this.retry(retry_job, priority).await;
                        });
                        record.retry_timer = Some(timer.abort_handle());
                    }
                    None => {
                        warn!(key = %job.key, attempts, error = %error, "Giving up on tile");
                        record.set(TileState::GaveUp(error));
                        drop(record);
                        let _ = self.inner.events.send(TileEvent::GaveUp(job.key.clone()));
                    }
                }
            }
        }
    }

    /// Resubmits a failed tile under a new generation.
    async fn retry(&self, job: ProcessJob, priority: f32) {
        let generation = {
            let Some(mut record) = self.inner.tiles.get_mut(&job.key) else {
                return;
            };
            if record.generation != job.generation
                || !matches!(record.state(), TileState::Failed { .. })
            {
                return;
            }
            record.retry_timer = None;
            let generation = self.next_generation();
            record.generation = generation;
            record.set(TileState::Queued);
            generation
        };

        debug!(key = %job.key, generation, "Retrying tile");
        self.fetch(ProcessJob { generation, ..job }, priority).await;
    }

    /// Waits for a terminal state.
    ///
    /// Returns `Ok(None)` when the tile became ready but its artifact was
    /// evicted before it could be handed out, or when a background request
    /// deferred it. Either way the caller claims the tile again.
    async fn wait(
        &self,
        key: &TileKey,
        mut state: watch::Receiver<TileState>,
    ) -> Result<Option<Arc<CachedArtifact>>, TileError> {
        loop {
            let current = state.borrow_and_update().clone();
            match current {
                TileState::Ready(artifact) => {
                    return Ok(artifact.upgrade().or_else(|| self.memory().peek(key)))
                }
                TileState::GaveUp(error) => return Err(error),
                TileState::Deferred => return Ok(None),
                TileState::Unrequested => return Err(TileError::Cancelled),
                TileState::Queued | TileState::Failed { .. } => {}
            }
            if state.changed().await.is_err() {
                return Err(TileError::Cancelled);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::decode::tests::png_bytes;
    use crate::retrieval::http::tests::MockHttpClient;
    use crate::retrieval::{
        HttpResponse, IdentityRewriter, RetrievalConfig, RetrieverRouter, RetryPolicy,
    };
    use crate::error::TransportError;
    use std::time::Duration;
    use tempfile::TempDir;

    const URL: &str = "http://tiles.test/img/1/2/3.png";

    struct Harness {
        _dir: TempDir,
        client: Arc<MockHttpClient>,
        orchestrator: TileRequestOrchestrator,
    }

    fn harness(datasets: Vec<Dataset>) -> Harness {
        harness_with(datasets, RetrievalConfig::default())
    }

    fn harness_with(datasets: Vec<Dataset>, retrieval: RetrievalConfig) -> Harness {
        let dir = TempDir::new().unwrap();
        let client = Arc::new(MockHttpClient::new());
        let datasets: Arc<DatasetRegistry> = Arc::new(datasets.into_iter().collect());
        let router = RetrieverRouter::new(client.clone(), Arc::new(IdentityRewriter));
        let service = Arc::new(RetrievalService::start(retrieval, Arc::new(router)));
        let processor = Arc::new(DownloadPostProcessor::new(
            Arc::new(TileCache::new(16 << 20)),
            Arc::new(DiskCache::new(dir.path(), datasets.clone())),
            RetryPolicy::None,
        ));
        let config = OrchestratorConfig {
            retry: RetryPolicy::from_max_retries(1, Duration::from_millis(10)),
            ..Default::default()
        };
        Harness {
            _dir: dir,
            client,
            orchestrator: TileRequestOrchestrator::new(datasets, service, processor, config),
        }
    }

    fn image_dataset() -> Dataset {
        Dataset::image("img", "http://tiles.test/{dataset}/{level}/{row}/{col}.png", "png")
    }

    fn key() -> TileKey {
        TileKey::new("img", 1, 2, 3)
    }

    #[tokio::test]
    async fn test_unknown_dataset() {
        let h = harness(vec![image_dataset()]);
        let err = h
            .orchestrator
            .ensure(&TileKey::new("nope", 0, 0, 0), 1.0, EnsureMode::Background)
            .await
            .unwrap_err();
        assert_eq!(err, TileError::UnknownDataset("nope".into()));
    }

    #[tokio::test]
    async fn test_background_then_event() {
        let h = harness(vec![image_dataset()]);
        h.client
            .respond(URL, Ok(HttpResponse::ok(png_bytes(4, 4, [1, 2, 3, 255]))));
        let mut events = h.orchestrator.subscribe();

        let status = h
            .orchestrator
            .ensure(&key(), 1.0, EnsureMode::Background)
            .await
            .unwrap();
        assert!(status.is_pending() || status.is_ready());

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, TileEvent::Ready(key()));
        assert!(h.orchestrator.status(&key()).is_ready());
        assert!(h.orchestrator.disk().exists(&key()).await);
    }

    #[tokio::test]
    async fn test_fresh_disk_copy_skips_network() {
        let h = harness(vec![image_dataset()]);
        h.orchestrator
            .disk()
            .write_atomic(&key(), png_bytes(2, 2, [7, 7, 7, 255]).into())
            .await
            .unwrap();

        let status = h
            .orchestrator
            .ensure(&key(), 1.0, EnsureMode::Immediate)
            .await
            .unwrap();
        assert_eq!(status.artifact().unwrap().dimensions(), (2, 2));
        assert_eq!(h.client.request_count(), 0);
    }

    #[tokio::test]
    async fn test_corrupt_disk_copy_is_refetched() {
        let h = harness(vec![image_dataset()]);
        h.orchestrator
            .disk()
            .write_atomic(&key(), bytes::Bytes::from_static(b"corrupt"))
            .await
            .unwrap();
        h.client
            .respond(URL, Ok(HttpResponse::ok(png_bytes(4, 4, [1, 2, 3, 255]))));

        let status = h
            .orchestrator
            .ensure(&key(), 1.0, EnsureMode::Immediate)
            .await
            .unwrap();
        assert_eq!(status.artifact().unwrap().dimensions(), (4, 4));
        assert_eq!(h.client.request_count(), 1);
    }

    #[tokio::test]
    async fn test_decode_error_gives_up_without_retry() {
        let h = harness(vec![image_dataset()]);
        h.client.respond(URL, Ok(HttpResponse::ok(b"not a png".to_vec())));

        let err = h
            .orchestrator
            .ensure(&key(), 1.0, EnsureMode::Immediate)
            .await
            .unwrap_err();
        assert!(matches!(err, TileError::Decode(_)));
        assert_eq!(h.client.request_count(), 1);
        assert!(matches!(h.orchestrator.status(&key()), TileStatus::GaveUp(_)));
    }

    #[tokio::test]
    async fn test_expired_tile_is_revalidated() {
        let h = harness(vec![image_dataset()]);
        h.client
            .respond(URL, Ok(HttpResponse::ok(png_bytes(4, 4, [1, 2, 3, 255]))));
        h.client.respond(URL, Ok(HttpResponse::status(304)));

        let first = h
            .orchestrator
            .ensure(&key(), 1.0, EnsureMode::Immediate)
            .await
            .unwrap();
        assert!(h.orchestrator.expire_dataset("img", SystemTime::now()));
        assert!(!h.orchestrator.status(&key()).is_ready());

        let second = h
            .orchestrator
            .ensure(&key(), 1.0, EnsureMode::Immediate)
            .await
            .unwrap();
        let requests = h.client.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests[1].1.is_some());
        assert!(Arc::ptr_eq(
            &first.artifact().unwrap().payload,
            &second.artifact().unwrap().payload
        ));
        assert_eq!(h.orchestrator.decode_count(), 1);
    }

    #[tokio::test]
    async fn test_cancel_without_request() {
        let h = harness(vec![image_dataset()]);
        assert!(!h.orchestrator.cancel(&key()));
        assert!(!h.orchestrator.reset(&key()));
    }

    #[tokio::test]
    async fn test_transport_error_status_reports_attempts() {
        let h = harness(vec![image_dataset()]);
        h.client
            .respond(URL, Err(TransportError::Timeout(URL.into())));

        let err = h
            .orchestrator
            .ensure(&key(), 1.0, EnsureMode::Immediate)
            .await
            .unwrap_err();
        assert!(matches!(err, TileError::Transport(TransportError::Timeout(_))));
        // One attempt plus one retry.
        assert_eq!(h.client.request_count(), 2);

        assert!(h.orchestrator.reset(&key()));
        assert!(!h.orchestrator.reset(&key()));
        assert!(matches!(
            h.orchestrator.status(&key()),
            TileStatus::Unrequested
        ));
    }

    #[tokio::test]
    async fn test_cache_write_failure_does_not_refetch() {
        let h = harness(vec![image_dataset()]);
        h.client
            .respond(URL, Ok(HttpResponse::ok(png_bytes(4, 4, [1, 2, 3, 255]))));
        // A file where the dataset directory should be blocks every write.
        std::fs::write(h.orchestrator.disk().root().join("img"), b"blocker").unwrap();

        let err = h
            .orchestrator
            .ensure(&key(), 1.0, EnsureMode::Immediate)
            .await
            .unwrap_err();
        assert!(matches!(err, TileError::CacheWrite { .. }));
        assert_eq!(h.client.request_count(), 1);
        assert!(matches!(
            h.orchestrator.status(&key()),
            TileStatus::GaveUp(TileError::CacheWrite { .. })
        ));
    }

    #[tokio::test]
    async fn test_immediate_waiter_survives_background_deferral() {
        const BUSY: &str = "http://tiles.test/busy";
        let h = harness_with(
            vec![image_dataset()],
            RetrievalConfig {
                workers: 1,
                queue_capacity: 0,
            },
        );
        h.client
            .respond(URL, Ok(HttpResponse::ok(png_bytes(4, 4, [1, 2, 3, 255]))));
        let gate = h.client.hold(BUSY);

        // Occupy the only worker so the service reports saturation.
        let busy = h.orchestrator.service().submit(
            FetchRequest::new(BUSY),
            0.0,
            Box::new(|_: &RetrievalResult| {}),
        );
        while busy.state() != TaskState::Running {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(h.orchestrator.service().is_saturated());

        let tile_key = key();
        let (background, immediate, _) = tokio::join!(
            h.orchestrator.ensure(&tile_key, 1.0, EnsureMode::Background),
            tokio::time::timeout(
                Duration::from_secs(5),
                h.orchestrator.ensure(&tile_key, 5.0, EnsureMode::Immediate),
            ),
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                gate.add_permits(1);
            },
        );

        assert!(matches!(background, Ok(TileStatus::Unrequested)));
        let status = immediate.expect("immediate ensure timed out").unwrap();
        assert!(status.is_ready());
        assert_eq!(h.client.requests().iter().filter(|(u, _)| u == URL).count(), 1);
    }
}
