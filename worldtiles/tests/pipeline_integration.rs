//! Integration tests for the tile pipeline.
//!
//! These tests drive a full [`TileEngine`] (retrieval workers, post-processing,
//! memory and disk caches, orchestrator) over a scripted HTTP client:
//! - fetch, persist and reload across engine restarts
//! - request de-duplication for concurrent callers
//! - conditional revalidation without a second decode
//! - retry, give-up and reset
//! - mask joins and cancellation
//!
//! Run with: `cargo test --test pipeline_integration`

use std::collections::{HashMap, VecDeque};
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures::future::BoxFuture;
use image::{ImageFormat, Rgba, RgbaImage};
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use worldtiles::config::ConfigFile;
use worldtiles::retrieval::{HttpClient, HttpResponse, Validators};
use worldtiles::{
    AppConfig, EnsureMode, TileEngine, TileError, TileEvent, TileKey, TileStatus, TransportError,
};

// ============================================================================
// Helper Functions
// ============================================================================

const CONFIG: &str = "\
[dataset.sat]
url = http://tiles.test/sat/{level}/{row}/{col}.png

[dataset.water]
url = http://tiles.test/water/{level}/{row}/{col}.png
mask_url = http://tiles.test/mask/{level}/{row}/{col}.png
";

const SAT_URL: &str = "http://tiles.test/sat/3/4/5.png";
const WATER_URL: &str = "http://tiles.test/water/3/4/5.png";
const MASK_URL: &str = "http://tiles.test/mask/3/4/5.png";

fn sat_key() -> TileKey {
    TileKey::new("sat", 3, 4, 5)
}

fn water_key() -> TileKey {
    TileKey::new("water", 3, 4, 5)
}

fn png(width: u32, height: u32, color: [u8; 4]) -> Vec<u8> {
    let img = RgbaImage::from_pixel(width, height, Rgba(color));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png).unwrap();
    out.into_inner()
}

/// HTTP client serving scripted responses.
///
/// Each URL answers from its queue; the last response repeats. Unknown URLs
/// answer 404. When gated, every request waits for a permit before it
/// answers.
#[derive(Default)]
struct ScriptedClient {
    responses: Mutex<HashMap<String, VecDeque<Result<HttpResponse, TransportError>>>>,
    requests: Mutex<Vec<(String, Option<Validators>)>>,
    gate: Option<Semaphore>,
}

impl ScriptedClient {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn gated() -> Arc<Self> {
        Arc::new(Self {
            gate: Some(Semaphore::new(0)),
            ..Default::default()
        })
    }

    fn respond(&self, url: &str, response: Result<HttpResponse, TransportError>) {
        self.responses
            .lock()
            .entry(url.to_string())
            .or_default()
            .push_back(response);
    }

    fn open(&self, permits: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(permits);
        }
    }

    fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    fn requests(&self) -> Vec<(String, Option<Validators>)> {
        self.requests.lock().clone()
    }

    fn next_response(&self, url: &str) -> Result<HttpResponse, TransportError> {
        let mut responses = self.responses.lock();
        match responses.get_mut(url) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) if !queue.is_empty() => queue[0].clone(),
            _ => Ok(HttpResponse::status(404)),
        }
    }

    async fn wait_for_requests(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.request_count() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("requests never arrived");
    }
}

impl HttpClient for ScriptedClient {
    fn get<'a>(
        &'a self,
        url: &'a str,
        validators: Option<&'a Validators>,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<HttpResponse, TransportError>> {
        Box::pin(async move {
            self.requests
                .lock()
                .push((url.to_string(), validators.cloned()));
            if let Some(gate) = &self.gate {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(TransportError::Aborted(url.to_string())),
                    permit = gate.acquire() => permit.unwrap().forget(),
                }
            }
            self.next_response(url)
        })
    }
}

fn app_config(dir: &Path) -> AppConfig {
    let file = ConfigFile::parse(CONFIG).unwrap();
    AppConfig::from_config_file(&file)
        .with_cache_directory(dir.join("tiles"))
        .with_gc_interval(None)
        .with_retry_policy(1, Duration::from_millis(10))
}

async fn engine(dir: &Path, client: Arc<ScriptedClient>) -> TileEngine {
    TileEngine::with_http_client(app_config(dir), client)
        .await
        .unwrap()
}

// ============================================================================
// Integration Tests
// ============================================================================

/// A fetched tile is decoded, cached in memory and persisted to disk.
#[tokio::test]
async fn test_fetch_persists_and_reloads_after_restart() {
    let dir = TempDir::new().unwrap();
    let client = ScriptedClient::new();
    client.respond(SAT_URL, Ok(HttpResponse::ok(png(8, 8, [10, 20, 30, 255]))));

    let first = engine(dir.path(), client.clone()).await;
    let status = first
        .orchestrator()
        .ensure(&sat_key(), 1.0, EnsureMode::Immediate)
        .await
        .unwrap();
    assert_eq!(status.artifact().unwrap().dimensions(), (8, 8));
    assert!(first.orchestrator().disk().exists(&sat_key()).await);
    first.shutdown().await;

    // A new engine over the same directory serves the tile from disk.
    let second = engine(dir.path(), client.clone()).await;
    let status = second
        .orchestrator()
        .ensure(&sat_key(), 1.0, EnsureMode::Immediate)
        .await
        .unwrap();
    assert!(status.is_ready());
    assert_eq!(client.request_count(), 1);
    second.shutdown().await;
}

/// Concurrent callers for the same tile share a single request and artifact.
#[tokio::test]
async fn test_concurrent_ensures_share_one_request() {
    let dir = TempDir::new().unwrap();
    let client = ScriptedClient::gated();
    client.respond(SAT_URL, Ok(HttpResponse::ok(png(4, 4, [1, 2, 3, 255]))));
    let engine = engine(dir.path(), client.clone()).await;

    let mut waiters = Vec::new();
    for _ in 0..8 {
        let orchestrator = engine.orchestrator().clone();
        waiters.push(tokio::spawn(async move {
            orchestrator
                .ensure(&sat_key(), 1.0, EnsureMode::Immediate)
                .await
        }));
    }

    client.wait_for_requests(1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(client.request_count(), 1);
    client.open(1);

    let mut artifacts = Vec::new();
    for waiter in waiters {
        let status = waiter.await.unwrap().unwrap();
        artifacts.push(status.artifact().unwrap().clone());
    }
    assert!(artifacts
        .iter()
        .all(|a| Arc::ptr_eq(&a.payload, &artifacts[0].payload)));
    assert_eq!(client.request_count(), 1);
    assert_eq!(engine.orchestrator().decode_count(), 1);
    engine.shutdown().await;
}

/// A 304 answer refreshes the resident tile without decoding it again.
#[tokio::test]
async fn test_not_modified_reuses_resident_tile() {
    let dir = TempDir::new().unwrap();
    let client = ScriptedClient::new();
    client.respond(
        SAT_URL,
        Ok(HttpResponse {
            etag: Some("\"v1\"".into()),
            ..HttpResponse::ok(png(4, 4, [1, 2, 3, 255]))
        }),
    );
    client.respond(SAT_URL, Ok(HttpResponse::status(304)));
    let engine = engine(dir.path(), client.clone()).await;
    let orchestrator = engine.orchestrator();

    let first = orchestrator
        .ensure(&sat_key(), 1.0, EnsureMode::Immediate)
        .await
        .unwrap();
    assert!(orchestrator.expire_dataset("sat", SystemTime::now()));

    let second = orchestrator
        .ensure(&sat_key(), 1.0, EnsureMode::Immediate)
        .await
        .unwrap();

    let requests = client.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[0].1.is_none());
    let validators = requests[1].1.clone().unwrap();
    assert_eq!(validators.etag.as_deref(), Some("\"v1\""));
    assert!(Arc::ptr_eq(
        &first.artifact().unwrap().payload,
        &second.artifact().unwrap().payload
    ));
    assert_eq!(orchestrator.decode_count(), 1);
    engine.shutdown().await;
}

/// Transport errors are retried once, then the tile gives up until reset.
#[tokio::test]
async fn test_retry_give_up_and_reset() {
    let dir = TempDir::new().unwrap();
    let client = ScriptedClient::new();
    client.respond(SAT_URL, Err(TransportError::Timeout(SAT_URL.into())));
    client.respond(SAT_URL, Err(TransportError::Timeout(SAT_URL.into())));
    client.respond(SAT_URL, Ok(HttpResponse::ok(png(2, 2, [9, 9, 9, 255]))));
    let engine = engine(dir.path(), client.clone()).await;
    let orchestrator = engine.orchestrator();
    let mut events = orchestrator.subscribe();

    let err = orchestrator
        .ensure(&sat_key(), 1.0, EnsureMode::Immediate)
        .await
        .unwrap_err();
    assert!(matches!(err, TileError::Transport(TransportError::Timeout(_))));
    assert_eq!(client.request_count(), 2);
    assert_eq!(events.recv().await.unwrap(), TileEvent::GaveUp(sat_key()));

    // A given-up tile stays given up without touching the network.
    let status = orchestrator
        .ensure(&sat_key(), 1.0, EnsureMode::Background)
        .await
        .unwrap();
    assert!(matches!(status, TileStatus::GaveUp(_)));
    assert_eq!(client.request_count(), 2);

    assert!(orchestrator.reset(&sat_key()));
    let status = orchestrator
        .ensure(&sat_key(), 1.0, EnsureMode::Immediate)
        .await
        .unwrap();
    assert!(status.is_ready());
    assert_eq!(client.request_count(), 3);
    assert_eq!(events.recv().await.unwrap(), TileEvent::Ready(sat_key()));
    engine.shutdown().await;
}

/// Background mode returns at once and announces readiness via an event.
#[tokio::test]
async fn test_background_ensure_emits_ready_event() {
    let dir = TempDir::new().unwrap();
    let client = ScriptedClient::new();
    client.respond(SAT_URL, Ok(HttpResponse::ok(png(4, 4, [5, 5, 5, 255]))));
    let engine = engine(dir.path(), client.clone()).await;
    let orchestrator = engine.orchestrator();
    let mut events = orchestrator.subscribe();

    let status = orchestrator
        .ensure(&sat_key(), 1.0, EnsureMode::Background)
        .await
        .unwrap();
    assert!(status.is_pending() || status.is_ready());

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.key(), &sat_key());
    assert!(orchestrator.status(&sat_key()).is_ready());
    engine.shutdown().await;
}

/// A masked tile is composed from both halves; a missing mask caches nothing.
#[tokio::test]
async fn test_mask_join() {
    let dir = TempDir::new().unwrap();
    let client = ScriptedClient::new();
    client.respond(WATER_URL, Ok(HttpResponse::ok(png(4, 4, [0, 0, 200, 255]))));
    let engine = engine(dir.path(), client.clone()).await;
    let orchestrator = engine.orchestrator();

    // Mask URL answers 404.
    let err = orchestrator
        .ensure(&water_key(), 1.0, EnsureMode::Immediate)
        .await
        .unwrap_err();
    assert!(matches!(err, TileError::Transport(_)));
    assert!(orchestrator.memory().peek(&water_key()).is_none());
    assert!(!orchestrator.disk().exists(&water_key()).await);

    client.respond(MASK_URL, Ok(HttpResponse::ok(png(4, 4, [0, 0, 0, 255]))));
    assert!(orchestrator.reset(&water_key()));
    let status = orchestrator
        .ensure(&water_key(), 1.0, EnsureMode::Immediate)
        .await
        .unwrap();
    let artifact = status.artifact().unwrap();
    let image = artifact.payload.as_image().unwrap();
    assert_eq!(image.get_pixel(0, 0).0, [0, 0, 200, 0]);
    assert!(orchestrator.disk().exists(&water_key()).await);
    engine.shutdown().await;
}

/// Cancelling an in-flight tile aborts the request and wakes its waiters.
#[tokio::test]
async fn test_cancel_in_flight_tile() {
    let dir = TempDir::new().unwrap();
    let client = ScriptedClient::gated();
    client.respond(SAT_URL, Ok(HttpResponse::ok(png(4, 4, [1, 1, 1, 255]))));
    let engine = engine(dir.path(), client.clone()).await;

    let orchestrator = engine.orchestrator().clone();
    let waiter = tokio::spawn(async move {
        orchestrator
            .ensure(&sat_key(), 1.0, EnsureMode::Immediate)
            .await
    });
    client.wait_for_requests(1).await;

    assert!(engine.orchestrator().cancel(&sat_key()));
    let result = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.unwrap_err(), TileError::Cancelled);
    assert!(matches!(
        engine.orchestrator().status(&sat_key()),
        TileStatus::Unrequested
    ));
    assert!(engine.orchestrator().memory().peek(&sat_key()).is_none());

    // The tile can be requested again after a cancel.
    client.open(1);
    let status = engine
        .orchestrator()
        .ensure(&sat_key(), 1.0, EnsureMode::Immediate)
        .await
        .unwrap();
    assert!(status.is_ready());
    engine.shutdown().await;
}
