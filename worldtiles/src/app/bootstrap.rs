//! TileEngine - wires the caches, retrieval service and orchestrator.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::config::AppConfig;
use super::error::AppError;
use crate::cache::{DiskCache, EvictionResult, TileCache};
use crate::orchestrator::TileRequestOrchestrator;
use crate::process::DownloadPostProcessor;
use crate::retrieval::{
    HttpClient, IdentityRewriter, RegexRewriter, ReqwestClient, RetrievalService,
    RetrieverRouter, UrlRewriter,
};

/// A running tile engine.
///
/// Owns the retrieval workers and the disk GC daemon. Call
/// [`shutdown`](Self::shutdown) to stop them; dropping the engine stops the
/// workers as well.
pub struct TileEngine {
    orchestrator: TileRequestOrchestrator,
    config: AppConfig,
    gc_shutdown: CancellationToken,
    gc_handle: Option<JoinHandle<()>>,
}

impl TileEngine {
    /// Start the engine with a reqwest HTTP client built from the
    /// retrieval settings.
    pub async fn start(config: AppConfig) -> Result<Self, AppError> {
        let client = ReqwestClient::with_timeouts(
            config.retrieval.connect_timeout,
            config.retrieval.read_timeout,
            &config.retrieval.user_agent,
        )
        .map_err(AppError::HttpClient)?;
        Self::with_http_client(config, client).await
    }

    /// Start the engine over a caller-supplied HTTP client.
    pub async fn with_http_client<C>(config: AppConfig, client: C) -> Result<Self, AppError>
    where
        C: HttpClient + Clone + 'static,
    {
        let directory = config.cache.directory.clone();
        tokio::fs::create_dir_all(&directory)
            .await
            .map_err(|source| AppError::CacheDirectory {
                path: directory.clone(),
                source,
            })?;

        let rewriter: Arc<dyn UrlRewriter> = if config.rewrite_rules.is_empty() {
            Arc::new(IdentityRewriter)
        } else {
            Arc::new(RegexRewriter::new(
                config
                    .rewrite_rules
                    .iter()
                    .map(|(pattern, replacement)| (pattern.as_str(), replacement.as_str())),
            )?)
        };

        let router = RetrieverRouter::new(client, rewriter);
        let service = Arc::new(RetrievalService::start(
            config.retrieval.service_config(),
            Arc::new(router),
        ));

        let memory = Arc::new(TileCache::new(
            usize::try_from(config.cache.memory_size).unwrap_or(usize::MAX),
        ));
        let disk = Arc::new(DiskCache::new(&directory, config.datasets.clone()));
        let processor = Arc::new(DownloadPostProcessor::new(
            memory,
            disk.clone(),
            config.write_retry.clone(),
        ));

        let orchestrator = TileRequestOrchestrator::new(
            config.datasets.clone(),
            service,
            processor,
            config.orchestrator_config(),
        );

        let gc_shutdown = CancellationToken::new();
        let gc_handle = config.gc_interval.map(|interval| {
            spawn_gc_daemon(disk, config.cache.disk_size, interval, gc_shutdown.clone())
        });

        info!(
            directory = %directory.display(),
            memory_size = config.cache.memory_size,
            disk_size = config.cache.disk_size,
            datasets = config.datasets.len(),
            "Tile engine started"
        );

        Ok(Self {
            orchestrator,
            config,
            gc_shutdown,
            gc_handle,
        })
    }

    pub fn orchestrator(&self) -> &TileRequestOrchestrator {
        &self.orchestrator
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Run one disk GC pass against the configured disk size.
    pub async fn collect_garbage(&self) -> std::io::Result<EvictionResult> {
        self.orchestrator
            .disk()
            .evict_to(self.config.cache.disk_size)
            .await
    }

    /// Stop the GC daemon and the retrieval workers.
    pub async fn shutdown(mut self) {
        info!("Shutting down tile engine");
        self.gc_shutdown.cancel();
        if let Some(handle) = self.gc_handle.take() {
            let _ = handle.await;
        }
        self.orchestrator.service().shutdown();
        info!("Tile engine shutdown complete");
    }
}

impl Drop for TileEngine {
    fn drop(&mut self) {
        self.gc_shutdown.cancel();
    }
}

fn spawn_gc_daemon(
    disk: Arc<DiskCache>,
    limit: u64,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = disk.evict_to(limit).await {
                        warn!(error = %e, "Disk cache GC failed");
                    }
                }
            }
        }
    })
}
