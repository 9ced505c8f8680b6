//! Engine configuration assembled from the config file.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{CacheSettings, ConfigFile, RetrievalSettings};
use crate::dataset::DatasetRegistry;
use crate::orchestrator::{OrchestratorConfig, DEFAULT_EVENT_CAPACITY};
use crate::retrieval::RetryPolicy;

/// Default garbage collection interval for the disk cache (in seconds).
pub const DEFAULT_GC_INTERVAL_SECS: u64 = 60;

/// Attempts for a single disk cache write before the tile fails.
pub const DEFAULT_WRITE_ATTEMPTS: u32 = 3;

/// Delay between disk cache write attempts.
pub const DEFAULT_WRITE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Everything needed to start a [`TileEngine`](super::TileEngine).
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub cache: CacheSettings,
    pub retrieval: RetrievalSettings,
    pub rewrite_rules: Vec<(String, String)>,
    pub datasets: Arc<DatasetRegistry>,
    /// Disk GC interval; `None` disables the daemon.
    pub gc_interval: Option<Duration>,
    pub write_retry: RetryPolicy,
}

impl AppConfig {
    pub fn from_config_file(file: &ConfigFile) -> Self {
        Self {
            cache: file.cache.clone(),
            retrieval: file.retrieval.clone(),
            rewrite_rules: file.rewrite_rules.clone(),
            datasets: Arc::new(file.dataset_registry()),
            gc_interval: Some(Duration::from_secs(DEFAULT_GC_INTERVAL_SECS)),
            write_retry: RetryPolicy::fixed(DEFAULT_WRITE_ATTEMPTS, DEFAULT_WRITE_RETRY_DELAY),
        }
    }

    pub fn with_cache_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.cache.directory = directory.into();
        self
    }

    pub fn with_memory_cache_size(mut self, bytes: u64) -> Self {
        self.cache.memory_size = bytes;
        self
    }

    pub fn with_disk_cache_size(mut self, bytes: u64) -> Self {
        self.cache.disk_size = bytes;
        self
    }

    pub fn with_gc_interval(mut self, interval: Option<Duration>) -> Self {
        self.gc_interval = interval;
        self
    }

    pub fn with_retry_policy(mut self, retries: u32, delay: Duration) -> Self {
        self.retrieval.max_retries = retries;
        self.retrieval.retry_delay = delay;
        self
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            retry: self.retrieval.retry_policy(),
            mask_join_timeout: self.retrieval.mask_join_timeout(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}
