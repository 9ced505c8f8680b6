//! Orchestrator types: tile status, ensure modes, events and configuration.

use crate::cache::CachedArtifact;
use crate::coord::TileKey;
use crate::error::TileError;
use crate::retrieval::RetryPolicy;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Default capacity of the tile event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Default time to wait for the second half of a masked tile.
pub const DEFAULT_MASK_JOIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Status of a tile as reported to callers.
#[derive(Debug, Clone)]
pub enum TileStatus {
    /// Nothing requested, or the request was cancelled or deferred.
    Unrequested,
    /// Submitted and waiting for a retrieval worker.
    Queued,
    /// A retrieval worker is fetching the tile.
    Fetching,
    /// The decoded artifact is resident.
    Ready(Arc<CachedArtifact>),
    /// The last attempt failed; a retry is scheduled.
    Failed { attempts: u32, error: TileError },
    /// All attempts failed. No resubmission until reset.
    GaveUp(TileError),
}

impl TileStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, TileStatus::Ready(_))
    }

    /// Whether a request for the tile is in progress.
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            TileStatus::Queued | TileStatus::Fetching | TileStatus::Failed { .. }
        )
    }

    pub fn artifact(&self) -> Option<&Arc<CachedArtifact>> {
        match self {
            TileStatus::Ready(artifact) => Some(artifact),
            _ => None,
        }
    }
}

impl fmt::Display for TileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TileStatus::Unrequested => write!(f, "unrequested"),
            TileStatus::Queued => write!(f, "queued"),
            TileStatus::Fetching => write!(f, "fetching"),
            TileStatus::Ready(artifact) => {
                let (w, h) = artifact.dimensions();
                write!(f, "ready ({}x{})", w, h)
            }
            TileStatus::Failed { attempts, error } => {
                write!(f, "failed after {} attempt(s): {}", attempts, error)
            }
            TileStatus::GaveUp(error) => write!(f, "gave up: {}", error),
        }
    }
}

/// Internal per-tile state published through a watch channel.
///
/// Holds only a weak reference to a ready artifact so that the memory cache
/// stays the sole owner of resident payloads.
#[derive(Debug, Clone)]
pub(crate) enum TileState {
    Unrequested,
    /// Released unfetched because the retrieval service was saturated.
    /// Waiters claim the tile again instead of failing.
    Deferred,
    Queued,
    Ready(Weak<CachedArtifact>),
    Failed { attempts: u32, error: TileError },
    GaveUp(TileError),
}

impl TileState {
    pub(crate) fn is_pending(&self) -> bool {
        matches!(self, TileState::Queued | TileState::Failed { .. })
    }
}

/// How [`ensure`](super::TileRequestOrchestrator::ensure) treats a missing tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnsureMode {
    /// Queue the tile and return its current status. Deferred while the
    /// retrieval service is saturated.
    #[default]
    Background,
    /// Wait until the tile is ready or has given up.
    Immediate,
}

/// Notification sent when a tile reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TileEvent {
    Ready(TileKey),
    GaveUp(TileKey),
}

impl TileEvent {
    pub fn key(&self) -> &TileKey {
        match self {
            TileEvent::Ready(key) | TileEvent::GaveUp(key) => key,
        }
    }
}

/// Orchestrator tuning.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Retries for tiles failing with a retryable error.
    pub retry: RetryPolicy,
    /// How long a masked tile waits for its second half.
    pub mask_join_timeout: Duration,
    /// Capacity of the broadcast channel behind `subscribe`.
    pub event_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            mask_join_timeout: DEFAULT_MASK_JOIN_TIMEOUT,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;

    #[test]
    fn test_status_predicates() {
        assert!(TileStatus::Queued.is_pending());
        assert!(TileStatus::Fetching.is_pending());
        assert!(!TileStatus::Unrequested.is_pending());
        let gave_up = TileStatus::GaveUp(TileError::Transport(TransportError::NotFound("x".into())));
        assert!(!gave_up.is_pending());
        assert!(gave_up.artifact().is_none());
        assert_eq!(gave_up.to_string(), "gave up: not found: x");
    }

    #[test]
    fn test_event_key() {
        let key = TileKey::new("img", 1, 2, 3);
        assert_eq!(TileEvent::GaveUp(key.clone()).key(), &key);
    }

    #[test]
    fn test_default_config() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.retry.max_retries(), 1);
        assert_eq!(config.event_capacity, DEFAULT_EVENT_CAPACITY);
    }
}
