//! Retry policy for tiles whose retrieval or persistence failed.
//!
//! The retrieval service itself never retries; the orchestrator consults a
//! [`RetryPolicy`] when a tile attempt ends in a retryable error, and the
//! post-processor uses one for disk write retries.
//!
//! # Example
//!
//! ```ignore
//! use worldtiles::retrieval::RetryPolicy;
//!
//! // One initial attempt plus one retry after 500ms
//! let policy = RetryPolicy::from_max_retries(1, Duration::from_millis(500));
//! assert_eq!(policy.delay_for_attempt(1), Some(Duration::from_millis(500)));
//! assert_eq!(policy.delay_for_attempt(2), None);
//! ```

use std::time::Duration;

/// Default number of retries after the first failed attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 1;

/// Default delay before a retry (fixed policy).
pub const DEFAULT_RETRY_DELAY_MS: u64 = 500;

/// How a failed attempt is retried.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryPolicy {
    /// No retries - fail immediately on error.
    None,

    /// Fixed number of attempts with constant delay between them.
    Fixed {
        /// Maximum number of attempts (including the initial attempt).
        max_attempts: u32,
        /// Delay between retry attempts.
        delay: Duration,
    },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_max_retries(
            DEFAULT_MAX_RETRIES,
            Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
        )
    }
}

impl RetryPolicy {
    /// Creates a fixed retry policy.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self::Fixed {
            max_attempts,
            delay,
        }
    }

    /// Creates a fixed policy allowing `max_retries` retries after the first
    /// attempt. Zero retries yields [`RetryPolicy::None`].
    pub fn from_max_retries(max_retries: u32, delay: Duration) -> Self {
        if max_retries == 0 {
            Self::None
        } else {
            Self::fixed(max_retries.saturating_add(1), delay)
        }
    }

    /// Delay before the next attempt, given `attempt` attempts have failed.
    ///
    /// Returns `None` once the attempt budget is spent.
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        match self {
            Self::None => None,
            Self::Fixed {
                max_attempts,
                delay,
            } => (attempt < *max_attempts).then_some(*delay),
        }
    }

    /// Returns the maximum number of attempts for this policy.
    pub fn max_attempts(&self) -> u32 {
        match self {
            Self::None => 1,
            Self::Fixed { max_attempts, .. } => *max_attempts,
        }
    }

    /// Number of retries allowed after the first attempt.
    pub fn max_retries(&self) -> u32 {
        self.max_attempts().saturating_sub(1)
    }
}
