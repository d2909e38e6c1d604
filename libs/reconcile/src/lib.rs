//! Reconciliation loop primitives.
//!
//! This library provides the building blocks for loops that converge
//! desired state to observed state one key at a time:
//!
//! - **Work queue**: deduplicating queue of keys with pending, processing
//!   and delayed sets, guaranteeing that at most one worker holds a key.
//! - **Rate limiter**: per-key exponential backoff used to space out
//!   retries of failing keys.
//! - **Backoff policy**: the delay law shared by the rate limiter and by
//!   reconnect loops.
//!
//! # Invariants
//!
//! - A key is present in the queue at most once
//! - Keys are never lost across `done`/re-add transitions
//! - Retry delays grow as `base * 2^attempt` up to the cap

use std::time::Duration;

use thiserror::Error;

pub mod backoff;
pub mod queue;
pub mod rate_limit;

pub use backoff::BackoffPolicy;
pub use queue::WorkQueue;
pub use rate_limit::RateLimiter;

/// Work queue errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    /// The queue has been shut down and will hand out no more keys.
    #[error("work queue is shut down")]
    ShutDown,
}

/// Base delay for the first retry of a failing key.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(10);

/// Upper bound for any single retry delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(5 * 60);

/// Maximum fraction of a delay added as random jitter.
pub const DEFAULT_JITTER: f64 = 0.1;

/// Attempts allowed for a key before the caller gives up on it.
pub const DEFAULT_MAX_RETRIES: u32 = 20;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_matches_constants() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.base, DEFAULT_BASE_DELAY);
        assert_eq!(policy.max, DEFAULT_MAX_DELAY);
        assert!((policy.jitter - DEFAULT_JITTER).abs() < f64::EPSILON);
    }

    #[test]
    fn test_queue_error_display() {
        assert_eq!(QueueError::ShutDown.to_string(), "work queue is shut down");
    }
}
