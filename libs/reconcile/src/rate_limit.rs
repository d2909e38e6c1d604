//! Per-key exponential rate limiter.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use crate::BackoffPolicy;

/// Tracks failures per key and hands out growing retry delays.
///
/// Not synchronised on its own; the work queue keeps it under its lock.
#[derive(Debug)]
pub struct RateLimiter<K> {
    policy: BackoffPolicy,
    failures: HashMap<K, u32>,
}

impl<K> RateLimiter<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            failures: HashMap::new(),
        }
    }

    /// Record another attempt for `key` and return how long to wait before it.
    pub fn when(&mut self, key: &K) -> Duration {
        let attempts = self.failures.entry(key.clone()).or_insert(0);
        let delay = self.policy.delay(*attempts);
        *attempts = attempts.saturating_add(1);
        delay
    }

    /// Number of rate-limited requeues recorded for `key`.
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.failures.get(key).copied().unwrap_or(0)
    }

    /// Reset the attempt counter for `key`.
    pub fn forget(&mut self, key: &K) {
        self.failures.remove(key);
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }
}
