//! Deduplicating, rate-limited work queue.
//!
//! Keys move between three sets, all guarded by one mutex:
//!
//! - **pending**: FIFO of keys ready to be handed to a worker
//! - **processing**: keys currently held by a worker
//! - **delayed**: keys waiting for a future ready time
//!
//! A key added while it is being processed is remembered and re-queued
//! when the worker calls [`WorkQueue::done`]. Waiting workers are woken
//! through a [`Notify`], which plays the role of a condition variable.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

use crate::{BackoffPolicy, QueueError, RateLimiter};

struct State<K> {
    pending: VecDeque<K>,
    queued: HashSet<K>,
    processing: HashSet<K>,
    /// Keys added while processing, with the earliest time they may run again.
    readd: HashMap<K, Instant>,
    delayed: HashMap<K, Instant>,
    limiter: RateLimiter<K>,
    shutting_down: bool,
}

impl<K> State<K>
where
    K: Clone + Eq + Hash,
{
    fn schedule(&mut self, key: K, ready_at: Instant, now: Instant) {
        if self.shutting_down {
            return;
        }

        if self.processing.contains(&key) {
            self.readd
                .entry(key)
                .and_modify(|at| *at = (*at).min(ready_at))
                .or_insert(ready_at);
            return;
        }

        if self.queued.contains(&key) {
            return;
        }

        if ready_at <= now {
            self.delayed.remove(&key);
            self.queued.insert(key.clone());
            self.pending.push_back(key);
        } else {
            self.delayed
                .entry(key)
                .and_modify(|at| *at = (*at).min(ready_at))
                .or_insert(ready_at);
        }
    }

    /// Move every delayed key whose time has come into pending, earliest first.
    fn promote_due(&mut self, now: Instant) {
        let mut due: Vec<(Instant, K)> = self
            .delayed
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(key, at)| (*at, key.clone()))
            .collect();
        if due.is_empty() {
            return;
        }

        due.sort_by_key(|(at, _)| *at);
        for (_, key) in due {
            self.delayed.remove(&key);
            if self.queued.insert(key.clone()) {
                self.pending.push_back(key);
            }
        }
    }

    fn next_ready(&self) -> Option<Instant> {
        self.delayed.values().min().copied()
    }
}

/// Work queue guaranteeing that at most one worker holds a key at a time.
pub struct WorkQueue<K> {
    state: Mutex<State<K>>,
    notify: Notify,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send,
{
    /// Create a queue whose rate limiter follows `policy`.
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            state: Mutex::new(State {
                pending: VecDeque::new(),
                queued: HashSet::new(),
                processing: HashSet::new(),
                readd: HashMap::new(),
                delayed: HashMap::new(),
                limiter: RateLimiter::new(policy),
                shutting_down: false,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `key` for immediate processing.
    ///
    /// No-op if already pending. If a worker holds the key it is re-queued
    /// once the worker calls [`done`](Self::done).
    pub fn add(&self, key: K) {
        let now = Instant::now();
        self.lock().schedule(key, now, now);
        self.notify.notify_waiters();
    }

    /// Queue `key` once `delay` has elapsed.
    ///
    /// If the key is already scheduled the earlier of the two times wins.
    pub fn add_after(&self, key: K, delay: Duration) {
        let now = Instant::now();
        self.lock().schedule(key, now + delay, now);
        self.notify.notify_waiters();
    }

    /// Queue `key` after the rate limiter's next delay for it.
    ///
    /// Returns the delay that was applied.
    pub fn add_rate_limited(&self, key: K) -> Duration {
        let now = Instant::now();
        let delay = {
            let mut state = self.lock();
            let delay = state.limiter.when(&key);
            state.schedule(key, now + delay, now);
            delay
        };
        self.notify.notify_waiters();
        delay
    }

    /// Wait for the next ready key and mark it as processing.
    ///
    /// Returns [`QueueError::ShutDown`] once the queue is shut down.
    pub async fn get(&self) -> Result<K, QueueError> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_ready = {
                let mut state = self.lock();
                if state.shutting_down {
                    return Err(QueueError::ShutDown);
                }

                state.promote_due(Instant::now());
                if let Some(key) = state.pending.pop_front() {
                    state.queued.remove(&key);
                    state.processing.insert(key.clone());
                    return Ok(key);
                }
                state.next_ready()
            };

            match next_ready {
                Some(at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Release `key` after processing.
    ///
    /// If the key was added again while held, it goes back to pending (or
    /// delayed, if its re-add time is still in the future).
    pub fn done(&self, key: &K) {
        let now = Instant::now();
        {
            let mut state = self.lock();
            state.processing.remove(key);
            if let Some(ready_at) = state.readd.remove(key) {
                trace!("re-queueing key marked dirty during processing");
                state.schedule(key.clone(), ready_at, now);
            }
        }
        self.notify.notify_waiters();
    }

    /// Reset the rate-limit attempt counter for `key`.
    pub fn forget(&self, key: &K) {
        self.lock().limiter.forget(key);
    }

    /// Number of rate-limited requeues recorded for `key`.
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.lock().limiter.num_requeues(key)
    }

    /// Number of keys ready for processing.
    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of keys waiting for a future ready time.
    pub fn delayed_len(&self) -> usize {
        self.lock().delayed.len()
    }

    /// Number of keys currently held by workers.
    pub fn processing_len(&self) -> usize {
        self.lock().processing.len()
    }

    /// Whether `key` is pending, delayed or being processed.
    pub fn contains(&self, key: &K) -> bool {
        let state = self.lock();
        state.queued.contains(key) || state.delayed.contains_key(key) || state.processing.contains(key)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Stop handing out keys. Waiting workers return [`QueueError::ShutDown`].
    pub fn shut_down(&self) {
        {
            let mut state = self.lock();
            state.shutting_down = true;
            state.readd.clear();
        }
        self.notify.notify_waiters();
    }

    /// Shut down and wait until no worker holds a key, or `grace` elapses.
    ///
    /// Returns `true` if processing drained within the grace period.
    pub async fn shut_down_with_drain(&self, grace: Duration) -> bool {
        self.shut_down();
        let deadline = Instant::now() + grace;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.lock().processing.is_empty() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.lock().processing.is_empty();
            }
        }
    }
}

impl<K> Default for WorkQueue<K>
where
    K: Clone + Eq + Hash + Send,
{
    fn default() -> Self {
        Self::new(BackoffPolicy::default())
    }
}
