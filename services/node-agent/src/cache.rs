//! In-memory index of the pods assigned to this node.
//!
//! The cache holds the latest desired record per pod key, plus a secondary
//! index from UID to key. It is written by the watcher (desired state) and
//! the reconciler (last applied generation), and read by everything else.
//!
//! Upserts carrying an older resource version than the stored record are
//! dropped, so entries only move forward.

use std::collections::HashMap;

use k8s_openapi::api::core::v1::Pod;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::pod::{self, PodKey};

/// Cached desired record for one pod.
#[derive(Debug, Clone)]
pub struct CachedPod {
    pub pod: Pod,

    /// Generation last pushed to the provider for this UID.
    pub last_applied_generation: Option<i64>,
}

impl CachedPod {
    pub fn key(&self) -> PodKey {
        PodKey::of(&self.pod)
    }

    pub fn uid(&self) -> Option<&str> {
        pod::uid(&self.pod)
    }
}

/// Outcome of [`PodCache::upsert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Updated,
    /// Same UID and resource version as the stored record.
    Unchanged,
    /// A different UID replaced the stored record under the same key.
    Replaced,
    /// Older than the stored record; ignored.
    Stale,
}

impl Upsert {
    /// Whether the stored record changed.
    pub fn changed(self) -> bool {
        matches!(self, Self::Inserted | Self::Updated | Self::Replaced)
    }
}

#[derive(Default)]
struct Inner {
    by_key: HashMap<PodKey, CachedPod>,
    by_uid: HashMap<String, PodKey>,
}

impl Inner {
    fn remove(&mut self, key: &PodKey) -> Option<CachedPod> {
        let removed = self.by_key.remove(key)?;
        if let Some(uid) = removed.uid() {
            if self.by_uid.get(uid) == Some(key) {
                self.by_uid.remove(uid);
            }
        }
        Some(removed)
    }
}

/// Pod cache guarded by a single reader-writer lock.
#[derive(Default)]
pub struct PodCache {
    inner: RwLock<Inner>,
}

impl PodCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the desired record for `pod`.
    pub async fn upsert(&self, pod: Pod) -> Upsert {
        let key = PodKey::of(&pod);
        let mut guard = self.inner.write().await;
        let inner = &mut *guard;

        let outcome = match inner.by_key.get_mut(&key) {
            None => {
                if let Some(uid) = pod::uid(&pod) {
                    inner.by_uid.insert(uid.to_string(), key.clone());
                }
                inner.by_key.insert(
                    key.clone(),
                    CachedPod {
                        pod,
                        last_applied_generation: None,
                    },
                );
                Upsert::Inserted
            }
            Some(existing) => {
                if pod::is_older(pod::resource_version(&pod), pod::resource_version(&existing.pod)) {
                    trace!(pod = %key, "Dropping out-of-order pod update");
                    return Upsert::Stale;
                }

                let old_uid = existing.uid().map(str::to_string);
                let same_uid = old_uid.as_deref() == pod::uid(&pod);
                let same_rv = pod::resource_version(&existing.pod) == pod::resource_version(&pod);

                if same_uid && same_rv {
                    existing.pod = pod;
                    Upsert::Unchanged
                } else if same_uid {
                    existing.pod = pod;
                    Upsert::Updated
                } else {
                    let new_uid = pod::uid(&pod).map(str::to_string);
                    existing.pod = pod;
                    existing.last_applied_generation = None;
                    if let Some(old) = old_uid {
                        inner.by_uid.remove(&old);
                    }
                    if let Some(new) = new_uid {
                        inner.by_uid.insert(new, key.clone());
                    }
                    Upsert::Replaced
                }
            }
        };

        debug!(pod = %key, outcome = ?outcome, "Pod cache upsert");
        outcome
    }

    /// Remove the record for `key`, returning it.
    pub async fn delete(&self, key: &PodKey) -> Option<CachedPod> {
        let mut inner = self.inner.write().await;
        inner.remove(key)
    }

    /// Remove the record for `key` only if it still has `uid`.
    ///
    /// The check and the removal happen under one write lock, so a
    /// replacement upserted concurrently is never removed.
    pub async fn delete_if_uid(&self, key: &PodKey, uid: Option<&str>) -> Option<CachedPod> {
        let mut inner = self.inner.write().await;
        match inner.by_key.get(key) {
            Some(entry) if entry.uid() == uid => inner.remove(key),
            _ => None,
        }
    }

    pub async fn get(&self, key: &PodKey) -> Option<CachedPod> {
        self.inner.read().await.by_key.get(key).cloned()
    }

    pub async fn get_by_uid(&self, uid: &str) -> Option<CachedPod> {
        let inner = self.inner.read().await;
        let key = inner.by_uid.get(uid)?;
        inner.by_key.get(key).cloned()
    }

    /// All records, ordered by key.
    pub async fn list(&self) -> Vec<CachedPod> {
        let inner = self.inner.read().await;
        let mut pods: Vec<_> = inner.by_key.values().cloned().collect();
        pods.sort_by_key(CachedPod::key);
        pods
    }

    /// Point-in-time copy of the key index.
    pub async fn snapshot(&self) -> HashMap<PodKey, CachedPod> {
        self.inner.read().await.by_key.clone()
    }

    pub async fn keys(&self) -> Vec<PodKey> {
        let mut keys: Vec<_> = self.inner.read().await.by_key.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.by_key.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Record that `generation` was applied to the provider for `uid`.
    ///
    /// Ignored if the entry has since been replaced by another UID.
    pub async fn set_last_applied(&self, key: &PodKey, uid: Option<&str>, generation: i64) -> bool {
        let mut inner = self.inner.write().await;
        match inner.by_key.get_mut(key) {
            Some(entry) if entry.uid() == uid => {
                entry.last_applied_generation = Some(generation);
                true
            }
            _ => false,
        }
    }
}
