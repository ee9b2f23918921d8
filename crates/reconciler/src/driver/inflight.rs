//! Per-key in-flight registry.
//!
//! At most one task works on a key at a time. Every acquire carries the
//! generation of the pass it belongs to. A task from a newer (or the same)
//! generation supersedes the holder: it signals the holder, then waits for
//! the holder's lease to be released before it issues any call. A task from
//! an older generation than the newest one seen for the key gets no lease.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use converge_core::ResourceKey;
use tokio::sync::watch;
use tracing::debug;

use crate::shutdown::CancelToken;

#[derive(Debug)]
struct Entry {
    id: u64,
    cancel: watch::Sender<bool>,
    released: watch::Receiver<bool>,
}

#[derive(Debug, Default)]
struct Keys {
    holders: HashMap<ResourceKey, Entry>,
    /// Newest generation that acquired each key. Outlives the leases.
    latest: HashMap<ResourceKey, u64>,
}

/// Tracks which task currently holds each key.
#[derive(Debug, Default)]
pub struct InFlightRegistry {
    keys: Mutex<Keys>,
    next_id: AtomicU64,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the key for a task of pass `generation`, superseding and then
    /// waiting out any current holder.
    ///
    /// Returns `None` when a newer generation already acquired the key.
    pub async fn acquire(self: &Arc<Self>, key: &ResourceKey, generation: u64) -> Option<Lease> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (released_tx, released_rx) = watch::channel(false);

        let previous = {
            let mut keys = self.lock();
            let latest = keys.latest.entry(key.clone()).or_insert(generation);
            if *latest > generation {
                debug!(key = %key, generation, newest = *latest, "Key taken by a newer pass");
                return None;
            }
            *latest = generation;
            keys.holders.insert(
                key.clone(),
                Entry {
                    id,
                    cancel: cancel_tx,
                    released: released_rx,
                },
            )
        };

        if let Some(previous) = previous {
            debug!(key = %key, generation, "Superseding in-flight task");
            previous.cancel.send_replace(true);
            let mut released = previous.released;
            // A dropped sender means the holder is gone, which counts as released.
            let _ = released.wait_for(|done| *done).await;
        }

        Some(Lease {
            registry: Arc::clone(self),
            key: key.clone(),
            id,
            released: released_tx,
            token: CancelToken::from_receiver(cancel_rx),
        })
    }

    /// Whether any task holds the key.
    pub fn is_held(&self, key: &ResourceKey) -> bool {
        self.lock().holders.contains_key(key)
    }

    /// Newest generation that acquired the key.
    pub fn latest_generation(&self, key: &ResourceKey) -> Option<u64> {
        self.lock().latest.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.lock().holders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().holders.is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Keys> {
        self.keys
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn release(&self, key: &ResourceKey, id: u64) {
        let mut keys = self.lock();
        if keys.holders.get(key).is_some_and(|entry| entry.id == id) {
            keys.holders.remove(key);
        }
    }
}

/// Exclusive hold on one key. Released on drop.
#[derive(Debug)]
pub struct Lease {
    registry: Arc<InFlightRegistry>,
    key: ResourceKey,
    id: u64,
    released: watch::Sender<bool>,
    token: CancelToken,
}

impl Lease {
    pub const fn key(&self) -> &ResourceKey {
        &self.key
    }

    /// Fires when a newer task supersedes this one.
    pub fn token(&self) -> CancelToken {
        self.token.clone()
    }

    pub fn is_superseded(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.released.send_replace(true);
        self.registry.release(&self.key, self.id);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::time::Duration;

    use super::*;

    fn key() -> ResourceKey {
        ResourceKey::namespaced("v1", "ConfigMap", "x", "foo")
    }

    #[tokio::test]
    async fn test_lease_is_released_on_drop() {
        let registry = Arc::new(InFlightRegistry::new());
        let lease = registry.acquire(&key(), 0).await.unwrap();
        assert!(registry.is_held(&key()));
        assert!(!lease.is_superseded());
        drop(lease);
        assert!(registry.is_empty());
        assert_eq!(registry.latest_generation(&key()), Some(0));
    }

    #[tokio::test]
    async fn test_newer_acquire_supersedes_and_waits() {
        let registry = Arc::new(InFlightRegistry::new());
        let older = registry.acquire(&key(), 0).await.unwrap();
        let mut older_token = older.token();

        let waiting = Arc::clone(&registry);
        let newer = tokio::spawn(async move { waiting.acquire(&key(), 1).await });

        tokio::time::timeout(Duration::from_secs(5), older_token.cancelled())
            .await
            .ok();
        assert!(older.is_superseded());
        assert!(!newer.is_finished());

        drop(older);
        let newer = tokio::time::timeout(Duration::from_secs(5), newer).await;
        assert!(matches!(newer, Ok(Ok(Some(ref lease))) if !lease.is_superseded()));
        assert!(registry.is_held(&key()));
    }

    #[tokio::test]
    async fn test_older_release_keeps_newer_entry() {
        let registry = Arc::new(InFlightRegistry::new());
        let older = registry.acquire(&key(), 0).await.unwrap();
        let waiting = Arc::clone(&registry);
        let newer = tokio::spawn(async move { waiting.acquire(&key(), 1).await });
        tokio::task::yield_now().await;
        while !older.is_superseded() {
            tokio::task::yield_now().await;
        }
        drop(older);
        let newer = newer.await.unwrap();
        assert!(newer.is_some());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_older_generation_never_takes_the_key() {
        let registry = Arc::new(InFlightRegistry::new());
        let newer = registry.acquire(&key(), 5).await.unwrap();

        assert!(registry.acquire(&key(), 4).await.is_none());
        assert!(!newer.is_superseded());
        assert!(registry.is_held(&key()));

        drop(newer);
        assert!(registry.acquire(&key(), 4).await.is_none());
        assert!(registry.is_empty());
        assert_eq!(registry.latest_generation(&key()), Some(5));
    }

    #[tokio::test]
    async fn test_same_generation_supersedes() {
        let registry = Arc::new(InFlightRegistry::new());
        let first = registry.acquire(&key(), 3).await.unwrap();
        let waiting = Arc::clone(&registry);
        let second = tokio::spawn(async move { waiting.acquire(&key(), 3).await });
        while !first.is_superseded() {
            tokio::task::yield_now().await;
        }
        drop(first);
        assert!(second.await.unwrap().is_some());
    }
}
