//! # Coalescing Cache
//!
//! A keyed cache of immutable values where concurrent misses on the same key
//! share a single load.
//!
//! Each key has its own async lock. A miss takes the lock, checks again, and
//! only then loads; everyone queued behind it finds the value on their second
//! check. `refresh` takes the same lock, so a reload triggered by a change
//! notification can never be overtaken by a load that read older data.
//!
//! Invalidations that cannot name their keys up front (a whole API, or
//! everything) bump the cache generation instead. A load that started under
//! an older generation hands its value to its caller but does not cache it.

use dashmap::DashMap;
use metrics::counter;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::core::error::{GatewayError, GatewayResult};
use crate::observability::metrics as names;

/// Result of refreshing one key
#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    /// The key was cached and now holds freshly loaded data
    Reloaded,
    /// The underlying record is gone, so the entry was dropped
    Removed,
    /// Reload failed; the previous value stays in place
    Retained(String),
    /// Nothing was cached, so nothing needed reloading
    NotCached,
}

pub struct CoalescingCache<K, V> {
    name: &'static str,
    values: DashMap<K, Arc<V>>,
    locks: DashMap<K, Arc<Mutex<()>>>,
    generation: AtomicU64,
}

impl<K, V> CoalescingCache<K, V>
where
    K: Eq + Hash + Copy + Debug + Send + Sync,
    V: Send + Sync,
{
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            values: DashMap::new(),
            locks: DashMap::new(),
            generation: AtomicU64::new(0),
        }
    }

    fn lock_for(&self, key: K) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.entry(key).or_default().value())
    }

    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        self.values.get(key).map(|value| Arc::clone(value.value()))
    }

    /// Return the cached value, loading it once if absent
    pub async fn get_or_load<F, Fut>(&self, key: K, load: F) -> GatewayResult<Arc<V>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = GatewayResult<V>>,
    {
        if let Some(value) = self.get(&key) {
            counter!(names::CACHE_HITS, "cache" => self.name).increment(1);
            return Ok(value);
        }

        let lock = self.lock_for(key);
        let _guard = lock.lock().await;

        if let Some(value) = self.get(&key) {
            counter!(names::CACHE_HITS, "cache" => self.name).increment(1);
            return Ok(value);
        }

        counter!(names::CACHE_MISSES, "cache" => self.name).increment(1);
        debug!(cache = self.name, key = ?key, "Loading cache entry");
        let generation = self.generation.load(Ordering::SeqCst);
        let value = Arc::new(load().await?);
        if self.generation.load(Ordering::SeqCst) == generation {
            self.values.insert(key, Arc::clone(&value));
        } else {
            debug!(cache = self.name, key = ?key, "Invalidated while loading, not caching");
        }
        Ok(value)
    }

    /// Stop any load already in flight from caching what it read
    pub fn invalidate_loading(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Reload `key` if it is cached.
    ///
    /// `NotFound` removes the entry; any other error keeps the old value.
    pub async fn refresh<F, Fut>(&self, key: K, load: F) -> RefreshOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = GatewayResult<V>>,
    {
        let lock = self.lock_for(key);
        let guard = lock.lock().await;

        if !self.values.contains_key(&key) {
            drop(guard);
            drop(lock);
            self.release_lock(&key);
            return RefreshOutcome::NotCached;
        }

        let outcome = match load().await {
            Ok(value) => {
                self.values.insert(key, Arc::new(value));
                counter!(names::CACHE_RELOADS, "cache" => self.name).increment(1);
                debug!(cache = self.name, key = ?key, "Reloaded cache entry");
                RefreshOutcome::Reloaded
            }
            Err(GatewayError::NotFound { .. }) => {
                self.values.remove(&key);
                debug!(cache = self.name, key = ?key, "Removed cache entry for deleted record");
                RefreshOutcome::Removed
            }
            Err(err) => {
                warn!(
                    cache = self.name,
                    key = ?key,
                    error = %err,
                    "Cache reload failed, keeping previous entry"
                );
                RefreshOutcome::Retained(err.to_string())
            }
        };

        drop(guard);
        drop(lock);
        if outcome == RefreshOutcome::Removed {
            self.release_lock(&key);
        }
        outcome
    }

    /// Keys whose cached value satisfies `predicate`
    pub fn keys_where<P>(&self, predicate: P) -> Vec<K>
    where
        P: Fn(&V) -> bool,
    {
        self.values
            .iter()
            .filter(|entry| predicate(entry.value()))
            .map(|entry| *entry.key())
            .collect()
    }

    pub fn keys(&self) -> Vec<K> {
        self.values.iter().map(|entry| *entry.key()).collect()
    }

    pub fn remove(&self, key: &K) {
        self.values.remove(key);
        self.release_lock(key);
    }

    pub fn clear(&self) {
        self.invalidate_loading();
        self.values.clear();
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    // Only drops a lock nobody holds or waits on; `lock_for` clones under the
    // same shard lock, so the count cannot change underneath the check.
    fn release_lock(&self, key: &K) {
        self.locks.remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }

    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
