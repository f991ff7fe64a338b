//! Lookup tables for per-instance stores and per-order critical sections.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{OwnedMutexGuard, RwLock};

/// One store per aggregate instance (screening, group ticket type)
pub(crate) struct StoreRegistry<K, V> {
    entries: RwLock<HashMap<K, Arc<V>>>,
}

impl<K, V> StoreRegistry<K, V>
where
    K: Eq + Hash + Copy + Ord,
{
    pub(crate) fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) async fn get(&self, key: &K) -> Option<Arc<V>> {
        self.entries.read().await.get(key).cloned()
    }

    /// Inserts a store built by `create`, or returns `None` if the key is taken
    pub(crate) async fn insert_new(&self, key: K, create: impl FnOnce() -> V) -> Option<Arc<V>> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(&key) {
            return None;
        }
        let store = Arc::new(create());
        entries.insert(key, Arc::clone(&store));
        Some(store)
    }

    pub(crate) async fn remove(&self, key: &K) {
        self.entries.write().await.remove(key);
    }

    /// Snapshot of every entry, sorted by key
    pub(crate) async fn entries(&self) -> Vec<(K, Arc<V>)> {
        let mut entries: Vec<(K, Arc<V>)> = self
            .entries
            .read()
            .await
            .iter()
            .map(|(key, store)| (*key, Arc::clone(store)))
            .collect();
        entries.sort_by_key(|(key, _)| *key);
        entries
    }
}

/// Async mutex per key.
///
/// Pay, cancel, verify and expiry of one order take the order's guard, so
/// their multi-store steps never interleave.
pub(crate) struct KeyedLocks<K> {
    locks: Mutex<HashMap<K, Arc<tokio::sync::Mutex<()>>>>,
}

impl<K> KeyedLocks<K>
where
    K: Eq + Hash + Copy,
{
    pub(crate) fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) async fn lock(&self, key: K) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            // Drop guards nobody is holding or waiting on
            locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
            Arc::clone(locks.entry(key).or_default())
        };
        mutex.lock_owned().await
    }
}
