//! Concurrent peer registry.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, PoisonError, RwLock};

use crate::connection::PeerConnection;

/// A map guarded by a reader/writer lock.
///
/// Every operation takes the lock for its own duration only; nothing is held
/// across an `.await`. Readers get clones, so callers never see the map
/// mutate under them.
#[derive(Debug)]
pub struct LockedMap<K, V> {
    inner: RwLock<HashMap<K, V>>,
}

impl<K, V> LockedMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Insert or replace the value for `key`.
    pub fn set(&self, key: K, value: V) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, value);
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Remove `key`, returning its value if it was present.
    pub fn delete(&self, key: &K) -> Option<V> {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all values, in no particular order.
    pub fn values(&self) -> Vec<V> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Snapshot of all keys, in no particular order.
    pub fn keys(&self) -> Vec<K> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}

impl<K, V> Default for LockedMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Live connections keyed by remote address.
pub type PeerRegistry = LockedMap<String, Arc<PeerConnection>>;
