//! Generic concurrent id → handle table.
//!
//! [`Registry`] stores shared handles in a `HashMap` behind a
//! [`tokio::sync::RwLock`]. It backs both the per-connection stream table
//! and the process-wide [`super::MasterRegistry`].

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::MuxError;

/// Concurrent map from an id to an `Arc` handle.
///
/// The registry never owns the value outright: whoever registered an entry
/// keeps its own `Arc`, and removal only drops the registry's reference.
///
/// # Concurrency
///
/// - Lookups run concurrently under the read lock.
/// - [`Registry::retain`] holds the write lock for the whole traversal, so
///   it may delete the current entry safely while other tasks insert or
///   remove around it.
/// - [`Registry::snapshot`] clones the handles out so callers can `.await`
///   per entry without holding any lock.
pub struct Registry<K, V: ?Sized> {
    entries: RwLock<HashMap<K, Arc<V>>>,
}

impl<K, V> Registry<K, V>
where
    K: Copy + Eq + Hash + fmt::Display,
    V: ?Sized,
{
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Inserts a handle under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`MuxError::AlreadyRegistered`] if `key` is taken.
    pub async fn insert(&self, key: K, value: Arc<V>) -> Result<(), MuxError> {
        let mut map = self.entries.write().await;
        if map.contains_key(&key) {
            return Err(MuxError::AlreadyRegistered(key.to_string()));
        }
        map.insert(key, value);
        Ok(())
    }

    /// Returns the handle registered under `key`, if any.
    pub async fn get(&self, key: K) -> Option<Arc<V>> {
        self.entries.read().await.get(&key).cloned()
    }

    /// Removes and returns the handle registered under `key`.
    pub async fn remove(&self, key: K) -> Option<Arc<V>> {
        self.entries.write().await.remove(&key)
    }

    /// Visits every entry, keeping those for which `keep` returns `true`.
    ///
    /// `keep` runs under the write lock and must not block.
    pub async fn retain<F>(&self, mut keep: F)
    where
        F: FnMut(K, &Arc<V>) -> bool,
    {
        self.entries
            .write()
            .await
            .retain(|key, value| keep(*key, value));
    }

    /// Returns a point-in-time copy of every entry.
    pub async fn snapshot(&self) -> Vec<(K, Arc<V>)> {
        self.entries
            .read()
            .await
            .iter()
            .map(|(key, value)| (*key, Arc::clone(value)))
            .collect()
    }

    /// Removes every entry and returns them.
    pub async fn drain(&self) -> Vec<(K, Arc<V>)> {
        self.entries.write().await.drain().collect()
    }

    /// Returns `true` if `key` is registered.
    pub async fn contains(&self, key: K) -> bool {
        self.entries.read().await.contains_key(&key)
    }

    /// Returns the number of entries.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Returns `true` if the registry holds no entries.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl<K, V> Default for Registry<K, V>
where
    K: Copy + Eq + Hash + fmt::Display,
    V: ?Sized,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V: ?Sized> fmt::Debug for Registry<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = self.entries.try_read().map(|map| map.len()).ok();
        f.debug_struct("Registry").field("len", &len).finish()
    }
}
