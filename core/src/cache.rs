//! Per-key value cache.
//!
//! [`CacheStore`] is owned by the client and is the only type with write
//! methods. Exchanges and fetch handlers receive a [`CacheView`], which shares
//! the same storage but only exposes reads, so nothing outside the client can
//! change cached values except through emitted operations.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::request::RequestId;

type Entries = Arc<RwLock<HashMap<RequestId, Value>>>;

/// Writable cache, held by the client.
#[derive(Debug, Default)]
pub struct CacheStore {
    entries: Entries,
}

impl CacheStore {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Read-only handle sharing this store's storage.
    #[must_use]
    pub fn view(&self) -> CacheView {
        CacheView {
            entries: Arc::clone(&self.entries),
        }
    }

    /// Latest value for `key`.
    #[must_use]
    pub fn get(&self, key: &RequestId) -> Option<Value> {
        read(&self.entries).get(key).cloned()
    }

    /// Replace the value for `key`.
    pub fn set(&self, key: RequestId, value: Value) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, value);
    }

    /// Remove `key`, returning its last value.
    pub fn delete(&self, key: &RequestId) -> Option<Value> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }

    /// Number of cached keys.
    #[must_use]
    pub fn len(&self) -> usize {
        read(&self.entries).len()
    }

    /// Whether nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Read-only view of a [`CacheStore`].
///
/// Clones share the same underlying storage and observe every write the
/// client makes.
#[derive(Debug, Clone)]
pub struct CacheView {
    entries: Entries,
}

impl CacheView {
    /// Latest value for `key`.
    #[must_use]
    pub fn get(&self, key: &RequestId) -> Option<Value> {
        read(&self.entries).get(key).cloned()
    }

    /// Whether `key` has a cached value.
    #[must_use]
    pub fn contains(&self, key: &RequestId) -> bool {
        read(&self.entries).contains_key(key)
    }

    /// Snapshot of the cached keys.
    #[must_use]
    pub fn keys(&self) -> Vec<RequestId> {
        read(&self.entries).keys().cloned().collect()
    }

    /// Number of cached keys.
    #[must_use]
    pub fn len(&self) -> usize {
        read(&self.entries).len()
    }

    /// Whether nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn read(entries: &Entries) -> std::sync::RwLockReadGuard<'_, HashMap<RequestId, Value>> {
    entries.read().unwrap_or_else(PoisonError::into_inner)
}
