//! In-process cache storage.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{Cache, CacheStorage};
use crate::error::{Error, Result};
use crate::request::RequestKey;
use crate::response::Response;

type Entries = Arc<Mutex<HashMap<RequestKey, Response>>>;

fn poisoned<T>(_: PoisonError<T>) -> Error {
    Error::Storage("cache lock poisoned".to_string())
}

/// Cache storage held entirely in memory. Clones share the same caches.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    // Vec keeps creation order for `keys`.
    caches: Arc<Mutex<Vec<(String, MemoryCache)>>>,
}

impl MemoryStorage {
    /// Creates an empty storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Vec<(String, MemoryCache)>>> {
        self.caches.lock().map_err(poisoned)
    }
}

#[async_trait]
impl CacheStorage for MemoryStorage {
    type Cache = MemoryCache;

    async fn open(&self, name: &str) -> Result<MemoryCache> {
        let mut caches = self.lock()?;
        if let Some((_, cache)) = caches.iter().find(|(n, _)| n == name) {
            return Ok(cache.clone());
        }
        let cache = MemoryCache::default();
        caches.push((name.to_string(), cache.clone()));
        Ok(cache)
    }

    async fn has(&self, name: &str) -> Result<bool> {
        Ok(self.lock()?.iter().any(|(n, _)| n == name))
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.lock()?.iter().map(|(n, _)| n.clone()).collect())
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        let mut caches = self.lock()?;
        let before = caches.len();
        caches.retain(|(n, _)| n != name);
        Ok(caches.len() != before)
    }
}

/// A single in-memory cache.
#[derive(Debug, Clone, Default)]
pub struct MemoryCache {
    entries: Entries,
}

impl MemoryCache {
    fn lock(&self) -> Result<MutexGuard<'_, HashMap<RequestKey, Response>>> {
        self.entries.lock().map_err(poisoned)
    }

    /// Number of stored entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.len())
    }

    /// Returns true if nothing is stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.lock()?.is_empty())
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn lookup(&self, key: &RequestKey) -> Result<Option<Response>> {
        Ok(self.lock()?.get(key).cloned())
    }

    async fn put(&self, key: &RequestKey, response: &Response) -> Result<()> {
        self.lock()?.insert(key.clone(), response.clone());
        Ok(())
    }

    async fn delete(&self, key: &RequestKey) -> Result<bool> {
        Ok(self.lock()?.remove(key).is_some())
    }

    async fn keys(&self) -> Result<Vec<RequestKey>> {
        let mut keys: Vec<_> = self.lock()?.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}
