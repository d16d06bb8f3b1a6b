//! Cache storage abstraction.
//!
//! A [`CacheStorage`] is a set of named stores; each [`Cache`] maps request
//! keys to captured responses. Individual operations are atomic, but nothing
//! spans more than one operation, so callers never hold locks across awaits.

use async_trait::async_trait;

use crate::error::Result;
use crate::request::RequestKey;
use crate::response::Response;

mod disk;
mod memory;

pub use disk::{DiskCache, DiskStorage};
pub use memory::{MemoryCache, MemoryStorage};

/// A set of named caches.
#[async_trait]
pub trait CacheStorage: Send + Sync + 'static {
    /// Handle to a single named cache.
    type Cache: Cache;

    /// Opens the cache called `name`, creating it if absent.
    async fn open(&self, name: &str) -> Result<Self::Cache>;

    /// Returns true if a cache called `name` exists.
    async fn has(&self, name: &str) -> Result<bool>;

    /// Lists every cache name.
    async fn keys(&self) -> Result<Vec<String>>;

    /// Deletes the cache called `name`. Returns false if it did not exist.
    async fn delete(&self, name: &str) -> Result<bool>;
}

/// One named cache.
#[async_trait]
pub trait Cache: Send + Sync + 'static {
    /// Returns the stored response for `key`, if any.
    async fn lookup(&self, key: &RequestKey) -> Result<Option<Response>>;

    /// Stores `response` under `key`, replacing any previous entry.
    async fn put(&self, key: &RequestKey, response: &Response) -> Result<()>;

    /// Removes the entry for `key`. Returns false if there was none.
    async fn delete(&self, key: &RequestKey) -> Result<bool>;

    /// Lists every stored key.
    async fn keys(&self) -> Result<Vec<RequestKey>>;
}
