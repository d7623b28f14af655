//! Cache backends
//!
//! A [`CacheBackend`] is the storage a [`TokenCacheStore`][crate::store::TokenCacheStore]
//! keeps tokens in. Backends own expiry: an entry written with an expiry
//! instant must read as a miss once that instant has passed.

use async_trait::async_trait;
use std::{error, sync::Arc};
use token_cache_clock::UnixTime;

use crate::CacheKeyRef;

#[cfg(feature = "file")]
pub mod file;
pub mod in_memory;

#[cfg(feature = "file")]
pub use file::FileCache;
pub use in_memory::InMemoryCache;

/// An error reported by a cache backend
pub type BackendError = Box<dyn error::Error + Send + Sync + 'static>;

/// A key-value store with per-entry expiry
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Gets the value stored under `key`
    ///
    /// Returns `Ok(None)` when there is no entry or the entry has expired.
    async fn get(&self, key: &CacheKeyRef) -> Result<Option<String>, BackendError>;

    /// Stores `value` under `key` until `expires_at`, replacing any existing entry
    async fn set(
        &self,
        key: &CacheKeyRef,
        value: &str,
        expires_at: UnixTime,
    ) -> Result<(), BackendError>;

    /// Removes the entry stored under `key`
    ///
    /// Removing a key that has no entry succeeds.
    async fn delete(&self, key: &CacheKeyRef) -> Result<(), BackendError>;
}

#[async_trait]
impl<T: CacheBackend + ?Sized> CacheBackend for Arc<T> {
    async fn get(&self, key: &CacheKeyRef) -> Result<Option<String>, BackendError> {
        (**self).get(key).await
    }

    async fn set(
        &self,
        key: &CacheKeyRef,
        value: &str,
        expires_at: UnixTime,
    ) -> Result<(), BackendError> {
        (**self).set(key, value, expires_at).await
    }

    async fn delete(&self, key: &CacheKeyRef) -> Result<(), BackendError> {
        (**self).delete(key).await
    }
}
