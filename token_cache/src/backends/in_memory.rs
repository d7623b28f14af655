//! An in-memory cache backend

use std::{
    collections::HashMap,
    fmt,
    sync::{Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use token_cache_clock::{Clock, System, UnixTime};

use super::{BackendError, CacheBackend};
use crate::{CacheKey, CacheKeyRef};

struct Entry {
    value: String,
    expires_at: UnixTime,
}

/// An in-memory cache backend
///
/// Expired entries are not swept in the background. Each is dropped the
/// next time its key is read, so an entry whose key is never read again
/// stays resident (and counted by [`len`][Self::len]) until it is
/// overwritten or deleted.
pub struct InMemoryCache<C = System> {
    entries: Mutex<HashMap<CacheKey, Entry>>,
    clock: C,
}

impl InMemoryCache<System> {
    /// Constructs a new, empty in-memory cache
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock: System,
        }
    }
}

impl Default for InMemoryCache<System> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> InMemoryCache<C> {
    /// Sets a custom clock to be used
    ///
    /// Useful for testing purposes
    pub fn with_clock<D>(self, clock: D) -> InMemoryCache<D> {
        InMemoryCache {
            entries: self.entries,
            clock,
        }
    }

    /// The number of entries held, including any that have expired but not yet been read
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every critical section is a single map operation, so a panic while the
    /// lock is held cannot leave the map half-updated and poisoning is ignored.
    fn lock(&self) -> MutexGuard<'_, HashMap<CacheKey, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<C: fmt::Debug> fmt::Debug for InMemoryCache<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("InMemoryCache")
            .field("len", &self.len())
            .field("clock", &self.clock)
            .finish()
    }
}

#[async_trait]
impl<C: Clock + Send + Sync> CacheBackend for InMemoryCache<C> {
    async fn get(&self, key: &CacheKeyRef) -> Result<Option<String>, BackendError> {
        let now = self.clock.now();
        let mut entries = self.lock();

        let expired_at = match entries.get(key) {
            Some(entry) if now < entry.expires_at => return Ok(Some(entry.value.clone())),
            Some(entry) => entry.expires_at,
            None => return Ok(None),
        };

        tracing::trace!(cache.key = %key, expired_at = expired_at.0, "dropping expired entry");
        entries.remove(key);
        Ok(None)
    }

    async fn set(
        &self,
        key: &CacheKeyRef,
        value: &str,
        expires_at: UnixTime,
    ) -> Result<(), BackendError> {
        self.lock().insert(
            key.to_owned(),
            Entry {
                value: value.to_owned(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &CacheKeyRef) -> Result<(), BackendError> {
        self.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use token_cache_clock::{DurationSecs, TestClock};

    use super::*;

    fn key() -> CacheKey {
        CacheKey::from_static("oauth2-token-00112233445566778899aabbccddeeff")
    }

    #[tokio::test]
    async fn stored_value_is_returned_until_expiry() {
        let clock = TestClock::new(UnixTime(1_000));
        let cache = InMemoryCache::new().with_clock(clock.clone());

        cache.set(&key(), "abc", UnixTime(1_010)).await.unwrap();
        assert_eq!(cache.get(&key()).await.unwrap().as_deref(), Some("abc"));

        clock.advance(DurationSecs(9));
        assert_eq!(cache.get(&key()).await.unwrap().as_deref(), Some("abc"));

        clock.advance(DurationSecs(1));
        assert_eq!(cache.get(&key()).await.unwrap(), None);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn set_replaces_existing_entry() {
        let cache = InMemoryCache::new().with_clock(TestClock::new(UnixTime(0)));

        cache.set(&key(), "first", UnixTime(100)).await.unwrap();
        cache.set(&key(), "second", UnixTime(100)).await.unwrap();

        assert_eq!(cache.get(&key()).await.unwrap().as_deref(), Some("second"));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn len_counts_expired_entries_until_they_are_read() {
        let clock = TestClock::new(UnixTime(0));
        let cache = InMemoryCache::new().with_clock(clock.clone());

        cache.set(&key(), "abc", UnixTime(10)).await.unwrap();
        clock.advance(DurationSecs(10));
        assert_eq!(cache.len(), 1);

        assert_eq!(cache.get(&key()).await.unwrap(), None);
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test]
    async fn cache_keeps_working_after_a_panic_while_locked() {
        let cache = Arc::new(InMemoryCache::new());
        cache.set(&key(), "abc", UnixTime(u64::MAX)).await.unwrap();

        let poisoner = Arc::clone(&cache);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.entries.lock().unwrap();
            panic!("poison the lock");
        })
        .join();
        assert!(cache.entries.is_poisoned());

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&key()).await.unwrap().as_deref(), Some("abc"));
        cache.delete(&key()).await.unwrap();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn deleting_a_missing_key_succeeds() {
        let cache = InMemoryCache::new();

        cache.delete(&key()).await.unwrap();
        assert_eq!(cache.get(&key()).await.unwrap(), None);
    }
}
