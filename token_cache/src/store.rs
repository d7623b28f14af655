//! The token cache store
//!
//! [`TokenCacheStore`] is the only component that talks to the cache
//! backend. Every operation derives the cache key from the provider identity
//! and request options it is given, so nothing about a provider is retained
//! between calls.

use std::fmt;

use thiserror::Error;

use crate::{
    backends::{BackendError, CacheBackend},
    key::{derive_key, KeyError, ProviderIdentity, RequestOptions},
    AccessToken, CacheKey, TokenWithExpiry,
};

/// The backend operation that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOperation {
    /// Reading an entry
    Get,
    /// Writing an entry
    Set,
    /// Removing an entry
    Delete,
}

impl fmt::Display for CacheOperation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::Get => "get",
            Self::Set => "set",
            Self::Delete => "delete",
        })
    }
}

/// An error from a [`TokenCacheStore`] operation
#[derive(Debug, Error)]
pub enum StoreError {
    /// The cache key could not be derived
    #[error("unable to derive cache key")]
    Key(#[from] KeyError),
    /// The cache backend failed
    ///
    /// This is distinct from a miss: the state of the cache is unknown.
    #[error("cache backend unavailable during {operation}")]
    Unavailable {
        /// The operation that failed
        operation: CacheOperation,
        /// The error reported by the backend
        #[source]
        source: BackendError,
    },
}

impl StoreError {
    fn unavailable(operation: CacheOperation) -> impl FnOnce(BackendError) -> Self {
        move |source| Self::Unavailable { operation, source }
    }
}

/// Caches access tokens in a [`CacheBackend`], keyed on provider configuration and request options
///
/// The store does not check expiry itself. The token's expiry is handed to
/// the backend on save, and the backend reports a miss once it has passed.
#[derive(Debug, Clone)]
pub struct TokenCacheStore<B> {
    backend: B,
}

impl<B> TokenCacheStore<B> {
    /// Constructs a new store over the given backend
    pub const fn new(backend: B) -> Self {
        Self { backend }
    }

    /// Gets the underlying backend
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Derives the key that entries for this provider and options are stored under
    pub fn cache_key<P>(
        &self,
        provider: &P,
        options: &RequestOptions,
    ) -> Result<CacheKey, StoreError>
    where
        P: ProviderIdentity + ?Sized,
    {
        Ok(derive_key(provider, options)?)
    }
}

impl<B: CacheBackend> TokenCacheStore<B> {
    /// Fetches the cached access token for this provider and options
    ///
    /// Returns `Ok(None)` on a miss. A failing backend is reported as
    /// [`StoreError::Unavailable`], never as a miss.
    #[tracing::instrument(level = "trace", skip_all, fields(cache.key))]
    pub async fn fetch<P>(
        &self,
        provider: &P,
        options: &RequestOptions,
    ) -> Result<Option<AccessToken>, StoreError>
    where
        P: ProviderIdentity + Sync + ?Sized,
    {
        let key = self.cache_key(provider, options)?;
        tracing::Span::current().record("cache.key", key.as_str());

        let value = self
            .backend
            .get(&key)
            .await
            .map_err(StoreError::unavailable(CacheOperation::Get))?;

        match value {
            Some(token) => {
                tracing::trace!("cache hit");
                Ok(Some(AccessToken::new(token)))
            }
            None => {
                tracing::trace!("cache miss");
                Ok(None)
            }
        }
    }

    /// Saves an access token for this provider and options until the token's expiry
    #[tracing::instrument(level = "trace", skip_all, fields(cache.key, expiry = token.expiry().0))]
    pub async fn save<P>(
        &self,
        token: &TokenWithExpiry,
        provider: &P,
        options: &RequestOptions,
    ) -> Result<(), StoreError>
    where
        P: ProviderIdentity + Sync + ?Sized,
    {
        let key = self.cache_key(provider, options)?;
        tracing::Span::current().record("cache.key", key.as_str());

        self.backend
            .set(&key, token.access_token().as_str(), token.expiry())
            .await
            .map_err(StoreError::unavailable(CacheOperation::Set))?;

        tracing::trace!("saved token");
        Ok(())
    }

    /// Removes any cached access token for this provider and options
    ///
    /// Succeeds when there was nothing to remove.
    #[tracing::instrument(level = "trace", skip_all, fields(cache.key))]
    pub async fn delete<P>(&self, provider: &P, options: &RequestOptions) -> Result<(), StoreError>
    where
        P: ProviderIdentity + Sync + ?Sized,
    {
        let key = self.cache_key(provider, options)?;
        tracing::Span::current().record("cache.key", key.as_str());

        self.backend
            .delete(&key)
            .await
            .map_err(StoreError::unavailable(CacheOperation::Delete))?;

        tracing::trace!("deleted token");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{error, sync::Arc};

    use async_trait::async_trait;
    use token_cache_clock::{DurationSecs, TestClock, UnixTime};

    use super::*;
    use crate::{
        backends::InMemoryCache,
        key::IdentityFields,
        retry::{RetryContext, RetryDecider},
        AccessTokenRef, CacheKeyRef,
    };

    struct Provider(&'static str);

    impl ProviderIdentity for Provider {
        fn describe(&self, fields: &mut IdentityFields) {
            fields
                .field("token_url", "https://auth.example.com/oauth/token")
                .field("client_id", self.0);
        }
    }

    struct Unavailable;

    #[async_trait]
    impl CacheBackend for Unavailable {
        async fn get(&self, _: &CacheKeyRef) -> Result<Option<String>, BackendError> {
            Err("connection refused".into())
        }

        async fn set(&self, _: &CacheKeyRef, _: &str, _: UnixTime) -> Result<(), BackendError> {
            Err("connection refused".into())
        }

        async fn delete(&self, _: &CacheKeyRef) -> Result<(), BackendError> {
            Err("connection refused".into())
        }
    }

    const T: UnixTime = UnixTime(1_498_146_237);

    fn store() -> (TokenCacheStore<InMemoryCache<TestClock>>, TestClock) {
        let clock = TestClock::new(T);
        let store = TokenCacheStore::new(InMemoryCache::new().with_clock(clock.clone()));
        (store, clock)
    }

    fn token(value: &'static str) -> TokenWithExpiry {
        TokenWithExpiry::new(AccessToken::from_static(value), T + DurationSecs(3600))
    }

    #[tokio::test]
    async fn fetch_without_save_is_a_miss() {
        let (store, _) = store();

        let fetched = store.fetch(&Provider("a"), &RequestOptions::new()).await.unwrap();
        assert_eq!(fetched, None);
    }

    #[tokio::test]
    async fn saved_token_is_fetched_until_expiry() {
        let (store, clock) = store();
        let provider = Provider("a");
        let options = RequestOptions::new().with("scope", "read");

        store.save(&token("abc"), &provider, &options).await.unwrap();

        clock.advance(DurationSecs(3599));
        let fetched = store.fetch(&provider, &options).await.unwrap();
        assert_eq!(fetched.as_deref().map(AccessTokenRef::as_str), Some("abc"));

        clock.advance(DurationSecs(1));
        assert_eq!(store.fetch(&provider, &options).await.unwrap(), None);
    }

    #[tokio::test]
    async fn entries_are_separated_by_provider_and_options() {
        let (store, _) = store();
        let read = RequestOptions::new().with("scope", "read");
        let write = RequestOptions::new().with("scope", "write");

        store.save(&token("a-read"), &Provider("a"), &read).await.unwrap();

        assert_eq!(store.fetch(&Provider("b"), &read).await.unwrap(), None);
        assert_eq!(store.fetch(&Provider("a"), &write).await.unwrap(), None);
        assert!(store.fetch(&Provider("a"), &read).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn delete_removes_the_entry() {
        let (store, _) = store();
        let options = RequestOptions::new();

        store.save(&token("abc"), &Provider("a"), &options).await.unwrap();
        store.delete(&Provider("a"), &options).await.unwrap();

        assert_eq!(store.fetch(&Provider("a"), &options).await.unwrap(), None);
    }

    #[tokio::test]
    async fn delete_of_absent_entry_succeeds() {
        let (store, _) = store();

        store.delete(&Provider("a"), &RequestOptions::new()).await.unwrap();
        store.delete(&Provider("a"), &RequestOptions::new()).await.unwrap();
    }

    #[tokio::test]
    async fn stores_sharing_a_backend_share_entries() {
        let backend = Arc::new(InMemoryCache::new().with_clock(TestClock::new(T)));
        let first = TokenCacheStore::new(backend.clone());
        let second = TokenCacheStore::new(backend);

        first.save(&token("abc"), &Provider("a"), &RequestOptions::new()).await.unwrap();

        let fetched = second.fetch(&Provider("a"), &RequestOptions::new()).await.unwrap();
        assert_eq!(fetched, Some(AccessToken::from_static("abc")));
    }

    #[tokio::test]
    async fn unavailable_backend_is_not_a_miss() {
        let store = TokenCacheStore::new(Unavailable);
        let options = RequestOptions::new();

        let err = store.fetch(&Provider("a"), &options).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Unavailable {
                operation: CacheOperation::Get,
                ..
            }
        ));
        assert_eq!(err.to_string(), "cache backend unavailable during get");
        assert_eq!(
            error::Error::source(&err).map(ToString::to_string).as_deref(),
            Some("connection refused")
        );

        let err = store.save(&token("abc"), &Provider("a"), &options).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Unavailable {
                operation: CacheOperation::Set,
                ..
            }
        ));

        let err = store.delete(&Provider("a"), &options).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Unavailable {
                operation: CacheOperation::Delete,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn malformed_options_fail_before_touching_the_backend() {
        let store = TokenCacheStore::new(Unavailable);
        let options = RequestOptions::new().with("weight", f64::NAN);

        let err = store.fetch(&Provider("a"), &options).await.unwrap_err();
        assert!(matches!(err, StoreError::Key(KeyError::NonFiniteValue { .. })));
    }

    #[tokio::test]
    async fn stale_token_is_purged_after_authorization_failure() {
        let (store, _) = store();
        let provider = Provider("a");
        let options = RequestOptions::new();
        let decider = RetryDecider::new();

        store.save(&token("abc"), &provider, &options).await.unwrap();
        assert_eq!(
            store.fetch(&provider, &options).await.unwrap(),
            Some(AccessToken::from_static("abc"))
        );

        let ctx = RetryContext::with_status(0, http::StatusCode::UNAUTHORIZED);
        assert!(decider.should_retry(&ctx));

        store.delete(&provider, &options).await.unwrap();
        assert_eq!(store.fetch(&provider, &options).await.unwrap(), None);
    }
}
