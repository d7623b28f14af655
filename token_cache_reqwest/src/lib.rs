//! Middleware to attach cached access tokens to outgoing requests
//!
//! When using [`ClientWithMiddleware`](reqwest_middleware::ClientWithMiddleware),
//! include the [`CachedTokenMiddleware`] in the middleware stack to attach an
//! access token to each outbound request. Tokens are read from a
//! [`TokenCacheStore`]; on a miss the middleware asks its [`TokenProvider`]
//! for a fresh token and saves it for the next request.
//!
//! If the server answers `401 Unauthorized`, the cached token is assumed to
//! be stale. The middleware purges it, obtains a new token, and sends the
//! request one more time. A second `401` is returned to the caller.
//!
//! ```
//! use std::sync::Arc;
//!
//! use reqwest::Client;
//! use reqwest_middleware::ClientBuilder;
//! use token_cache::{
//!     backends::InMemoryCache, key::IdentityFields, ProviderIdentity, RequestOptions,
//!     TokenCacheStore, TokenProvider, TokenWithExpiry,
//! };
//! use token_cache_reqwest::CachedTokenMiddleware;
//!
//! struct ClientCredentials {
//!     client_id: String,
//! }
//!
//! impl ProviderIdentity for ClientCredentials {
//!     fn describe(&self, fields: &mut IdentityFields) {
//!         fields.field("client_id", self.client_id.as_str());
//!     }
//! }
//!
//! #[async_trait::async_trait]
//! impl TokenProvider for ClientCredentials {
//!     type Error = std::io::Error;
//!
//!     async fn request_token(
//!         &self,
//!         options: &RequestOptions,
//!     ) -> Result<TokenWithExpiry, Self::Error> {
//!         // Exchange the client credentials at the token endpoint
//! #       unimplemented!()
//!     }
//! }
//!
//! let provider = Arc::new(ClientCredentials {
//!     client_id: "my-service".into(),
//! });
//!
//! let store = TokenCacheStore::new(InMemoryCache::new());
//! let middleware = CachedTokenMiddleware::new(provider, store)
//!     .with_options(RequestOptions::new().with("scope", "read"));
//!
//! let client = ClientBuilder::new(Client::default())
//!     .with(middleware)
//!     .build();
//!
//! let req = client
//!     .get("https://example.com");
//! # async move { req
//!     .send()
//!     .await
//!     .unwrap();
//! # };
//! ```
//!
//! The middleware can also be configured to add an authorization token
//! only conditionally. This can be useful in the event that you want to
//! use a single common middleware stack with multiple potential backends
//! and want to ensure that specific tokens are used for specific backends.
//!
//! ```
//! use token_cache_reqwest::{HostAllowList, HttpsOnly};
//! use predicates::prelude::PredicateBooleanExt;
//!
//! let predicate = HttpsOnly.and(HostAllowList::new(["api.example.com", "files.example.com"]));
//! # let _ = predicate;
//! ```

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

use std::{error, fmt, sync::Arc};

use bytes::{BufMut, BytesMut};
use predicates::{prelude::*, reflection};
use reqwest::{header, Request, Response};
use reqwest_middleware::{Error, Middleware, Next, Result};
use thiserror::Error;
use token_cache::{
    backends::CacheBackend, AccessToken, AccessTokenRef, RequestOptions, RetryContext,
    RetryDecider, StoreError, TokenCacheStore, TokenProvider,
};

/// A middleware that injects a cached access token into outgoing requests
#[derive(Debug)]
pub struct CachedTokenMiddleware<P, B, Pr = HttpsOnly> {
    provider: Arc<P>,
    store: TokenCacheStore<B>,
    options: RequestOptions,
    decider: RetryDecider,
    predicate: Pr,
}

impl<P, B> CachedTokenMiddleware<P, B, HttpsOnly> {
    /// Construct a new middleware from a token provider and the store its tokens are cached in
    ///
    /// By default, this middleware will only send its token if the request
    /// is being sent via HTTPS, and will request tokens with no options. To
    /// change this behavior, use [`with_predicate()`][Self::with_predicate()]
    /// and [`with_options()`][Self::with_options()].
    pub fn new(provider: Arc<P>, store: TokenCacheStore<B>) -> Self {
        Self {
            provider,
            store,
            options: RequestOptions::new(),
            decider: RetryDecider::new(),
            predicate: HttpsOnly,
        }
    }
}

impl<P, B, Pr> CachedTokenMiddleware<P, B, Pr> {
    /// Replaces the default predicate with a custom predicate
    pub fn with_predicate<Q>(self, predicate: Q) -> CachedTokenMiddleware<P, B, Q> {
        CachedTokenMiddleware {
            provider: self.provider,
            store: self.store,
            options: self.options,
            decider: self.decider,
            predicate,
        }
    }

    /// Sets the options tokens are requested and cached with
    pub fn with_options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }

    /// Gets the token store
    pub fn store(&self) -> &TokenCacheStore<B> {
        &self.store
    }
}

impl<P, B, Pr> Clone for CachedTokenMiddleware<P, B, Pr>
where
    B: Clone,
    Pr: Clone,
{
    fn clone(&self) -> Self {
        Self {
            provider: Arc::clone(&self.provider),
            store: self.store.clone(),
            options: self.options.clone(),
            decider: self.decider,
            predicate: self.predicate.clone(),
        }
    }
}

/// An error raised by the middleware before or between dispatch attempts
#[derive(Debug, Error)]
pub enum MiddlewareError {
    /// The token cache could not be read
    #[error("unable to read access token from cache")]
    Fetch(#[source] StoreError),
    /// The stale token could not be purged before retrying
    #[error("unable to purge stale access token from cache")]
    Purge(#[source] StoreError),
    /// The provider failed to issue a token
    #[error("token provider failed to issue an access token")]
    Provider(#[source] Box<dyn error::Error + Send + Sync + 'static>),
    /// The token cannot be sent in a header
    #[error("access token is not a valid header value")]
    InvalidToken(#[from] header::InvalidHeaderValue),
}

impl<P, B, Pr> CachedTokenMiddleware<P, B, Pr>
where
    P: TokenProvider,
    B: CacheBackend,
{
    async fn obtain_token(&self) -> std::result::Result<AccessToken, MiddlewareError> {
        let cached = self
            .store
            .fetch(&*self.provider, &self.options)
            .await
            .map_err(MiddlewareError::Fetch)?;

        if let Some(token) = cached {
            tracing::trace!("using cached access token");
            return Ok(token);
        }

        tracing::debug!("no cached access token, requesting one from provider");
        let token = self
            .provider
            .request_token(&self.options)
            .await
            .map_err(|e| MiddlewareError::Provider(Box::new(e)))?;

        tracing::debug!(expiry = token.expiry().0, "obtained access token from provider");

        if let Err(error) = self.store.save(&token, &*self.provider, &self.options).await {
            tracing::warn!(
                error = (&error as &dyn error::Error),
                "unable to save access token to cache"
            );
        }

        Ok(token.into_access_token())
    }
}

fn bearer_header(
    token: &AccessTokenRef,
) -> std::result::Result<header::HeaderValue, MiddlewareError> {
    let mut header_value = BytesMut::with_capacity(token.as_str().len() + 7);
    header_value.put_slice(b"Bearer ");
    header_value.put_slice(token.as_str().as_bytes());
    let mut value = header::HeaderValue::from_maybe_shared(header_value.freeze())?;
    value.set_sensitive(true);
    Ok(value)
}

#[async_trait::async_trait]
impl<P, B, Pr> Middleware for CachedTokenMiddleware<P, B, Pr>
where
    P: TokenProvider + 'static,
    B: CacheBackend + 'static,
    Pr: Predicate<Request> + Send + Sync + 'static,
{
    async fn handle(
        &self,
        req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> Result<Response> {
        if !self.predicate.eval(&req) {
            return next.run(req, extensions).await;
        }

        if req.headers().contains_key(header::AUTHORIZATION) {
            tracing::trace!("request already has an authorization header, leaving it in place");
            return next.run(req, extensions).await;
        }

        let mut req = req;
        let mut attempt = 0;
        loop {
            let replay = req.try_clone();

            let token = self.obtain_token().await.map_err(Error::middleware)?;
            let value = bearer_header(&token).map_err(Error::middleware)?;
            req.headers_mut().insert(header::AUTHORIZATION, value);

            let outcome = next.clone().run(req, extensions).await;

            let retry = {
                let ctx = match &outcome {
                    Ok(resp) => RetryContext::with_status(attempt, resp.status()),
                    Err(error) => RetryContext::with_error(attempt, error),
                };
                self.decider.should_retry(&ctx)
            };

            if !retry {
                return outcome;
            }

            let Some(replay) = replay else {
                tracing::debug!(
                    attempt,
                    "authorization rejected but request body cannot be replayed"
                );
                return outcome;
            };

            tracing::debug!(
                attempt,
                "authorization rejected, purging cached access token and retrying"
            );
            self.store
                .delete(&*self.provider, &self.options)
                .await
                .map_err(|e| Error::middleware(MiddlewareError::Purge(e)))?;

            req = replay;
            attempt += 1;
        }
    }
}

/// Only attach an access token if the request is being sent over HTTPS
#[derive(Clone, Copy, Debug)]
pub struct HttpsOnly;

impl Predicate<Request> for HttpsOnly {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url().scheme() == "https"
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case<'_>> {
        let result = self.eval(req);
        if result != expected {
            Some(
                reflection::Case::new(Some(self), result).add_product(reflection::Product::new(
                    "scheme",
                    req.url().scheme().to_owned(),
                )),
            )
        } else {
            None
        }
    }
}

impl reflection::PredicateReflection for HttpsOnly {}
impl fmt::Display for HttpsOnly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("scheme is https")
    }
}

/// Only attach an access token if the request is being sent to one of the listed hosts
///
/// Hosts are compared case-insensitively and without the port.
#[derive(Clone, Debug)]
pub struct HostAllowList {
    hosts: Vec<String>,
}

impl HostAllowList {
    /// Construct a new predicate from a list of host names
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            hosts: hosts
                .into_iter()
                .map(|h| h.as_ref().to_ascii_lowercase())
                .collect(),
        }
    }

    fn allows(&self, host: &str) -> bool {
        self.hosts.iter().any(|h| h.eq_ignore_ascii_case(host))
    }
}

impl Predicate<Request> for HostAllowList {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url().host_str().map_or(false, |h| self.allows(h))
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case<'_>> {
        let result = self.eval(req);
        if result != expected {
            Some(
                reflection::Case::new(Some(self), result).add_product(reflection::Product::new(
                    "host",
                    req.url().host_str().unwrap_or("<none>").to_owned(),
                )),
            )
        } else {
            None
        }
    }
}

impl reflection::PredicateReflection for HostAllowList {}
impl fmt::Display for HostAllowList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("host in [")?;
        f.write_str(&self.hosts.join(", "))?;
        f.write_str("]")
    }
}
