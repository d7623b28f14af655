//! Caching of OAuth2 access tokens, with recovery from stale credentials
//!
//! Fetching a new access token for every outbound request is wasteful, and
//! most token endpoints rate-limit clients that do so. This crate caches
//! tokens in a pluggable [`CacheBackend`][backends::CacheBackend], keyed on
//! the *configuration* of the provider that issued them together with the
//! options the token was requested with.
//!
//! A cached token can go stale before its declared expiry, for example when
//! it is revoked. The [`RetryDecider`][retry::RetryDecider] recognizes the one
//! response that indicates this, a `401 Unauthorized` on a request's first
//! attempt, so that the caller can purge the cached token and retry exactly
//! once.
//!
//! # General Flow
//!
//! ```
//! use token_cache::{
//!     backends::InMemoryCache,
//!     key::{IdentityFields, ProviderIdentity, RequestOptions},
//!     retry::{RetryContext, RetryDecider},
//!     store::TokenCacheStore,
//!     AccessToken, TokenWithExpiry,
//! };
//! use token_cache_clock::{Clock, DurationSecs, System};
//!
//! struct ClientCredentials {
//!     token_url: &'static str,
//!     client_id: &'static str,
//! }
//!
//! impl ProviderIdentity for ClientCredentials {
//!     fn describe(&self, fields: &mut IdentityFields) {
//!         fields
//!             .field("token_url", self.token_url)
//!             .field("client_id", self.client_id);
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let provider = ClientCredentials {
//!     token_url: "https://auth.example.com/oauth/token",
//!     client_id: "my-service",
//! };
//! let options = RequestOptions::new().with("scope", "read");
//! let store = TokenCacheStore::new(InMemoryCache::new());
//!
//! if store.fetch(&provider, &options).await?.is_none() {
//!     // A real client would call the token endpoint here
//!     let token = TokenWithExpiry::new(
//!         AccessToken::from_static("abc"),
//!         System.now() + DurationSecs(3600),
//!     );
//!     store.save(&token, &provider, &options).await?;
//! }
//!
//! // … the request is sent and the server answers 401 …
//! let ctx = RetryContext::with_status(0, http::StatusCode::UNAUTHORIZED);
//! if RetryDecider::new().should_retry(&ctx) {
//!     store.delete(&provider, &options).await?;
//! }
//!
//! assert!(store.fetch(&provider, &options).await?.is_none());
//! # Ok(()) }
//! ```
//!
//! The `token_cache_reqwest` crate wires these pieces into a
//! `reqwest-middleware` stack.
//!
//! # Features
//!
//! * `file` (default): Provides [`FileCache`][backends::FileCache], a cache
//!   backend using the local filesystem.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

pub mod backends;
mod braids;
pub mod key;
pub mod provider;
pub mod retry;
pub mod store;
mod tokens;

pub use braids::*;
pub use key::{derive_key, ProviderIdentity, RequestOptions, CACHE_KEY_PREFIX};
pub use provider::TokenProvider;
pub use retry::{RetryContext, RetryDecider};
pub use store::{StoreError, TokenCacheStore};
pub use tokens::TokenWithExpiry;
