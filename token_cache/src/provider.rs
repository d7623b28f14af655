//! Token providers

use std::error;

use async_trait::async_trait;

use crate::{key::ProviderIdentity, key::RequestOptions, TokenWithExpiry};

/// A source of freshly issued access tokens, such as an OAuth2 token endpoint
///
/// The provider's [`ProviderIdentity`] decides which cache entry its tokens
/// are stored under.
#[async_trait]
pub trait TokenProvider: ProviderIdentity + Send + Sync {
    /// The error type returned in the event that retrieving a token fails
    type Error: error::Error + Send + Sync + 'static;

    /// Requests a new token from the provider
    async fn request_token(&self, options: &RequestOptions) -> Result<TokenWithExpiry, Self::Error>;
}
