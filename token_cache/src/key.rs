//! Derivation of cache keys from a provider's configuration and request options
//!
//! A cache key is a function of *configuration*, not of object identity: two
//! provider values that describe the same configuration share a cache slot.
//!
//! ```
//! use token_cache::key::{derive_key, IdentityFields, ProviderIdentity, RequestOptions};
//!
//! struct Provider {
//!     token_url: String,
//!     client_id: String,
//! }
//!
//! impl ProviderIdentity for Provider {
//!     fn describe(&self, fields: &mut IdentityFields) {
//!         fields
//!             .field("token_url", self.token_url.as_str())
//!             .field("client_id", self.client_id.as_str());
//!     }
//! }
//!
//! let provider = Provider {
//!     token_url: "https://auth.example.com/oauth/token".into(),
//!     client_id: "client-a".into(),
//! };
//!
//! let options = RequestOptions::new()
//!     .with("grant_type", "client_credentials")
//!     .with("scope", "read");
//!
//! let key = derive_key(&provider, &options).unwrap();
//! assert!(key.as_str().starts_with("oauth2-token-"));
//! assert_eq!(key.as_str().len(), "oauth2-token-".len() + 32);
//! ```

use std::collections::{btree_map, BTreeMap};

use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::{CacheKey, InvalidCacheKey};

/// Prefix of every cache key
///
/// Changing this orphans every entry written under the previous prefix.
pub const CACHE_KEY_PREFIX: &str = "oauth2-token-";

/// Number of digest bytes kept in a key
const DIGEST_LEN: usize = 16;

/// A scalar value describing part of a provider configuration or token request
///
/// Integers compare by value regardless of signedness: `Int(1)` equals
/// `UInt(1)`, matching their identical canonical form.
#[derive(Clone, Debug, Serialize)]
#[serde(untagged)]
pub enum OptionValue {
    /// A string value
    Str(String),
    /// A signed integer value
    Int(i64),
    /// An unsigned integer value
    UInt(u64),
    /// A boolean value
    Bool(bool),
    /// A floating point value, which must be finite
    Float(f64),
}

impl OptionValue {
    fn is_finite(&self) -> bool {
        match self {
            Self::Float(f) => f.is_finite(),
            _ => true,
        }
    }
}

impl PartialEq for OptionValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::UInt(a), Self::UInt(b)) => a == b,
            (Self::Int(i), Self::UInt(u)) | (Self::UInt(u), Self::Int(i)) => {
                u64::try_from(*i).map_or(false, |i| i == *u)
            }
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            _ => false,
        }
    }
}

impl From<String> for OptionValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<&str> for OptionValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_owned())
    }
}

impl From<i64> for OptionValue {
    fn from(v: i64) -> Self {
        u64::try_from(v).map_or(Self::Int(v), Self::UInt)
    }
}

impl From<i32> for OptionValue {
    fn from(v: i32) -> Self {
        i64::from(v).into()
    }
}

impl From<u64> for OptionValue {
    fn from(v: u64) -> Self {
        Self::UInt(v)
    }
}

impl From<u32> for OptionValue {
    fn from(v: u32) -> Self {
        Self::UInt(v.into())
    }
}

impl From<bool> for OptionValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<f64> for OptionValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

/// Options supplied when requesting a token, such as the grant type or scope
///
/// Options are kept sorted by name, so the order in which they were inserted
/// never influences the derived key.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct RequestOptions(BTreeMap<String, OptionValue>);

impl RequestOptions {
    /// Constructs an empty set of options
    pub const fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Adds an option, returning the updated options
    pub fn with(mut self, name: impl Into<String>, value: impl Into<OptionValue>) -> Self {
        self.insert(name, value);
        self
    }

    /// Sets an option, returning the previous value for that name
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        value: impl Into<OptionValue>,
    ) -> Option<OptionValue> {
        self.0.insert(name.into(), value.into())
    }

    /// Gets the value of an option
    pub fn get(&self, name: &str) -> Option<&OptionValue> {
        self.0.get(name)
    }

    /// Iterates over the options in name order
    pub fn iter(&self) -> btree_map::Iter<'_, String, OptionValue> {
        self.0.iter()
    }

    /// The number of options
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no options
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn check_finite(&self) -> Result<(), KeyError> {
        match self.0.iter().find(|(_, v)| !v.is_finite()) {
            Some((name, _)) => Err(KeyError::NonFiniteValue { name: name.clone() }),
            None => Ok(()),
        }
    }
}

impl<K, V> FromIterator<(K, V)> for RequestOptions
where
    K: Into<String>,
    V: Into<OptionValue>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl<'a> IntoIterator for &'a RequestOptions {
    type Item = (&'a String, &'a OptionValue);
    type IntoIter = btree_map::Iter<'a, String, OptionValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// The configuration of an OAuth2 provider, as far as caching is concerned
///
/// Implementors list every field that affects which token the provider would
/// issue (token endpoint, client ID, audience, …) and nothing else. Internal
/// state such as connection pools or in-flight request bookkeeping must be
/// left out, or equal configurations stop sharing a cache entry.
pub trait ProviderIdentity {
    /// Records the fields which make up this provider's configuration
    fn describe(&self, fields: &mut IdentityFields);
}

impl<T: ProviderIdentity + ?Sized> ProviderIdentity for &T {
    fn describe(&self, fields: &mut IdentityFields) {
        (**self).describe(fields)
    }
}

impl<T: ProviderIdentity + ?Sized> ProviderIdentity for std::sync::Arc<T> {
    fn describe(&self, fields: &mut IdentityFields) {
        (**self).describe(fields)
    }
}

/// Collects the fields of a [`ProviderIdentity`]
///
/// Problems such as a repeated field name are remembered and reported once
/// key derivation finishes, so `describe` can stay infallible.
#[derive(Debug, Default)]
pub struct IdentityFields {
    fields: BTreeMap<String, OptionValue>,
    error: Option<KeyError>,
}

impl IdentityFields {
    /// Records a single configuration field
    pub fn field(&mut self, name: impl Into<String>, value: impl Into<OptionValue>) -> &mut Self {
        let name = name.into();
        let value = value.into();

        if self.error.is_none() {
            if !value.is_finite() {
                self.error = Some(KeyError::NonFiniteValue { name });
                return self;
            }

            match self.fields.entry(name) {
                btree_map::Entry::Vacant(e) => {
                    e.insert(value);
                }
                btree_map::Entry::Occupied(e) => {
                    self.error = Some(KeyError::DuplicateField {
                        name: e.key().clone(),
                    });
                }
            }
        }

        self
    }

    /// Records a field only when a value is present
    pub fn optional_field<V: Into<OptionValue>>(
        &mut self,
        name: impl Into<String>,
        value: Option<V>,
    ) -> &mut Self {
        match value {
            Some(v) => self.field(name, v),
            None => self,
        }
    }

    fn finish(self) -> Result<BTreeMap<String, OptionValue>, KeyError> {
        if let Some(error) = self.error {
            return Err(error);
        }

        if self.fields.is_empty() {
            return Err(KeyError::EmptyIdentity);
        }

        Ok(self.fields)
    }
}

/// An error deriving a cache key
#[derive(Debug, Error)]
pub enum KeyError {
    /// The provider did not describe any configuration
    #[error("provider identity has no fields")]
    EmptyIdentity,
    /// The provider described the same field more than once
    #[error("provider identity field `{name}` was described more than once")]
    DuplicateField {
        /// The repeated field
        name: String,
    },
    /// A float value was NaN or infinite
    #[error("value for `{name}` is not a finite number")]
    NonFiniteValue {
        /// The offending field or option
        name: String,
    },
    /// The canonical form could not be serialized
    #[error("unable to serialize canonical key material")]
    Serialization(#[from] serde_json::Error),
    /// The derived key was not a valid cache key
    #[error("derived cache key is invalid")]
    InvalidKey(#[from] InvalidCacheKey),
}

#[derive(Serialize)]
struct KeyMaterial<'a> {
    provider: &'a BTreeMap<String, OptionValue>,
    options: &'a RequestOptions,
}

/// Derives the cache key for a provider configuration and set of request options
///
/// The key is [`CACHE_KEY_PREFIX`] followed by the lowercase hex rendering of
/// the first 128 bits of a SHA-256 digest over a canonical JSON document
/// containing the provider's fields and the options, both sorted by name.
pub fn derive_key<P>(provider: &P, options: &RequestOptions) -> Result<CacheKey, KeyError>
where
    P: ProviderIdentity + ?Sized,
{
    let mut fields = IdentityFields::default();
    provider.describe(&mut fields);
    let fields = fields.finish()?;

    options.check_finite()?;

    let material = serde_json::to_vec(&KeyMaterial {
        provider: &fields,
        options,
    })?;

    let digest = Sha256::digest(&material);

    let mut key = String::with_capacity(CACHE_KEY_PREFIX.len() + DIGEST_LEN * 2);
    key.push_str(CACHE_KEY_PREFIX);
    key.push_str(&hex::encode(&digest[..DIGEST_LEN]));

    tracing::trace!(cache.key = %key, options = options.len(), "derived cache key");

    Ok(CacheKey::new(key)?)
}
