use aliri_braid::braid;
use std::{convert::Infallible, fmt};
use thiserror::Error;

macro_rules! limited_reveal {
    ($ty:ty: $hidden:literal, $default:literal) => {
        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                if f.alternate() {
                    f.write_str("\"")?;
                    limited_reveal(&self.0, &mut *f, $default)?;
                    f.write_str("\"")
                } else {
                    f.write_str(concat!("***", $hidden, "***"))
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                if f.alternate() {
                    limited_reveal(&self.0, &mut *f, usize::MAX)
                } else {
                    f.write_str(concat!("***", $hidden, "***"))
                }
            }
        }
    };
}

fn limited_reveal(unprotected: &str, f: &mut fmt::Formatter, default_len: usize) -> fmt::Result {
    let max_len = f.width().unwrap_or(default_len);
    if max_len <= 1 {
        f.write_str("…")
    } else if max_len > unprotected.len() {
        f.write_str(unprotected)
    } else {
        match unprotected.char_indices().nth(max_len - 2) {
            Some((idx, c)) if idx + c.len_utf8() < unprotected.len() => {
                f.write_str(&unprotected[0..idx + c.len_utf8()])?;
                f.write_str("…")
            }
            _ => f.write_str(unprotected),
        }
    }
}

/// An access token
#[braid(serde, debug = "owned", display = "owned")]
pub struct AccessToken;

limited_reveal!(AccessTokenRef: "ACCESS TOKEN", 15);

/// Longest cache key accepted, in bytes
pub const MAX_CACHE_KEY_LEN: usize = 128;

/// An identifier for a cached token in a cache backend
///
/// Keys are restricted to lowercase ASCII letters, digits, `-` and `_` so that
/// they can be handed to any backend as-is, including as a file name.
#[braid(serde, validator)]
pub struct CacheKey;

/// The reason a string was rejected as a cache key
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum InvalidCacheKey {
    /// The key was empty
    #[error("cache key is empty")]
    Empty,
    /// The key was longer than [`MAX_CACHE_KEY_LEN`]
    #[error("cache key is {0} bytes long, the limit is {limit}", limit = MAX_CACHE_KEY_LEN)]
    TooLong(usize),
    /// The key contained a disallowed byte
    #[error("cache key contains disallowed byte 0x{byte:02x} at position {position}")]
    InvalidByte {
        /// The offending byte
        byte: u8,
        /// Where in the key it was found
        position: usize,
    },
}

impl From<Infallible> for InvalidCacheKey {
    #[inline(always)]
    fn from(x: Infallible) -> Self {
        match x {}
    }
}

impl aliri_braid::Validator for CacheKey {
    type Error = InvalidCacheKey;

    fn validate(raw: &str) -> Result<(), Self::Error> {
        if raw.is_empty() {
            return Err(InvalidCacheKey::Empty);
        }

        if raw.len() > MAX_CACHE_KEY_LEN {
            return Err(InvalidCacheKey::TooLong(raw.len()));
        }

        match raw
            .bytes()
            .enumerate()
            .find(|(_, b)| !matches!(b, b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_'))
        {
            Some((position, byte)) => Err(InvalidCacheKey::InvalidByte { byte, position }),
            None => Ok(()),
        }
    }
}
