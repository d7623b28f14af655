use serde::{Deserialize, Serialize};
use token_cache_clock::{Clock, DurationSecs, UnixTime};

use super::{AccessToken, AccessTokenRef};

/// An access token as issued by a provider, with the instant it stops being valid
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenWithExpiry {
    access_token: AccessToken,
    expiry: UnixTime,
}

impl TokenWithExpiry {
    /// Constructs a token that expires at the given instant
    pub fn new(access_token: impl Into<AccessToken>, expiry: UnixTime) -> Self {
        Self {
            access_token: access_token.into(),
            expiry,
        }
    }

    /// Constructs a token that expires `valid_for` after the time reported by `clock`
    ///
    /// Providers usually report `expires_in` rather than an absolute instant.
    pub fn expiring_in<C: Clock>(
        access_token: impl Into<AccessToken>,
        valid_for: DurationSecs,
        clock: &C,
    ) -> Self {
        Self::new(access_token, clock.now() + valid_for)
    }

    /// Gets the access token
    #[inline]
    pub fn access_token(&self) -> &AccessTokenRef {
        &self.access_token
    }

    /// Gets the time that the token will expire
    #[inline]
    pub fn expiry(&self) -> UnixTime {
        self.expiry
    }

    /// Consumes the value, returning the access token
    #[inline]
    pub fn into_access_token(self) -> AccessToken {
        self.access_token
    }
}

#[cfg(test)]
mod tests {
    use token_cache_clock::TestClock;

    use super::*;

    #[test]
    fn token_round_trips_through_json() {
        let token = TokenWithExpiry::new(AccessToken::from_static("abc"), UnixTime(100));

        let json = serde_json::to_string(&token).unwrap();
        assert_eq!(json, r#"{"access_token":"abc","expiry":100}"#);
        assert_eq!(serde_json::from_str::<TokenWithExpiry>(&json).unwrap(), token);
    }

    #[test]
    fn expiring_in_is_relative_to_the_clock() {
        let clock = TestClock::new(UnixTime(1_000));
        let token = TokenWithExpiry::expiring_in(
            AccessToken::from_static("abc"),
            DurationSecs(3600),
            &clock,
        );

        assert_eq!(token.expiry(), UnixTime(4_600));
        assert_eq!(token.access_token().as_str(), "abc");
    }
}
