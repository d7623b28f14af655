//! Deciding when a request should be retried with a fresh token
//!
//! A `401 Unauthorized` on the first attempt is taken to mean the cached
//! token has gone stale, for example because it was revoked before its
//! declared expiry. The caller purges the cached token and tries once more.
//! Anything else, including a second `401`, is returned to the caller as-is.

use std::error;

use http::StatusCode;

/// Where a logical request is in its retry budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    /// No retry has been issued yet
    Fresh,
    /// The single retry has already been issued
    Retried,
}

impl RetryState {
    /// The state of a request on its `attempt`-th dispatch, counting from zero
    #[inline]
    pub fn for_attempt(attempt: u32) -> Self {
        if attempt < RetryDecider::MAX_RETRIES {
            Self::Fresh
        } else {
            Self::Retried
        }
    }
}

/// The outcome of a single dispatch attempt
#[derive(Debug, Clone, Copy)]
pub struct RetryContext<'a> {
    attempt: u32,
    status: Option<StatusCode>,
    error: Option<&'a (dyn error::Error + 'static)>,
}

impl<'a> RetryContext<'a> {
    /// Constructs a context from the parts of an attempt's outcome
    pub fn new(
        attempt: u32,
        status: Option<StatusCode>,
        error: Option<&'a (dyn error::Error + 'static)>,
    ) -> Self {
        Self {
            attempt,
            status,
            error,
        }
    }

    /// An attempt that received a response with the given status
    pub fn with_status(attempt: u32, status: StatusCode) -> Self {
        Self::new(attempt, Some(status), None)
    }

    /// An attempt that failed before any response was received
    pub fn with_error(attempt: u32, error: &'a (dyn error::Error + 'static)) -> Self {
        Self::new(attempt, None, Some(error))
    }

    /// The attempt number, counting from zero
    #[inline]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// The response status, if a response was received
    #[inline]
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    /// The transport error, if the request failed without a response
    #[inline]
    pub fn error(&self) -> Option<&'a (dyn error::Error + 'static)> {
        self.error
    }

    /// Where the request is in its retry budget
    #[inline]
    pub fn state(&self) -> RetryState {
        RetryState::for_attempt(self.attempt)
    }
}

/// Decides whether a request should be retried after purging its cached token
///
/// The decider holds no state; the attempt count travels in the
/// [`RetryContext`], so one decider can serve any number of concurrent
/// requests.
#[derive(Debug, Default, Clone, Copy)]
pub struct RetryDecider {
    _p: (),
}

impl RetryDecider {
    /// The number of retries allowed per logical request
    pub const MAX_RETRIES: u32 = 1;

    /// Constructs a new retry decider
    pub const fn new() -> Self {
        Self { _p: () }
    }

    /// Whether the request should be retried
    ///
    /// True only for a `401 Unauthorized` response to a request that has not
    /// been retried yet. When this returns true the caller is expected to
    /// delete the cached token before redispatching.
    pub fn should_retry(&self, ctx: &RetryContext<'_>) -> bool {
        let retry =
            ctx.state() == RetryState::Fresh && ctx.status() == Some(StatusCode::UNAUTHORIZED);

        tracing::trace!(
            attempt = ctx.attempt(),
            response.status = ctx.status().map(|s| s.as_u16()),
            has_error = ctx.error().is_some(),
            retry,
            "evaluated retry decision"
        );

        retry
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;

    fn decide(ctx: RetryContext<'_>) -> bool {
        RetryDecider::new().should_retry(&ctx)
    }

    #[test]
    fn first_unauthorized_response_is_retried() {
        assert!(decide(RetryContext::with_status(0, StatusCode::UNAUTHORIZED)));
    }

    #[test]
    fn second_unauthorized_response_is_not_retried() {
        assert!(!decide(RetryContext::with_status(1, StatusCode::UNAUTHORIZED)));
        assert!(!decide(RetryContext::with_status(7, StatusCode::UNAUTHORIZED)));
    }

    #[test]
    fn server_errors_are_not_retried() {
        assert!(!decide(RetryContext::with_status(
            0,
            StatusCode::INTERNAL_SERVER_ERROR
        )));
        assert!(!decide(RetryContext::with_status(
            0,
            StatusCode::SERVICE_UNAVAILABLE
        )));
    }

    #[test]
    fn other_client_errors_are_not_retried() {
        assert!(!decide(RetryContext::with_status(0, StatusCode::FORBIDDEN)));
        assert!(!decide(RetryContext::with_status(
            0,
            StatusCode::PROXY_AUTHENTICATION_REQUIRED
        )));
    }

    #[test]
    fn success_is_not_retried() {
        assert!(!decide(RetryContext::with_status(0, StatusCode::OK)));
    }

    #[test]
    fn transport_errors_are_not_retried() {
        let timeout = io::Error::new(io::ErrorKind::TimedOut, "timed out");

        assert!(!decide(RetryContext::with_error(0, &timeout)));
        assert!(!decide(RetryContext::new(0, None, None)));
    }

    #[test]
    fn state_tracks_the_attempt_number() {
        assert_eq!(RetryState::for_attempt(0), RetryState::Fresh);
        assert_eq!(RetryState::for_attempt(1), RetryState::Retried);
        assert_eq!(RetryState::for_attempt(u32::MAX), RetryState::Retried);
    }
}
