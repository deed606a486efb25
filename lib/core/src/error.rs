//! Error handling foundation for the amber-relay platform.
//!
//! This module provides the `Result` type alias using rootcause, plus the
//! coarse error surface exposed to callers outside the execution core.
//! Each crate defines its own domain-specific error types in their own
//! error modules and wraps them in a rootcause `Report` as they propagate.

use rootcause::Report;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A Result type alias using rootcause's Report for error handling.
pub type Result<T, C = ()> = std::result::Result<T, Report<C>>;

/// What a failure looks like to a user-facing caller.
///
/// Full detail stays in the operator-facing error classification; the
/// surface only carries a status and a message that is safe to show.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSurface {
    /// The caller hit a rate or quota limit.
    RateLimited,
    /// The requested capability is not available in this deployment.
    CapabilityUnavailable,
    /// Content was rejected by a provider's policy.
    ContentRejected,
    /// Anything else.
    Internal,
}

impl ErrorSurface {
    /// HTTP status code equivalent.
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::RateLimited => 429,
            Self::CapabilityUnavailable => 501,
            Self::ContentRejected => 422,
            Self::Internal => 500,
        }
    }

    /// Message suitable for showing to an end user.
    #[must_use]
    pub const fn public_message(&self) -> &'static str {
        match self {
            Self::RateLimited => "rate limit exceeded, try again later",
            Self::CapabilityUnavailable => "this capability is not available",
            Self::ContentRejected => "content was rejected by the provider's content policy",
            Self::Internal => "an internal error occurred",
        }
    }
}

impl fmt::Display for ErrorSurface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.status_code(), self.public_message())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_type_works() {
        let ok: Result<i32> = Ok(42);
        assert_eq!(ok.expect("should be ok"), 42);
    }

    #[test]
    fn surface_status_codes() {
        assert_eq!(ErrorSurface::RateLimited.status_code(), 429);
        assert_eq!(ErrorSurface::CapabilityUnavailable.status_code(), 501);
        assert_eq!(ErrorSurface::ContentRejected.status_code(), 422);
        assert_eq!(ErrorSurface::Internal.status_code(), 500);
    }

    #[test]
    fn internal_surface_leaks_nothing() {
        let shown = ErrorSurface::Internal.to_string();
        assert_eq!(shown, "500 an internal error occurred");
    }
}
