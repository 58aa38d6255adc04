//! Munin error types

use std::time::Duration;

/// Munin error types
#[derive(Debug, thiserror::Error)]
pub enum MuninError {
    // Upstream/network errors
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("upstream timed out after {0:?}")]
    Timeout(Duration),

    /// Response arrived but its payload is not usable (wrong shape,
    /// out-of-range values). Counts as an upstream failure for circuit
    /// breaker accounting.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("empty response from provider")]
    EmptyResponse,

    // Short-circuit
    /// The provider's circuit is open; no upstream call was attempted.
    #[error("circuit open for provider '{provider}'")]
    CircuitOpen { provider: String },

    // Data errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Caller errors
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unknown provider '{0}'")]
    UnknownProvider(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    // Terminal fallback failure
    /// Every fallback tier came up empty: no fresh entry, no stale copy,
    /// no golden snapshot, no synthetic generator. The only upstream-
    /// related error that reaches a caller.
    #[error("no data available for '{key}': all fallback tiers exhausted")]
    FallbackExhausted { key: String },
}

impl MuninError {
    /// Whether this error counts as an upstream failure for circuit
    /// breaker accounting.
    ///
    /// Network errors, timeouts, non-2xx statuses, rate-limit responses,
    /// and semantically invalid/empty payloads all count. Caller errors
    /// and short-circuits do not.
    pub fn is_upstream_failure(&self) -> bool {
        matches!(
            self,
            MuninError::Http(_)
                | MuninError::Api { .. }
                | MuninError::RateLimited { .. }
                | MuninError::Timeout(_)
                | MuninError::InvalidPayload(_)
                | MuninError::EmptyResponse
        )
    }

    /// Whether this error is a rate-limit signal (429-class), which feeds
    /// the limiter's adaptive backoff in addition to breaker accounting.
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, MuninError::RateLimited { .. })
    }

    /// Extract the upstream `Retry-After` hint, if the error carries one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            MuninError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Result type alias for Munin operations
pub type Result<T> = std::result::Result<T, MuninError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_failure_classification() {
        assert!(MuninError::Http("reset".into()).is_upstream_failure());
        assert!(
            MuninError::Api {
                status: 503,
                message: "unavailable".into()
            }
            .is_upstream_failure()
        );
        assert!(MuninError::Timeout(Duration::from_secs(10)).is_upstream_failure());
        assert!(MuninError::InvalidPayload("not a price".into()).is_upstream_failure());
        assert!(MuninError::EmptyResponse.is_upstream_failure());

        assert!(!MuninError::InvalidInput("empty key".into()).is_upstream_failure());
        assert!(
            !MuninError::CircuitOpen {
                provider: "coingecko".into()
            }
            .is_upstream_failure()
        );
        assert!(
            !MuninError::FallbackExhausted {
                key: "btc:price".into()
            }
            .is_upstream_failure()
        );
    }

    #[test]
    fn retry_after_only_on_rate_limits() {
        let hint = Duration::from_secs(30);
        let err = MuninError::RateLimited {
            retry_after: Some(hint),
        };
        assert!(err.is_rate_limit());
        assert_eq!(err.retry_after(), Some(hint));
        assert_eq!(MuninError::EmptyResponse.retry_after(), None);
    }
}
