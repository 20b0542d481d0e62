//! Cross-cutting error taxonomy for pipeline failure handling.
//!
//! Queue, pool and orchestrator modules define their own error enums;
//! this module holds what they share: the failure classification that
//! drives retry/backoff decisions and the analyzer error type used by
//! the reliability layer.

use std::time::Duration;

use thiserror::Error;

/// Classification of a failure, driving how callers react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network/timeout/5xx; retried with backoff.
    Transient,
    /// 429 or limiter throttle; delayed, not counted as a failure.
    RateLimited,
    /// Malformed input or 4xx; never retried.
    Validation,
    /// Queue backpressure or memory pressure; caller must back off.
    ResourceExhaustion,
    /// Remote dependency presumed unhealthy; immediate fallback.
    CircuitOpen,
}

impl ErrorClass {
    /// Whether the failure is worth another attempt.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::Transient | ErrorClass::RateLimited)
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorClass::Transient => "transient",
            ErrorClass::RateLimited => "rate_limited",
            ErrorClass::Validation => "validation",
            ErrorClass::ResourceExhaustion => "resource_exhaustion",
            ErrorClass::CircuitOpen => "circuit_open",
        };
        write!(f, "{}", s)
    }
}

/// Errors from analyzer backends.
#[derive(Debug, Error)]
pub enum AnalyzerError {
    /// The request did not complete in time.
    #[error("analyzer request timed out")]
    Timeout,

    /// Could not reach the backend.
    #[error("analyzer connection failed: {0}")]
    Connection(String),

    /// The backend answered with an error status.
    #[error("analyzer API error ({code}): {message}")]
    Api { code: u16, message: String },

    /// The backend throttled us; retry after the given delay if known.
    #[error("analyzer rate limited")]
    RateLimited { retry_after: Option<Duration> },

    /// The backend answered but the body was not usable.
    #[error("failed to parse analyzer response: {0}")]
    InvalidResponse(String),

    /// The circuit breaker short-circuited the call.
    #[error("analyzer circuit is open")]
    CircuitOpen,

    /// The local rule-based analyzer failed.
    #[error("local analyzer failed: {0}")]
    LocalFailed(String),
}

impl AnalyzerError {
    /// Classifies the error for retry and breaker accounting.
    pub fn class(&self) -> ErrorClass {
        match self {
            AnalyzerError::Timeout | AnalyzerError::Connection(_) => ErrorClass::Transient,
            AnalyzerError::Api { code, .. } if *code >= 500 => ErrorClass::Transient,
            AnalyzerError::Api { code, .. } if *code == 429 => ErrorClass::RateLimited,
            AnalyzerError::Api { .. } => ErrorClass::Validation,
            AnalyzerError::RateLimited { .. } => ErrorClass::RateLimited,
            AnalyzerError::InvalidResponse(_) => ErrorClass::Validation,
            AnalyzerError::CircuitOpen => ErrorClass::CircuitOpen,
            AnalyzerError::LocalFailed(_) => ErrorClass::Validation,
        }
    }

    /// Whether the retry policy should attempt the call again.
    pub fn is_retryable(&self) -> bool {
        self.class().is_retryable()
    }

    /// Retry-After hint, if the backend provided one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            AnalyzerError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors_are_retryable() {
        assert!(AnalyzerError::Timeout.is_retryable());
        assert!(AnalyzerError::Connection("refused".to_string()).is_retryable());
        assert!(AnalyzerError::Api {
            code: 503,
            message: "unavailable".to_string()
        }
        .is_retryable());
    }

    #[test]
    fn test_validation_errors_are_not_retryable() {
        let err = AnalyzerError::Api {
            code: 400,
            message: "bad request".to_string(),
        };
        assert_eq!(err.class(), ErrorClass::Validation);
        assert!(!err.is_retryable());

        assert!(!AnalyzerError::InvalidResponse("truncated".to_string()).is_retryable());
    }

    #[test]
    fn test_rate_limited_classification() {
        let err = AnalyzerError::RateLimited {
            retry_after: Some(Duration::from_secs(2)),
        };
        assert_eq!(err.class(), ErrorClass::RateLimited);
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));

        let err = AnalyzerError::Api {
            code: 429,
            message: "slow down".to_string(),
        };
        assert_eq!(err.class(), ErrorClass::RateLimited);
    }

    #[test]
    fn test_circuit_open_is_not_retryable() {
        let err = AnalyzerError::CircuitOpen;
        assert_eq!(err.class(), ErrorClass::CircuitOpen);
        assert!(!err.is_retryable());
    }
}
