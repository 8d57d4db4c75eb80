//! Error types shared by the exchange, resilience and trading layers.

use std::time::Duration;

use thiserror::Error;

use crate::resilience::Priority;

/// Failure of a call that reaches (or tries to reach) the exchange.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("exchange returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("invalid exchange response: {0}")]
    InvalidResponse(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("order rejected: {0}")]
    Rejected(String),

    #[error("circuit breaker open for {service}")]
    CircuitOpen { service: String },

    #[error("timed out waiting for rate slot ({priority:?} after {waited:?})")]
    RateSlotTimeout { priority: Priority, waited: Duration },

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("rate limiter stopped")]
    LimiterStopped,
}

impl ExchangeError {
    /// Whether this error says something about the health of the remote service.
    ///
    /// Local queueing, open circuits and business rejections are not counted
    /// against a circuit breaker.
    pub fn is_service_failure(&self) -> bool {
        match self {
            ExchangeError::Http(_)
            | ExchangeError::InvalidResponse(_)
            | ExchangeError::Timeout { .. } => true,
            ExchangeError::Api { status, .. } => *status >= 500 || *status == 429,
            ExchangeError::Auth(_)
            | ExchangeError::Rejected(_)
            | ExchangeError::CircuitOpen { .. }
            | ExchangeError::RateSlotTimeout { .. }
            | ExchangeError::LimiterStopped => false,
        }
    }

    /// Short machine-friendly label used in failure records.
    pub fn kind(&self) -> &'static str {
        match self {
            ExchangeError::Http(_) => "http",
            ExchangeError::Api { .. } => "api",
            ExchangeError::InvalidResponse(_) => "invalid_response",
            ExchangeError::Auth(_) => "auth",
            ExchangeError::Rejected(_) => "rejected",
            ExchangeError::CircuitOpen { .. } => "circuit_open",
            ExchangeError::RateSlotTimeout { .. } => "rate_slot_timeout",
            ExchangeError::Timeout { .. } => "timeout",
            ExchangeError::LimiterStopped => "limiter_stopped",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_failure_classification() {
        assert!(ExchangeError::Api { status: 503, body: String::new() }.is_service_failure());
        assert!(ExchangeError::Api { status: 429, body: String::new() }.is_service_failure());
        assert!(!ExchangeError::Api { status: 400, body: String::new() }.is_service_failure());
        assert!(!ExchangeError::RateSlotTimeout {
            priority: Priority::SignalAnalysis,
            waited: Duration::from_secs(20),
        }
        .is_service_failure());
        assert!(!ExchangeError::CircuitOpen { service: "x".into() }.is_service_failure());
    }
}
