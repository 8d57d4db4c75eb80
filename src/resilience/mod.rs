pub mod alerts;
pub mod circuit_breaker;
pub mod health;
pub mod rate_limiter;

pub use alerts::{log_alerts, Alert, AlertCallback, AlertDispatcher, AlertLevel};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitSnapshot, CircuitState,
    FailureRecord, FailureStatistics, RetryPolicy, EXCHANGE_API, ORDER_VERIFIER, SIGNAL_ANALYZER,
    TRADING_ENGINE,
};
pub use health::{
    aggregate_status, HealthConfig, HealthMonitor, HealthReport, HealthSnapshot, HealthStatus,
    PingFn,
};
pub use rate_limiter::{ExchangeRateLimiter, Priority, RateLimiterConfig, RateLimiterStats};
