//! Per-service circuit breakers, failure history and retry with backoff.
//!
//! State machine per service:
//! - `Closed`: calls pass; `failure_threshold` consecutive failures open the circuit
//! - `Open`: calls are rejected until `recovery_timeout` has passed since the last failure
//! - `HalfOpen`: one trial call at a time; `success_threshold` successes close the
//!   circuit, any failure reopens it with a fresh window. A trial that never
//!   reports back (its caller was cancelled) frees the slot when dropped, and
//!   at the latest after `recovery_timeout`

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::alerts::{Alert, AlertDispatcher, AlertLevel};
use crate::error::ExchangeError;

/// Exchange REST API.
pub const EXCHANGE_API: &str = "exchange_api";
/// Engine loops (signal scan and position monitoring).
pub const TRADING_ENGINE: &str = "trading_engine";
pub const SIGNAL_ANALYZER: &str = "signal_analyzer";
pub const ORDER_VERIFIER: &str = "order_verifier";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub success_threshold: u32,
}

impl CircuitBreakerConfig {
    pub fn new(failure_threshold: u32, recovery_secs: u64, success_threshold: u32) -> Self {
        Self {
            failure_threshold,
            recovery_timeout: Duration::from_secs(recovery_secs),
            success_threshold,
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::new(5, 60, 3)
    }
}

/// Breaker for one service.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_at: Option<Instant>,
    next_attempt_at: Option<Instant>,
    /// Start of the HalfOpen trial currently holding the slot
    trial_started: Option<Instant>,
    total_calls: u64,
    total_failures: u64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_at: None,
            next_attempt_at: None,
            trial_started: None,
            total_calls: 0,
            total_failures: 0,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn last_failure_at(&self) -> Option<Instant> {
        self.last_failure_at
    }

    /// True while calls are being rejected outright.
    pub fn is_open_at(&self, now: Instant) -> bool {
        self.state == CircuitState::Open && self.next_attempt_at.is_some_and(|t| now < t)
    }

    /// Admission check. Moves `Open` to `HalfOpen` once the recovery window has passed.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if self.next_attempt_at.is_some_and(|t| now >= t) {
                    self.state = CircuitState::HalfOpen;
                    self.success_count = 0;
                    self.trial_started = Some(now);
                    info!(service = %self.name, "Circuit half-open, allowing trial call");
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => match self.trial_started {
                Some(started) if now < started + self.config.recovery_timeout => false,
                Some(_) => {
                    warn!(service = %self.name, "Trial call never reported back, admitting a new one");
                    self.trial_started = Some(now);
                    true
                }
                None => {
                    self.trial_started = Some(now);
                    true
                }
            },
        }
    }

    /// Give back an acquired slot without an outcome (e.g. a business rejection).
    pub fn release(&mut self) {
        self.trial_started = None;
    }

    /// Returns the new state when this success caused a transition.
    pub fn on_success(&mut self) -> Option<CircuitState> {
        self.total_calls += 1;
        self.trial_started = None;
        match self.state {
            CircuitState::HalfOpen => {
                self.success_count += 1;
                if self.success_count >= self.config.success_threshold {
                    self.state = CircuitState::Closed;
                    self.failure_count = 0;
                    self.success_count = 0;
                    self.next_attempt_at = None;
                    info!(service = %self.name, "Circuit closed, service recovered");
                    return Some(CircuitState::Closed);
                }
                None
            }
            CircuitState::Closed => {
                self.failure_count = 0;
                None
            }
            CircuitState::Open => None,
        }
    }

    /// Returns the new state when this failure caused a transition.
    pub fn on_failure(&mut self, now: Instant) -> Option<CircuitState> {
        self.total_calls += 1;
        self.total_failures += 1;
        self.trial_started = None;
        self.failure_count += 1;
        self.last_failure_at = Some(now);

        match self.state {
            CircuitState::HalfOpen => {
                self.open(now);
                Some(CircuitState::Open)
            }
            CircuitState::Closed if self.failure_count >= self.config.failure_threshold => {
                self.open(now);
                Some(CircuitState::Open)
            }
            _ => None,
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.success_count = 0;
        self.next_attempt_at = Some(now + self.config.recovery_timeout);
        warn!(
            service = %self.name,
            failures = self.failure_count,
            retry_in = ?self.config.recovery_timeout,
            "Circuit opened"
        );
    }

    pub fn snapshot(&self, now: Instant) -> CircuitSnapshot {
        CircuitSnapshot {
            service: self.name.clone(),
            state: self.state,
            failure_count: self.failure_count,
            success_count: self.success_count,
            failure_threshold: self.config.failure_threshold,
            success_threshold: self.config.success_threshold,
            total_calls: self.total_calls,
            total_failures: self.total_failures,
            retry_in_secs: self
                .next_attempt_at
                .filter(|_| self.state == CircuitState::Open)
                .map(|t| t.saturating_duration_since(now).as_secs()),
        }
    }
}

/// Serializable view of one breaker.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub service: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub total_calls: u64,
    pub total_failures: u64,
    pub retry_in_secs: Option<u64>,
}

/// One recorded failure.
#[derive(Debug, Clone, Serialize)]
pub struct FailureRecord {
    pub timestamp: DateTime<Utc>,
    pub service: String,
    pub error_kind: String,
    pub message: String,
    pub retry_count: u32,
}

/// Aggregated failure history over a window.
#[derive(Debug, Clone, Serialize)]
pub struct FailureStatistics {
    pub window_hours: i64,
    pub total_failures: usize,
    pub by_service: HashMap<String, usize>,
    /// Most frequent error kinds, descending
    pub top_error_kinds: Vec<(String, usize)>,
    /// Failures per hour bucket (`YYYY-MM-DD HH:00`)
    pub hourly: BTreeMap<String, usize>,
}

/// Retry schedule for [`CircuitBreakerRegistry::retry_with_backoff`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delays of `min(base * 2^n, max)`, without jitter.
    fn schedule(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.base_delay,
            initial_interval: self.base_delay,
            randomization_factor: 0.0,
            multiplier: 2.0,
            max_interval: self.max_delay,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        }
    }
}

/// Slot granted by [`CircuitBreakerRegistry::acquire`].
///
/// Dropped before an outcome is recorded, it hands the HalfOpen trial slot back.
struct Admission<'a> {
    registry: &'a CircuitBreakerRegistry,
    service: &'a str,
    settled: bool,
}

impl Admission<'_> {
    fn settle(mut self) {
        self.settled = true;
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        match self.registry.breakers.try_write() {
            Ok(mut breakers) => {
                if let Some(breaker) = breakers.get_mut(self.service) {
                    breaker.release();
                }
                debug!(service = %self.service, "Cancelled call released its breaker slot");
            }
            // Contended: the trial lease expires after the recovery timeout
            Err(_) => debug!(service = %self.service, "Cancelled call left its slot to expire"),
        }
    }
}

/// Registry of breakers keyed by service name, plus the shared failure log.
pub struct CircuitBreakerRegistry {
    breakers: RwLock<HashMap<String, CircuitBreaker>>,
    failures: RwLock<VecDeque<FailureRecord>>,
    alerts: Option<Arc<AlertDispatcher>>,
    max_history: usize,
}

impl CircuitBreakerRegistry {
    pub fn new(alerts: Option<Arc<AlertDispatcher>>) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            failures: RwLock::new(VecDeque::new()),
            alerts,
            max_history: 1000,
        }
    }

    /// Registry with the standard services registered.
    pub async fn with_default_services(alerts: Option<Arc<AlertDispatcher>>) -> Self {
        let registry = Self::new(alerts);
        registry.register(EXCHANGE_API, CircuitBreakerConfig::new(5, 60, 3)).await;
        registry.register(TRADING_ENGINE, CircuitBreakerConfig::new(3, 120, 2)).await;
        registry.register(SIGNAL_ANALYZER, CircuitBreakerConfig::new(5, 60, 3)).await;
        registry.register(ORDER_VERIFIER, CircuitBreakerConfig::new(3, 90, 2)).await;
        registry
    }

    pub async fn register(&self, service: &str, config: CircuitBreakerConfig) {
        info!(
            service = %service,
            failure_threshold = config.failure_threshold,
            recovery = ?config.recovery_timeout,
            "Registered circuit breaker"
        );
        self.breakers
            .write()
            .await
            .insert(service.to_string(), CircuitBreaker::new(service, config));
    }

    pub async fn state(&self, service: &str) -> Option<CircuitState> {
        self.breakers.read().await.get(service).map(|b| b.state())
    }

    pub async fn is_open(&self, service: &str) -> bool {
        let now = Instant::now();
        self.breakers
            .read()
            .await
            .get(service)
            .is_some_and(|b| b.is_open_at(now))
    }

    async fn acquire<'a>(&'a self, service: &'a str) -> Result<Admission<'a>, ExchangeError> {
        let mut breakers = self.breakers.write().await;
        if let Some(breaker) = breakers.get_mut(service) {
            if !breaker.try_acquire(Instant::now()) {
                return Err(ExchangeError::CircuitOpen {
                    service: service.to_string(),
                });
            }
        }
        Ok(Admission {
            registry: self,
            service,
            settled: false,
        })
    }

    async fn release(&self, service: &str) {
        if let Some(breaker) = self.breakers.write().await.get_mut(service) {
            breaker.release();
        }
    }

    async fn on_success(&self, service: &str) {
        let transition = self
            .breakers
            .write()
            .await
            .get_mut(service)
            .and_then(|b| b.on_success());
        if transition == Some(CircuitState::Closed) {
            self.alert(AlertLevel::Info, service, "circuit closed, service recovered")
                .await;
        }
    }

    async fn on_failure(&self, service: &str, kind: &str, message: String, retry_count: u32) {
        let transition = self
            .breakers
            .write()
            .await
            .get_mut(service)
            .and_then(|b| b.on_failure(Instant::now()));
        self.record_failure(service, kind, message.clone(), retry_count).await;

        if transition == Some(CircuitState::Open) {
            self.alert(
                AlertLevel::Critical,
                service,
                format!("circuit opened after failure: {}", message),
            )
            .await;
        }
    }

    async fn alert(&self, level: AlertLevel, service: &str, message: impl Into<String>) {
        if let Some(alerts) = &self.alerts {
            alerts.send(Alert::new(level, service, message)).await;
        }
    }

    /// Append to the failure log, trimming the oldest entries.
    pub async fn record_failure(&self, service: &str, kind: &str, message: String, retry_count: u32) {
        let mut failures = self.failures.write().await;
        failures.push_back(FailureRecord {
            timestamp: Utc::now(),
            service: service.to_string(),
            error_kind: kind.to_string(),
            message,
            retry_count,
        });
        while failures.len() > self.max_history {
            failures.pop_front();
        }
    }

    /// Run `f` under the breaker for `service`.
    ///
    /// Only [service failures](ExchangeError::is_service_failure) count against
    /// the breaker; every error is returned unchanged.
    pub async fn call<T, F, Fut>(&self, service: &str, f: F) -> Result<T, ExchangeError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ExchangeError>>,
    {
        let admission = self.acquire(service).await?;

        let result = f().await;
        match &result {
            Ok(_) => self.on_success(service).await,
            Err(e) if e.is_service_failure() => {
                self.on_failure(service, e.kind(), e.to_string(), 0).await
            }
            Err(_) => self.release(service).await,
        }
        admission.settle();
        result
    }

    /// Feed a health-ping outcome as if it were a protected call.
    ///
    /// Ignored while the circuit is open and the recovery window is still running.
    pub async fn observe(&self, service: &str, outcome: Result<(), String>) {
        let Ok(admission) = self.acquire(service).await else {
            return;
        };
        match outcome {
            Ok(()) => self.on_success(service).await,
            Err(message) => self.on_failure(service, "ping", message, 0).await,
        }
        admission.settle();
    }

    /// Retry `f` through the breaker with exponential delays.
    ///
    /// Rejections and auth errors are returned at once. When attempts run out
    /// the last error is returned and a failure record carries the attempt count.
    pub async fn retry_with_backoff<T, F, Fut>(
        &self,
        service: &str,
        policy: &RetryPolicy,
        mut f: F,
    ) -> Result<T, ExchangeError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ExchangeError>>,
    {
        let mut delays = policy.schedule();
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.call(service, &mut f).await {
                Ok(value) => return Ok(value),
                Err(e @ (ExchangeError::Rejected(_) | ExchangeError::Auth(_))) => return Err(e),
                Err(e) if attempt >= policy.max_attempts => {
                    error!(
                        service = %service,
                        attempts = attempt,
                        error = %e,
                        "All retry attempts failed"
                    );
                    self.record_failure(service, e.kind(), e.to_string(), attempt).await;
                    return Err(e);
                }
                Err(e) => {
                    let delay = delays.next_backoff().unwrap_or(policy.max_delay);
                    warn!(
                        service = %service,
                        attempt,
                        max_attempts = policy.max_attempts,
                        delay = ?delay,
                        error = %e,
                        "Call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    pub async fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let now = Instant::now();
        let mut out: Vec<_> = self
            .breakers
            .read()
            .await
            .values()
            .map(|b| b.snapshot(now))
            .collect();
        out.sort_by(|a, b| a.service.cmp(&b.service));
        out
    }

    pub async fn recent_failures(&self, limit: usize) -> Vec<FailureRecord> {
        let failures = self.failures.read().await;
        failures.iter().rev().take(limit).cloned().collect()
    }

    /// Failure statistics over the last `window_hours`.
    pub async fn failure_statistics(&self, window_hours: i64) -> FailureStatistics {
        let cutoff = Utc::now() - chrono::Duration::hours(window_hours);
        let failures = self.failures.read().await;
        let recent: Vec<&FailureRecord> =
            failures.iter().filter(|f| f.timestamp >= cutoff).collect();

        let mut by_service: HashMap<String, usize> = HashMap::new();
        let mut by_kind: HashMap<String, usize> = HashMap::new();
        let mut hourly: BTreeMap<String, usize> = BTreeMap::new();
        for f in &recent {
            *by_service.entry(f.service.clone()).or_default() += 1;
            *by_kind.entry(f.error_kind.clone()).or_default() += 1;
            *hourly
                .entry(f.timestamp.format("%Y-%m-%d %H:00").to_string())
                .or_default() += 1;
        }

        let mut top_error_kinds: Vec<(String, usize)> = by_kind.into_iter().collect();
        top_error_kinds.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top_error_kinds.truncate(5);

        FailureStatistics {
            window_hours,
            total_failures: recent.len(),
            by_service,
            top_error_kinds,
            hourly,
        }
    }

    /// Force every breaker back to `Closed`.
    pub async fn reset_all(&self) {
        let mut breakers = self.breakers.write().await;
        for (name, breaker) in breakers.iter_mut() {
            *breaker = CircuitBreaker::new(name.clone(), breaker.config.clone());
        }
        info!("All circuit breakers reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn server_error() -> ExchangeError {
        ExchangeError::Api {
            status: 503,
            body: "unavailable".into(),
        }
    }

    #[test]
    fn test_opens_after_threshold() {
        let mut breaker = CircuitBreaker::new("svc", CircuitBreakerConfig::new(3, 60, 2));
        let t0 = Instant::now();
        assert_eq!(breaker.on_failure(t0), None);
        assert_eq!(breaker.on_failure(t0), None);
        assert_eq!(breaker.on_failure(t0), Some(CircuitState::Open));
        assert!(breaker.is_open_at(t0));
        assert!(!breaker.try_acquire(t0 + Duration::from_secs(59)));
        assert!(breaker.try_acquire(t0 + Duration::from_secs(60)));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_allows_one_trial() {
        let mut breaker = CircuitBreaker::new("svc", CircuitBreakerConfig::new(1, 10, 2));
        let t0 = Instant::now();
        breaker.on_failure(t0);
        let later = t0 + Duration::from_secs(10);
        assert!(breaker.try_acquire(later));
        assert!(!breaker.try_acquire(later));
        assert_eq!(breaker.on_success(), None);
        assert!(breaker.try_acquire(later));
        assert_eq!(breaker.on_success(), Some(CircuitState::Closed));
        assert_eq!(breaker.failure_count(), 0);
    }

    #[test]
    fn test_unreported_trial_expires_after_recovery_timeout() {
        let mut breaker = CircuitBreaker::new("svc", CircuitBreakerConfig::new(1, 10, 1));
        let t0 = Instant::now();
        breaker.on_failure(t0);
        let t1 = t0 + Duration::from_secs(10);
        assert!(breaker.try_acquire(t1));
        // the trial never reports an outcome
        assert!(!breaker.try_acquire(t1 + Duration::from_secs(9)));
        assert!(breaker.try_acquire(t1 + Duration::from_secs(10)));
        assert_eq!(breaker.on_success(), Some(CircuitState::Closed));
    }

    #[test]
    fn test_half_open_failure_reopens_with_fresh_window() {
        let mut breaker = CircuitBreaker::new("svc", CircuitBreakerConfig::new(2, 30, 3));
        let t0 = Instant::now();
        breaker.on_failure(t0);
        breaker.on_failure(t0);
        let t1 = t0 + Duration::from_secs(30);
        assert!(breaker.try_acquire(t1));
        assert_eq!(breaker.on_failure(t1), Some(CircuitState::Open));
        assert!(breaker.is_open_at(t1 + Duration::from_secs(29)));
        assert!(!breaker.is_open_at(t1 + Duration::from_secs(30)));
    }

    #[test]
    fn test_open_iff_threshold_reached_within_window() {
        let threshold = 3;
        let recovery = Duration::from_secs(20);
        let mut breaker = CircuitBreaker::new(
            "svc",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                recovery_timeout: recovery,
                success_threshold: 2,
            },
        );

        let start = Instant::now();
        let mut now = start;
        let mut seed: u64 = 0x9e37_79b9_7f4a_7c15;
        for _ in 0..2000 {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            now += Duration::from_secs((seed >> 60) as u64 + 1);
            let fail = (seed >> 33) % 3 != 0;

            if breaker.try_acquire(now) {
                if fail {
                    breaker.on_failure(now);
                } else {
                    breaker.on_success();
                }
            }

            let expected = breaker.failure_count() >= threshold
                && breaker
                    .last_failure_at()
                    .is_some_and(|last| now < last + recovery);
            assert_eq!(breaker.is_open_at(now), expected);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_trial_call_frees_the_slot() {
        let registry = CircuitBreakerRegistry::new(None);
        registry.register("api", CircuitBreakerConfig::new(1, 10, 1)).await;

        let result: Result<(), _> = registry.call("api", || async { Err(server_error()) }).await;
        assert!(result.is_err());
        assert!(registry.is_open("api").await);

        tokio::time::advance(Duration::from_secs(11)).await;
        let slow_trial = tokio::time::timeout(
            Duration::from_secs(5),
            registry.call("api", || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, ExchangeError>(())
            }),
        )
        .await;
        assert!(slow_trial.is_err());
        assert_eq!(registry.state("api").await, Some(CircuitState::HalfOpen));

        let result = registry.call("api", || async { Ok::<_, ExchangeError>(()) }).await;
        assert!(result.is_ok());
        assert_eq!(registry.state("api").await, Some(CircuitState::Closed));
    }

    #[tokio::test]
    async fn test_registry_rejects_while_open() {
        let registry = CircuitBreakerRegistry::new(None);
        registry.register("api", CircuitBreakerConfig::new(2, 60, 1)).await;

        for _ in 0..2 {
            let result: Result<(), _> = registry.call("api", || async { Err(server_error()) }).await;
            assert!(result.is_err());
        }
        assert!(registry.is_open("api").await);

        let called = AtomicU32::new(0);
        let result = registry
            .call("api", || async {
                called.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(ExchangeError::CircuitOpen { .. })));
        assert_eq!(called.load(Ordering::SeqCst), 0);
        assert_eq!(registry.recent_failures(10).await.len(), 2);

        registry.reset_all().await;
        assert!(!registry.is_open("api").await);
    }

    #[tokio::test]
    async fn test_business_errors_do_not_trip() {
        let registry = CircuitBreakerRegistry::new(None);
        registry.register("api", CircuitBreakerConfig::new(1, 60, 1)).await;

        let result: Result<(), _> = registry
            .call("api", || async { Err(ExchangeError::Rejected("min order".into())) })
            .await;
        assert!(result.is_err());
        assert_eq!(registry.state("api").await, Some(CircuitState::Closed));
        assert!(registry.recent_failures(10).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_with_backoff_delays_and_exhaustion() {
        let registry = CircuitBreakerRegistry::new(None);
        registry.register("api", CircuitBreakerConfig::new(10, 60, 1)).await;
        let policy = RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(3),
        };

        let attempts = AtomicU32::new(0);
        let start = Instant::now();
        let result: Result<(), _> = registry
            .retry_with_backoff("api", &policy, || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(server_error()) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        // 1s + 2s + 3s (capped)
        let waited = Instant::now() - start;
        assert!(waited >= Duration::from_secs(6) && waited < Duration::from_secs(7));

        let failures = registry.recent_failures(10).await;
        assert_eq!(failures[0].retry_count, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_transient_failure() {
        let registry = CircuitBreakerRegistry::new(None);
        let attempts = AtomicU32::new(0);
        let value = registry
            .retry_with_backoff("unregistered", &RetryPolicy::default(), || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(server_error())
                    } else {
                        Ok(42)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failure_statistics() {
        let registry = CircuitBreakerRegistry::new(None);
        registry.record_failure("a", "timeout", "t1".into(), 0).await;
        registry.record_failure("a", "timeout", "t2".into(), 0).await;
        registry.record_failure("b", "http", "h1".into(), 0).await;

        let stats = registry.failure_statistics(24).await;
        assert_eq!(stats.total_failures, 3);
        assert_eq!(stats.by_service["a"], 2);
        assert_eq!(stats.top_error_kinds[0], ("timeout".to_string(), 2));
        assert_eq!(stats.hourly.values().sum::<usize>(), 3);
    }

    #[tokio::test]
    async fn test_ping_outcomes_feed_breaker() {
        let registry = CircuitBreakerRegistry::new(None);
        registry.register("api", CircuitBreakerConfig::new(2, 60, 1)).await;
        registry.observe("api", Err("down".into())).await;
        registry.observe("api", Err("down".into())).await;
        assert_eq!(registry.state("api").await, Some(CircuitState::Open));
    }
}
