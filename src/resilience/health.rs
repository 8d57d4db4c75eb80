//! Periodic liveness pings per service and the aggregated system status.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::alerts::{Alert, AlertDispatcher, AlertLevel};
use super::circuit_breaker::CircuitBreakerRegistry;

/// Service health, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
    Offline,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HealthStatus::Healthy => "HEALTHY",
            HealthStatus::Degraded => "DEGRADED",
            HealthStatus::Critical => "CRITICAL",
            HealthStatus::Offline => "OFFLINE",
        };
        write!(f, "{}", s)
    }
}

impl HealthStatus {
    /// Status after `failures` consecutive ping failures.
    pub fn after_failures(failures: u32) -> Self {
        match failures {
            0 => HealthStatus::Healthy,
            1..=2 => HealthStatus::Degraded,
            3..=4 => HealthStatus::Critical,
            _ => HealthStatus::Offline,
        }
    }

    fn needs_alert(&self) -> bool {
        matches!(self, HealthStatus::Critical | HealthStatus::Offline)
    }
}

/// Aggregate system status from per-service statuses.
///
/// Any offline service makes the system offline. Otherwise more than 30%
/// critical services is critical, and more than 50% degraded-or-critical is
/// degraded.
pub fn aggregate_status(statuses: &[HealthStatus]) -> HealthStatus {
    if statuses.is_empty() {
        return HealthStatus::Healthy;
    }
    if statuses.contains(&HealthStatus::Offline) {
        return HealthStatus::Offline;
    }

    let total = statuses.len() as f64;
    let critical = statuses.iter().filter(|s| **s == HealthStatus::Critical).count() as f64;
    let degraded = statuses
        .iter()
        .filter(|s| matches!(s, HealthStatus::Degraded | HealthStatus::Critical))
        .count() as f64;

    if critical / total > 0.3 {
        HealthStatus::Critical
    } else if degraded / total > 0.5 {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

/// Ping returning `Ok` when the service answers.
pub type PingFn = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    /// Successful pings slower than this report degraded
    pub degraded_latency: Duration,
    pub system_interval: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            ping_timeout: Duration::from_secs(10),
            degraded_latency: Duration::from_secs(5),
            system_interval: Duration::from_secs(10),
        }
    }
}

struct HealthCheck {
    ping: PingFn,
    interval: Duration,
    timeout: Duration,
    status: HealthStatus,
    consecutive_failures: u32,
    last_check: Option<DateTime<Utc>>,
    last_success: Option<DateTime<Utc>>,
    last_latency: Option<Duration>,
    last_error: Option<String>,
}

/// Serializable view of one check.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub service: String,
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    pub last_check: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_latency_ms: Option<u128>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub system_status: HealthStatus,
    pub services: Vec<HealthSnapshot>,
    pub generated_at: DateTime<Utc>,
}

/// Runs pings on their own schedules and keeps the system status current.
pub struct HealthMonitor {
    config: HealthConfig,
    checks: RwLock<HashMap<String, HealthCheck>>,
    system_status: RwLock<HealthStatus>,
    breakers: Option<Arc<CircuitBreakerRegistry>>,
    alerts: Arc<AlertDispatcher>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl HealthMonitor {
    pub fn new(
        config: HealthConfig,
        alerts: Arc<AlertDispatcher>,
        breakers: Option<Arc<CircuitBreakerRegistry>>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            checks: RwLock::new(HashMap::new()),
            system_status: RwLock::new(HealthStatus::Healthy),
            breakers,
            alerts,
            tasks: Mutex::new(Vec::new()),
            shutdown,
        }
    }

    /// Register a ping with the default interval and timeout.
    pub async fn register(&self, service: &str, ping: PingFn) {
        let (interval, timeout) = (self.config.ping_interval, self.config.ping_timeout);
        self.register_with(service, ping, interval, timeout).await;
    }

    pub async fn register_with(
        &self,
        service: &str,
        ping: PingFn,
        interval: Duration,
        timeout: Duration,
    ) {
        self.checks.write().await.insert(
            service.to_string(),
            HealthCheck {
                ping,
                interval,
                timeout,
                status: HealthStatus::Healthy,
                consecutive_failures: 0,
                last_check: None,
                last_success: None,
                last_latency: None,
                last_error: None,
            },
        );
        info!(service = %service, interval = ?interval, "Registered health check");
    }

    /// Run one ping for `service` and record the outcome.
    pub async fn check(&self, service: &str) -> Option<HealthStatus> {
        let (ping, limit) = {
            let checks = self.checks.read().await;
            let check = checks.get(service)?;
            (check.ping.clone(), check.timeout)
        };

        let started = Instant::now();
        let outcome = match timeout(limit, ping()).await {
            Ok(Ok(())) => Ok(started.elapsed()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("ping timed out after {:?}", limit)),
        };

        let (previous, current) = {
            let mut checks = self.checks.write().await;
            let check = checks.get_mut(service)?;
            let previous = check.status;
            let now = Utc::now();
            check.last_check = Some(now);

            match &outcome {
                Ok(latency) => {
                    check.consecutive_failures = 0;
                    check.last_success = Some(now);
                    check.last_latency = Some(*latency);
                    check.last_error = None;
                    check.status = if *latency > self.config.degraded_latency {
                        HealthStatus::Degraded
                    } else {
                        HealthStatus::Healthy
                    };
                }
                Err(message) => {
                    check.consecutive_failures += 1;
                    check.last_error = Some(message.clone());
                    check.status = HealthStatus::after_failures(check.consecutive_failures);
                }
            }
            (previous, check.status)
        };

        if let Some(breakers) = &self.breakers {
            breakers
                .observe(service, outcome.as_ref().map(|_| ()).map_err(|e| e.clone()))
                .await;
        }

        if current != previous {
            match &outcome {
                Ok(_) => info!(service = %service, from = %previous, to = %current, "Health status changed"),
                Err(e) => warn!(service = %service, from = %previous, to = %current, error = %e, "Health status changed"),
            }
            if current.needs_alert() {
                let message = format!(
                    "{} is {}: {}",
                    service,
                    current,
                    outcome.as_ref().err().map(String::as_str).unwrap_or("slow")
                );
                let level = AlertLevel::Critical;
                self.alerts.send(Alert::new(level, service, message)).await;
            }
        }

        Some(current)
    }

    /// Recompute the system status, alerting on transitions into critical or offline.
    pub async fn update_system_status(&self) -> HealthStatus {
        let statuses: Vec<HealthStatus> =
            self.checks.read().await.values().map(|c| c.status).collect();
        let status = aggregate_status(&statuses);

        let previous = {
            let mut current = self.system_status.write().await;
            std::mem::replace(&mut *current, status)
        };

        if status != previous {
            warn!(from = %previous, to = %status, "System health changed");
            if status.needs_alert() {
                self.alerts
                    .send(Alert::new(
                        AlertLevel::Critical,
                        "system",
                        format!("system status {}", status),
                    ))
                    .await;
            }
        }
        status
    }

    pub async fn system_status(&self) -> HealthStatus {
        *self.system_status.read().await
    }

    /// Spawn one task per ping plus the system status task.
    pub async fn start(self: &Arc<Self>) {
        let _ = self.shutdown.send(false);
        let services: Vec<(String, Duration)> = self
            .checks
            .read()
            .await
            .iter()
            .map(|(name, c)| (name.clone(), c.interval))
            .collect();

        let mut tasks = self.tasks.lock().await;
        for (service, every) in services {
            let monitor = Arc::clone(self);
            let mut stop = self.shutdown.subscribe();
            tasks.push(tokio::spawn(async move {
                let mut ticker = interval(every);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            monitor.check(&service).await;
                        }
                        _ = stop.changed() => break,
                    }
                }
                debug!(service = %service, "Health ping loop stopped");
            }));
        }

        let monitor = Arc::clone(self);
        let mut stop = self.shutdown.subscribe();
        let every = self.config.system_interval;
        tasks.push(tokio::spawn(async move {
            let mut ticker = interval(every);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        monitor.update_system_status().await;
                    }
                    _ = stop.changed() => break,
                }
            }
        }));

        info!(pings = tasks.len() - 1, "Health monitoring started");
    }

    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let mut tasks = self.tasks.lock().await;
        for handle in tasks.drain(..) {
            let mut handle = handle;
            if timeout(Duration::from_secs(5), &mut handle).await.is_err() {
                handle.abort();
            }
        }
        info!("Health monitoring stopped");
    }

    pub async fn report(&self) -> HealthReport {
        let checks = self.checks.read().await;
        let mut services: Vec<HealthSnapshot> = checks
            .iter()
            .map(|(name, c)| HealthSnapshot {
                service: name.clone(),
                status: c.status,
                consecutive_failures: c.consecutive_failures,
                last_check: c.last_check,
                last_success: c.last_success,
                last_latency_ms: c.last_latency.map(|d| d.as_millis()),
                last_error: c.last_error.clone(),
            })
            .collect();
        services.sort_by(|a, b| a.service.cmp(&b.service));

        HealthReport {
            system_status: *self.system_status.read().await,
            services,
            generated_at: Utc::now(),
        }
    }
}
