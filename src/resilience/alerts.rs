//! Alert sink shared by the circuit breakers and the health monitor.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub level: AlertLevel,
    pub source: String,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(level: AlertLevel, source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level,
            source: source.into(),
            message: message.into(),
            raised_at: Utc::now(),
        }
    }
}

/// Async alert handler.
pub type AlertCallback = Arc<dyn Fn(Alert) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Fans alerts out to registered callbacks.
///
/// Each callback runs in its own task under a timeout, so a slow or failing
/// handler never delays the caller or the other handlers.
pub struct AlertDispatcher {
    callbacks: RwLock<Vec<(String, AlertCallback)>>,
    callback_timeout: Duration,
}

impl Default for AlertDispatcher {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl AlertDispatcher {
    pub fn new(callback_timeout: Duration) -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            callback_timeout,
        }
    }

    pub async fn register(&self, name: impl Into<String>, callback: AlertCallback) {
        self.callbacks.write().await.push((name.into(), callback));
    }

    /// Dispatch without waiting for handlers. Returns how many were started.
    pub async fn send(&self, alert: Alert) -> usize {
        let callbacks = self.callbacks.read().await.clone();
        let limit = self.callback_timeout;

        for (name, callback) in &callbacks {
            let fut = callback(alert.clone());
            let name = name.clone();
            tokio::spawn(async move {
                match tokio::time::timeout(limit, fut).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(callback = %name, error = %e, "Alert callback failed"),
                    Err(_) => warn!(callback = %name, "Alert callback timed out"),
                }
            });
        }
        callbacks.len()
    }
}

/// Callback that writes alerts to the log.
pub fn log_alerts() -> AlertCallback {
    Arc::new(|alert: Alert| -> BoxFuture<'static, anyhow::Result<()>> {
        Box::pin(async move {
            match alert.level {
                AlertLevel::Critical => {
                    error!(source = %alert.source, "ALERT: {}", alert.message)
                }
                AlertLevel::Warning => warn!(source = %alert.source, "ALERT: {}", alert.message),
                AlertLevel::Info => info!(source = %alert.source, "ALERT: {}", alert.message),
            }
            Ok(())
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_failing_callback_does_not_block_others() {
        let dispatcher = AlertDispatcher::default();
        let seen = Arc::new(Mutex::new(Vec::new()));

        dispatcher
            .register(
                "broken",
                Arc::new(|_alert: Alert| -> BoxFuture<'static, anyhow::Result<()>> {
                    Box::pin(async { Err::<(), _>(anyhow::anyhow!("smtp down")) })
                }),
            )
            .await;
        let sink = seen.clone();
        dispatcher
            .register(
                "recorder",
                Arc::new(move |alert: Alert| -> BoxFuture<'static, anyhow::Result<()>> {
                    let sink = sink.clone();
                    Box::pin(async move {
                        sink.lock().unwrap().push(alert.source);
                        Ok(())
                    })
                }),
            )
            .await;

        let started = dispatcher
            .send(Alert::new(AlertLevel::Critical, "exchange_api", "offline"))
            .await;
        assert_eq!(started, 2);

        for _ in 0..10 {
            if !seen.lock().unwrap().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(*seen.lock().unwrap(), vec!["exchange_api".to_string()]);
    }
}
