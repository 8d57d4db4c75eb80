//! Background polling that confirms submitted orders were filled.
//!
//! Each verification runs in its own task and only records what the exchange
//! reports. Budgets are never touched here.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tokio::sync::{watch, RwLock};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::api::{ExchangeClient, OrderKind, OrderSide, OrderState, OrderStatus};
use crate::metrics::{ExecutionStats, MetricsCalculator};
use crate::models::{TradeVerification, VerificationMetrics, VerificationStatus};
use crate::resilience::{CircuitBreakerRegistry, ORDER_VERIFIER};

#[derive(Debug, Clone)]
pub struct VerifierConfig {
    pub max_attempts: u32,
    pub poll_interval: Duration,
    pub total_timeout: Duration,
    /// Absolute slippage in percent above which a fill is flagged
    pub high_slippage_pct: f64,
    /// Completed verifications kept for reporting
    pub history: usize,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            poll_interval: Duration::from_secs(5),
            total_timeout: Duration::from_secs(300),
            high_slippage_pct: 0.2,
            history: 200,
        }
    }
}

pub struct OrderVerifier {
    client: Arc<dyn ExchangeClient>,
    breakers: Option<Arc<CircuitBreakerRegistry>>,
    config: VerifierConfig,
    pending: RwLock<HashMap<String, TradeVerification>>,
    completed: RwLock<VecDeque<TradeVerification>>,
    metrics: RwLock<VerificationMetrics>,
    shutdown: watch::Sender<bool>,
}

impl OrderVerifier {
    pub fn new(
        client: Arc<dyn ExchangeClient>,
        breakers: Option<Arc<CircuitBreakerRegistry>>,
        config: VerifierConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            client,
            breakers,
            config,
            pending: RwLock::new(HashMap::new()),
            completed: RwLock::new(VecDeque::new()),
            metrics: RwLock::new(VerificationMetrics::default()),
            shutdown,
        }
    }

    /// Register an order and start polling it in the background.
    pub async fn create(
        self: &Arc<Self>,
        order_id: &str,
        market: &str,
        side: OrderSide,
        kind: OrderKind,
        requested_amount: Decimal,
        requested_price: Decimal,
    ) -> TradeVerification {
        let verification = TradeVerification::new(
            order_id,
            market,
            side,
            kind,
            requested_amount,
            requested_price,
        );
        self.pending
            .write()
            .await
            .insert(order_id.to_string(), verification.clone());
        debug!(order_id = %order_id, market = %market, side = %side, "Verification registered");

        let verifier = Arc::clone(self);
        let order_id = order_id.to_string();
        tokio::spawn(async move { verifier.run(order_id).await });

        verification
    }

    async fn poll_once(&self, order_id: &str) -> Result<OrderStatus, String> {
        let client = Arc::clone(&self.client);
        let fetch = async {
            match &self.breakers {
                Some(breakers) => breakers.call(ORDER_VERIFIER, || client.get_order(order_id)).await,
                None => client.get_order(order_id).await,
            }
        };
        match timeout(self.config.poll_interval.max(Duration::from_secs(1)) * 4, fetch).await {
            Ok(Ok(status)) => Ok(status),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("order poll timed out".to_string()),
        }
    }

    async fn run(&self, order_id: String) {
        let started = Instant::now();
        let deadline = started + self.config.total_timeout;
        let mut stop = self.shutdown.subscribe();
        let mut saw_order = false;

        for attempt in 1..=self.config.max_attempts {
            if *stop.borrow() {
                self.finish(&order_id, VerificationStatus::Failed, None, started, Some("verifier stopped".into()))
                    .await;
                return;
            }

            let outcome = tokio::select! {
                r = self.poll_once(&order_id) => r,
                _ = tokio::time::sleep_until(deadline) => Err("verification deadline passed".to_string()),
            };
            self.note_attempt(&order_id, attempt, outcome.as_ref().err()).await;

            match outcome {
                Ok(status) if status.state == OrderState::Done => {
                    self.finish(&order_id, VerificationStatus::Verified, Some(status), started, None)
                        .await;
                    return;
                }
                Ok(status) if status.state == OrderState::Cancel => {
                    self.finish(&order_id, VerificationStatus::Cancelled, Some(status), started, None)
                        .await;
                    return;
                }
                Ok(_) => saw_order = true,
                Err(e) => debug!(order_id = %order_id, attempt, error = %e, "Order poll failed"),
            }

            if Instant::now() >= deadline || attempt == self.config.max_attempts {
                break;
            }
            tokio::select! {
                _ = sleep(self.config.poll_interval) => {}
                _ = stop.changed() => {}
            }
        }

        let status = if saw_order {
            VerificationStatus::Timeout
        } else {
            VerificationStatus::Failed
        };
        self.finish(&order_id, status, None, started, None).await;
    }

    async fn note_attempt(&self, order_id: &str, attempt: u32, error: Option<&String>) {
        if let Some(v) = self.pending.write().await.get_mut(order_id) {
            v.attempts = attempt;
            if let Some(e) = error {
                v.errors.push(e.clone());
            }
        }
    }

    async fn finish(
        &self,
        order_id: &str,
        status: VerificationStatus,
        fill: Option<OrderStatus>,
        started: Instant,
        note: Option<String>,
    ) {
        let Some(mut v) = self.pending.write().await.remove(order_id) else {
            return;
        };
        v.status = status;
        v.completed_at = Some(Utc::now());
        v.execution_secs = started.elapsed().as_secs_f64();
        if let Some(note) = note {
            v.errors.push(note);
        }

        let mut fill_rate = 0.0;
        if let Some(fill) = fill {
            v.filled_amount = fill.executed_volume;
            v.avg_fill_price = fill.avg_price;
            v.fee = fill.paid_fee;
            if !v.requested_price.is_zero() && !fill.avg_price.is_zero() {
                let slippage = (fill.avg_price - v.requested_price) / v.requested_price * Decimal::ONE_HUNDRED;
                v.slippage_pct = slippage.to_f64().unwrap_or(0.0);
                v.high_slippage = v.slippage_pct.abs() > self.config.high_slippage_pct;
            }
            fill_rate = fill_ratio(&v);
        }

        match v.status {
            VerificationStatus::Verified if v.high_slippage => warn!(
                order_id = %order_id,
                market = %v.market,
                slippage_pct = v.slippage_pct,
                "Order filled with high slippage"
            ),
            VerificationStatus::Verified => info!(
                order_id = %order_id,
                market = %v.market,
                avg_price = %v.avg_fill_price,
                slippage_pct = v.slippage_pct,
                "Order fill verified"
            ),
            other => warn!(
                order_id = %order_id,
                market = %v.market,
                status = ?other,
                attempts = v.attempts,
                "Order not verified"
            ),
        }

        self.metrics.write().await.record(&v, fill_rate);
        let mut completed = self.completed.write().await;
        completed.push_back(v);
        while completed.len() > self.config.history {
            completed.pop_front();
        }
    }

    /// Pending or completed verification for an order.
    pub async fn get(&self, order_id: &str) -> Option<TradeVerification> {
        if let Some(v) = self.pending.read().await.get(order_id) {
            return Some(v.clone());
        }
        self.completed
            .read()
            .await
            .iter()
            .rev()
            .find(|v| v.order_id == order_id)
            .cloned()
    }

    /// Orders still awaiting a final exchange state.
    pub async fn pending_order_ids(&self) -> Vec<String> {
        self.pending.read().await.keys().cloned().collect()
    }

    pub async fn recent(&self, limit: usize) -> Vec<TradeVerification> {
        self.completed.read().await.iter().rev().take(limit).cloned().collect()
    }

    pub async fn metrics(&self) -> VerificationMetrics {
        self.metrics.read().await.clone()
    }

    pub async fn execution_stats(&self) -> ExecutionStats {
        let completed: Vec<TradeVerification> = self.completed.read().await.iter().cloned().collect();
        MetricsCalculator::execution_stats(&completed)
    }

    /// Stop polling; unfinished verifications end as failed.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Filled share of the requested size, capped at 1.
fn fill_ratio(v: &TradeVerification) -> f64 {
    if v.requested_amount.is_zero() {
        return 0.0;
    }
    let filled = match v.kind {
        // Market buys are sized in KRW
        OrderKind::Price => v.filled_value(),
        OrderKind::Market | OrderKind::Limit => v.filled_amount,
    };
    (filled / v.requested_amount).to_f64().unwrap_or(0.0).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::PaperExchange;
    use rust_decimal_macros::dec;

    fn make_verifier(paper: Arc<PaperExchange>) -> Arc<OrderVerifier> {
        Arc::new(OrderVerifier::new(paper, None, VerifierConfig::default()))
    }

    async fn wait_final(verifier: &OrderVerifier, order_id: &str) -> TradeVerification {
        for _ in 0..100 {
            if let Some(v) = verifier.get(order_id).await {
                if v.status.is_final() {
                    return v;
                }
            }
            sleep(Duration::from_secs(1)).await;
        }
        panic!("verification did not finish");
    }

    #[tokio::test(start_paused = true)]
    async fn test_filled_order_verified_with_slippage() {
        let paper = Arc::new(PaperExchange::default());
        paper.set_price("KRW-BTC", dec!(100.3)).await;
        let order = paper.place_market_buy("KRW-BTC", dec!(100300)).await.unwrap();

        let verifier = make_verifier(paper);
        verifier
            .create(&order.order_id, "KRW-BTC", OrderSide::Bid, OrderKind::Price, dec!(100300), dec!(100))
            .await;

        let v = wait_final(&verifier, &order.order_id).await;
        assert_eq!(v.status, VerificationStatus::Verified);
        assert!((v.slippage_pct - 0.3).abs() < 1e-9);
        assert!(v.high_slippage);
        assert_eq!(v.filled_amount, dec!(1000));
        assert!(verifier.pending_order_ids().await.is_empty());
        assert_eq!(verifier.recent(5).await.len(), 1);

        let metrics = verifier.metrics().await;
        assert_eq!(metrics.verified, 1);
        assert!((metrics.avg_fill_rate - 1.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_order() {
        let paper = Arc::new(PaperExchange::default());
        paper.set_price("KRW-ETH", dec!(1000)).await;
        paper.hold_fills(true).await;
        let order = paper.place_market_buy("KRW-ETH", dec!(10000)).await.unwrap();

        let verifier = make_verifier(paper.clone());
        verifier
            .create(&order.order_id, "KRW-ETH", OrderSide::Bid, OrderKind::Price, dec!(10000), dec!(1000))
            .await;
        sleep(Duration::from_secs(7)).await;
        assert_eq!(verifier.pending_order_ids().await, vec![order.order_id.clone()]);

        paper.cancel_held(&order.order_id).await;
        let v = wait_final(&verifier, &order.order_id).await;
        assert_eq!(v.status, VerificationStatus::Cancelled);
        assert!(v.attempts >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_filled_times_out() {
        let paper = Arc::new(PaperExchange::default());
        paper.set_price("KRW-ETH", dec!(1000)).await;
        paper.hold_fills(true).await;
        let order = paper.place_market_buy("KRW-ETH", dec!(10000)).await.unwrap();

        let verifier = make_verifier(paper);
        verifier
            .create(&order.order_id, "KRW-ETH", OrderSide::Bid, OrderKind::Price, dec!(10000), dec!(1000))
            .await;

        let v = wait_final(&verifier, &order.order_id).await;
        assert_eq!(v.status, VerificationStatus::Timeout);
        assert_eq!(v.attempts, 10);
        assert_eq!(verifier.metrics().await.timed_out, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_order_fails() {
        let paper = Arc::new(PaperExchange::default());
        let verifier = make_verifier(paper);
        verifier
            .create("missing", "KRW-ETH", OrderSide::Ask, OrderKind::Market, dec!(1), dec!(1000))
            .await;

        let v = wait_final(&verifier, "missing").await;
        assert_eq!(v.status, VerificationStatus::Failed);
        assert_eq!(v.errors.len(), 10);
    }
}
