//! Exchange client behind the `exchange_api` circuit breaker and the rate limiter.

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;

use super::exchange::ExchangeClient;
use super::types::{Balance, Candle, OrderResult, OrderStatus};
use crate::error::ExchangeError;
use crate::resilience::{CircuitBreakerRegistry, ExchangeRateLimiter, Priority, EXCHANGE_API};

/// Breaker (outer) → limiter (inner) → raw client.
///
/// An open circuit rejects before a rate slot is taken. Each endpoint runs at
/// a fixed priority:
/// - order placement and cancellation: `TradingOrders`
/// - tickers and order polling: `PositionMonitoring`
/// - candles: `SignalAnalysis`
/// - accounts: `AccountSync`
#[derive(Clone)]
pub struct GuardedExchange {
    inner: Arc<dyn ExchangeClient>,
    limiter: Arc<ExchangeRateLimiter>,
    breakers: Arc<CircuitBreakerRegistry>,
}

impl GuardedExchange {
    pub fn new(
        inner: Arc<dyn ExchangeClient>,
        limiter: Arc<ExchangeRateLimiter>,
        breakers: Arc<CircuitBreakerRegistry>,
    ) -> Self {
        Self {
            inner,
            limiter,
            breakers,
        }
    }

    /// The unguarded client, for fallback paths.
    pub fn raw(&self) -> Arc<dyn ExchangeClient> {
        Arc::clone(&self.inner)
    }

    pub fn limiter(&self) -> &Arc<ExchangeRateLimiter> {
        &self.limiter
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    async fn guarded<T, F, Fut>(
        &self,
        priority: Priority,
        endpoint_key: String,
        f: F,
    ) -> Result<T, ExchangeError>
    where
        T: Send + 'static,
        F: FnOnce(Arc<dyn ExchangeClient>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<T, ExchangeError>> + Send + 'static,
    {
        let client = Arc::clone(&self.inner);
        self.breakers
            .call(EXCHANGE_API, || {
                self.limiter.call(priority, endpoint_key, move || f(client))
            })
            .await
    }
}

#[async_trait]
impl ExchangeClient for GuardedExchange {
    async fn get_ticker(&self, market: &str) -> Result<Decimal, ExchangeError> {
        let market = market.to_string();
        self.guarded(
            Priority::PositionMonitoring,
            format!("ticker:{}", market),
            move |c| async move { c.get_ticker(&market).await },
        )
        .await
    }

    async fn get_candles(
        &self,
        market: &str,
        unit: u32,
        count: usize,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let market = market.to_string();
        self.guarded(
            Priority::SignalAnalysis,
            format!("candles:{}:{}:{}", market, unit, count),
            move |c| async move { c.get_candles(&market, unit, count).await },
        )
        .await
    }

    async fn place_market_buy(
        &self,
        market: &str,
        krw_amount: Decimal,
    ) -> Result<OrderResult, ExchangeError> {
        let market = market.to_string();
        self.guarded(
            Priority::TradingOrders,
            format!("buy:{}:{}", market, krw_amount),
            move |c| async move { c.place_market_buy(&market, krw_amount).await },
        )
        .await
    }

    async fn place_market_sell(
        &self,
        market: &str,
        volume: Decimal,
    ) -> Result<OrderResult, ExchangeError> {
        let market = market.to_string();
        self.guarded(
            Priority::TradingOrders,
            format!("sell:{}:{}", market, volume),
            move |c| async move { c.place_market_sell(&market, volume).await },
        )
        .await
    }

    async fn get_order(&self, order_id: &str) -> Result<OrderStatus, ExchangeError> {
        let order_id = order_id.to_string();
        self.guarded(
            Priority::PositionMonitoring,
            format!("order:{}", order_id),
            move |c| async move { c.get_order(&order_id).await },
        )
        .await
    }

    async fn cancel_order(&self, order_id: &str) -> Result<bool, ExchangeError> {
        let order_id = order_id.to_string();
        self.guarded(
            Priority::TradingOrders,
            format!("cancel:{}", order_id),
            move |c| async move { c.cancel_order(&order_id).await },
        )
        .await
    }

    async fn get_accounts(&self) -> Result<Vec<Balance>, ExchangeError> {
        self.guarded(Priority::AccountSync, "accounts".to_string(), |c| async move {
            c.get_accounts().await
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::PaperExchange;
    use crate::resilience::{CircuitBreakerConfig, CircuitState, RateLimiterConfig};
    use rust_decimal_macros::dec;
    use std::time::Duration;

    async fn guarded_paper(paper: Arc<PaperExchange>) -> GuardedExchange {
        let limiter = Arc::new(ExchangeRateLimiter::new(RateLimiterConfig {
            min_interval: Duration::ZERO,
            ..RateLimiterConfig::default()
        }));
        let breakers = Arc::new(CircuitBreakerRegistry::new(None));
        breakers
            .register(EXCHANGE_API, CircuitBreakerConfig::new(2, 60, 1))
            .await;
        GuardedExchange::new(paper, limiter, breakers)
    }

    #[tokio::test]
    async fn test_passes_through_when_healthy() {
        let paper = Arc::new(PaperExchange::default());
        paper.set_price("KRW-BTC", dec!(90000000)).await;
        let guarded = guarded_paper(paper).await;

        assert_eq!(guarded.get_ticker("KRW-BTC").await.unwrap(), dec!(90000000));
        assert!(guarded.limiter().is_running().await);
    }

    #[tokio::test]
    async fn test_open_circuit_rejects_without_queueing() {
        let paper = Arc::new(PaperExchange::default());
        paper.set_price("KRW-BTC", dec!(90000000)).await;
        paper.fail_next(2).await;
        let guarded = guarded_paper(paper).await;

        assert!(guarded.get_ticker("KRW-BTC").await.is_err());
        assert!(guarded.get_ticker("KRW-BTC").await.is_err());
        assert_eq!(
            guarded.breakers().state(EXCHANGE_API).await,
            Some(CircuitState::Open)
        );

        // The exchange has recovered but the circuit still rejects.
        let err = guarded.get_ticker("KRW-BTC").await.unwrap_err();
        assert!(matches!(err, ExchangeError::CircuitOpen { .. }));
        assert_eq!(guarded.limiter().stats().await.queued, 0);
    }
}
