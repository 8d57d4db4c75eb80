//! Exchange client abstraction consumed by the engine, verifier and health pings.

use async_trait::async_trait;
use rust_decimal::Decimal;

use super::types::{Balance, Candle, OrderResult, OrderStatus};
use crate::error::ExchangeError;

/// Market data and order execution against a KRW spot exchange.
///
/// Implementations are expected to fail intermittently; callers wrap them in
/// [`GuardedExchange`](super::GuardedExchange) or an explicit timeout.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Last traded price for a market.
    async fn get_ticker(&self, market: &str) -> Result<Decimal, ExchangeError>;

    /// Minute candles, oldest first.
    async fn get_candles(
        &self,
        market: &str,
        unit: u32,
        count: usize,
    ) -> Result<Vec<Candle>, ExchangeError>;

    /// Market buy spending `krw_amount` of quote currency.
    async fn place_market_buy(
        &self,
        market: &str,
        krw_amount: Decimal,
    ) -> Result<OrderResult, ExchangeError>;

    /// Market sell of `volume` units of the base currency.
    async fn place_market_sell(
        &self,
        market: &str,
        volume: Decimal,
    ) -> Result<OrderResult, ExchangeError>;

    async fn get_order(&self, order_id: &str) -> Result<OrderStatus, ExchangeError>;

    /// Returns true when the exchange accepted the cancellation.
    async fn cancel_order(&self, order_id: &str) -> Result<bool, ExchangeError>;

    async fn get_accounts(&self) -> Result<Vec<Balance>, ExchangeError>;
}
