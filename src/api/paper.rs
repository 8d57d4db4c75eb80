//! In-memory exchange for dry runs and tests.
//!
//! Market orders fill against the last set price with configurable slippage
//! and fee. Failures and slow fills can be injected per market.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::exchange::ExchangeClient;
use super::types::{coin_of, Balance, Candle, OrderKind, OrderResult, OrderSide, OrderState, OrderStatus};
use crate::error::ExchangeError;

/// Paper exchange configuration.
#[derive(Debug, Clone)]
pub struct PaperConfig {
    /// Starting KRW balance
    pub initial_krw: Decimal,

    /// Fraction the fill price moves against the order
    pub slippage: Decimal,

    pub fee_rate: Decimal,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            initial_krw: dec!(10000000),
            slippage: Decimal::ZERO,
            fee_rate: dec!(0.0005),
        }
    }
}

#[derive(Default)]
struct Faults {
    /// Fail this many upcoming calls of any kind
    next_calls: u32,
    tickers: HashSet<String>,
    sells: HashSet<String>,
    sell_delays: HashMap<String, Duration>,
    /// Leave new orders in `wait` until [`PaperExchange::settle_order`]
    hold_fills: bool,
}

pub struct PaperExchange {
    config: PaperConfig,
    prices: RwLock<HashMap<String, Decimal>>,
    candles: RwLock<HashMap<String, Vec<Candle>>>,
    orders: RwLock<HashMap<String, OrderStatus>>,
    balances: RwLock<HashMap<String, Decimal>>,
    faults: RwLock<Faults>,
}

impl Default for PaperExchange {
    fn default() -> Self {
        Self::new(PaperConfig::default())
    }
}

impl PaperExchange {
    pub fn new(config: PaperConfig) -> Self {
        let mut balances = HashMap::new();
        balances.insert("KRW".to_string(), config.initial_krw);
        Self {
            config,
            prices: RwLock::new(HashMap::new()),
            candles: RwLock::new(HashMap::new()),
            orders: RwLock::new(HashMap::new()),
            balances: RwLock::new(balances),
            faults: RwLock::new(Faults::default()),
        }
    }

    pub async fn set_price(&self, market: &str, price: Decimal) {
        self.prices.write().await.insert(market.to_string(), price);
    }

    pub async fn set_candles(&self, market: &str, candles: Vec<Candle>) {
        self.candles.write().await.insert(market.to_string(), candles);
    }

    /// Credit a currency balance.
    pub async fn deposit(&self, currency: &str, amount: Decimal) {
        *self.balances.write().await.entry(currency.to_string()).or_default() += amount;
    }

    pub async fn balance(&self, currency: &str) -> Decimal {
        self.balances.read().await.get(currency).copied().unwrap_or_default()
    }

    /// Fail the next `n` calls with a 503.
    pub async fn fail_next(&self, n: u32) {
        self.faults.write().await.next_calls = n;
    }

    pub async fn fail_ticker(&self, market: &str, failing: bool) {
        let mut faults = self.faults.write().await;
        if failing {
            faults.tickers.insert(market.to_string());
        } else {
            faults.tickers.remove(market);
        }
    }

    pub async fn fail_sells(&self, market: &str, failing: bool) {
        let mut faults = self.faults.write().await;
        if failing {
            faults.sells.insert(market.to_string());
        } else {
            faults.sells.remove(market);
        }
    }

    /// Delay sell submissions for one market.
    pub async fn delay_sells(&self, market: &str, delay: Duration) {
        self.faults.write().await.sell_delays.insert(market.to_string(), delay);
    }

    pub async fn hold_fills(&self, hold: bool) {
        self.faults.write().await.hold_fills = hold;
    }

    /// Complete a held order at `price` and apply it to balances.
    pub async fn settle_order(&self, order_id: &str, price: Decimal) -> Result<(), ExchangeError> {
        let (side, market, requested) = {
            let orders = self.orders.read().await;
            let order = orders
                .get(order_id)
                .ok_or_else(|| ExchangeError::Rejected(format!("order not found: {}", order_id)))?;
            (order.side, order.market.clone(), order.executed_volume)
        };
        // Held buys store the KRW amount in `executed_volume` until filled.
        let volume = match side {
            OrderSide::Bid => requested / price,
            OrderSide::Ask => requested,
        };
        let fee = self.apply_fill(&market, side, volume, price).await?;

        if let Some(order) = self.orders.write().await.get_mut(order_id) {
            order.state = OrderState::Done;
            order.executed_volume = volume;
            order.avg_price = price;
            order.paid_fee = fee;
            order.updated_at = Utc::now();
        }
        Ok(())
    }

    /// Mark a held order cancelled without filling it.
    pub async fn cancel_held(&self, order_id: &str) {
        if let Some(order) = self.orders.write().await.get_mut(order_id) {
            order.state = OrderState::Cancel;
            order.executed_volume = Decimal::ZERO;
            order.updated_at = Utc::now();
        }
    }

    pub async fn order_count(&self) -> usize {
        self.orders.read().await.len()
    }

    async fn injected_failure(&self) -> Result<(), ExchangeError> {
        let mut faults = self.faults.write().await;
        if faults.next_calls > 0 {
            faults.next_calls -= 1;
            return Err(unavailable());
        }
        Ok(())
    }

    async fn last_price(&self, market: &str) -> Result<Decimal, ExchangeError> {
        self.prices
            .read()
            .await
            .get(market)
            .copied()
            .ok_or_else(|| ExchangeError::InvalidResponse(format!("no price for {}", market)))
    }

    /// Move balances for a fill, returning the fee charged.
    async fn apply_fill(
        &self,
        market: &str,
        side: OrderSide,
        volume: Decimal,
        price: Decimal,
    ) -> Result<Decimal, ExchangeError> {
        let coin = coin_of(market).to_string();
        let funds = volume * price;
        let fee = funds * self.config.fee_rate;
        let mut balances = self.balances.write().await;

        match side {
            OrderSide::Bid => {
                let krw = balances.entry("KRW".to_string()).or_default();
                if *krw < funds + fee {
                    return Err(ExchangeError::Rejected("insufficient_funds_bid".to_string()));
                }
                *krw -= funds + fee;
                *balances.entry(coin).or_default() += volume;
            }
            OrderSide::Ask => {
                let held = balances.entry(coin).or_default();
                if *held < volume {
                    return Err(ExchangeError::Rejected("insufficient_funds_ask".to_string()));
                }
                *held -= volume;
                *balances.entry("KRW".to_string()).or_default() += funds - fee;
            }
        }
        Ok(fee)
    }

    async fn submit(
        &self,
        market: &str,
        side: OrderSide,
        kind: OrderKind,
        size: Decimal,
    ) -> Result<OrderResult, ExchangeError> {
        if size <= Decimal::ZERO {
            return Err(ExchangeError::Rejected("order size must be positive".to_string()));
        }
        let last = self.last_price(market).await?;
        let fill_price = match side {
            OrderSide::Bid => last * (Decimal::ONE + self.config.slippage),
            OrderSide::Ask => last * (Decimal::ONE - self.config.slippage),
        };
        let order_id = Uuid::new_v4().to_string();
        let now = Utc::now();

        let status = if self.faults.read().await.hold_fills {
            OrderStatus {
                order_id: order_id.clone(),
                market: market.to_string(),
                side,
                state: OrderState::Wait,
                executed_volume: size,
                avg_price: Decimal::ZERO,
                paid_fee: Decimal::ZERO,
                updated_at: now,
            }
        } else {
            let volume = match side {
                OrderSide::Bid => size / fill_price,
                OrderSide::Ask => size,
            };
            let fee = self.apply_fill(market, side, volume, fill_price).await?;
            OrderStatus {
                order_id: order_id.clone(),
                market: market.to_string(),
                side,
                state: OrderState::Done,
                executed_volume: volume,
                avg_price: fill_price,
                paid_fee: fee,
                updated_at: now,
            }
        };

        debug!(order_id = %order_id, market = %market, side = %side, state = ?status.state, "Paper order");
        let state = status.state;
        self.orders.write().await.insert(order_id.clone(), status);

        Ok(OrderResult {
            order_id,
            market: market.to_string(),
            side,
            kind,
            state,
            created_at: now,
        })
    }
}

fn unavailable() -> ExchangeError {
    ExchangeError::Api {
        status: 503,
        body: "paper exchange unavailable".to_string(),
    }
}

#[async_trait]
impl ExchangeClient for PaperExchange {
    async fn get_ticker(&self, market: &str) -> Result<Decimal, ExchangeError> {
        self.injected_failure().await?;
        if self.faults.read().await.tickers.contains(market) {
            return Err(unavailable());
        }
        self.last_price(market).await
    }

    async fn get_candles(
        &self,
        market: &str,
        _unit: u32,
        count: usize,
    ) -> Result<Vec<Candle>, ExchangeError> {
        self.injected_failure().await?;
        let candles = self.candles.read().await;
        let series = candles.get(market).map(Vec::as_slice).unwrap_or_default();
        let skip = series.len().saturating_sub(count);
        Ok(series[skip..].to_vec())
    }

    async fn place_market_buy(
        &self,
        market: &str,
        krw_amount: Decimal,
    ) -> Result<OrderResult, ExchangeError> {
        self.injected_failure().await?;
        self.submit(market, OrderSide::Bid, OrderKind::Price, krw_amount).await
    }

    async fn place_market_sell(
        &self,
        market: &str,
        volume: Decimal,
    ) -> Result<OrderResult, ExchangeError> {
        self.injected_failure().await?;
        let (failing, delay) = {
            let faults = self.faults.read().await;
            (faults.sells.contains(market), faults.sell_delays.get(market).copied())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if failing {
            return Err(unavailable());
        }
        self.submit(market, OrderSide::Ask, OrderKind::Market, volume).await
    }

    async fn get_order(&self, order_id: &str) -> Result<OrderStatus, ExchangeError> {
        self.injected_failure().await?;
        self.orders
            .read()
            .await
            .get(order_id)
            .cloned()
            .ok_or_else(|| ExchangeError::Api {
                status: 404,
                body: format!("order_not_found: {}", order_id),
            })
    }

    async fn cancel_order(&self, order_id: &str) -> Result<bool, ExchangeError> {
        self.injected_failure().await?;
        let mut orders = self.orders.write().await;
        match orders.get_mut(order_id) {
            Some(order) if !order.state.is_terminal() => {
                order.state = OrderState::Cancel;
                order.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_accounts(&self) -> Result<Vec<Balance>, ExchangeError> {
        self.injected_failure().await?;
        let mut out: Vec<Balance> = self
            .balances
            .read()
            .await
            .iter()
            .map(|(currency, amount)| Balance {
                currency: currency.clone(),
                balance: *amount,
                locked: Decimal::ZERO,
                avg_buy_price: Decimal::ZERO,
            })
            .collect();
        out.sort_by(|a, b| a.currency.cmp(&b.currency));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn test_buy_then_sell_moves_balances() {
        let paper = PaperExchange::new(PaperConfig {
            initial_krw: dec!(100000),
            slippage: Decimal::ZERO,
            fee_rate: dec!(0.001),
        });
        paper.set_price("KRW-BTC", dec!(50000)).await;

        let buy = assert_ok!(paper.place_market_buy("KRW-BTC", dec!(10000)).await);
        assert_eq!(buy.state, OrderState::Done);
        assert_eq!(paper.balance("BTC").await, dec!(0.2));
        assert_eq!(paper.balance("KRW").await, dec!(89990));

        paper.set_price("KRW-BTC", dec!(60000)).await;
        assert_ok!(paper.place_market_sell("KRW-BTC", dec!(0.2)).await);
        assert_eq!(paper.balance("BTC").await, Decimal::ZERO);
        assert_eq!(paper.balance("KRW").await, dec!(89990) + dec!(12000) - dec!(12));
    }

    #[tokio::test]
    async fn test_sell_without_holdings_is_rejected() {
        let paper = PaperExchange::default();
        paper.set_price("KRW-ETH", dec!(3000000)).await;
        let err = paper.place_market_sell("KRW-ETH", dec!(1)).await.unwrap_err();
        assert!(matches!(err, ExchangeError::Rejected(_)));
        assert!(!err.is_service_failure());
    }

    #[tokio::test]
    async fn test_injected_failures_are_service_failures() {
        let paper = PaperExchange::default();
        paper.set_price("KRW-XRP", dec!(800)).await;
        paper.fail_next(1).await;
        let err = paper.get_ticker("KRW-XRP").await.unwrap_err();
        assert!(err.is_service_failure());
        assert_eq!(paper.get_ticker("KRW-XRP").await.unwrap(), dec!(800));
    }

    #[tokio::test]
    async fn test_held_order_settles_later() {
        let paper = PaperExchange::default();
        paper.set_price("KRW-BTC", dec!(100000)).await;
        paper.hold_fills(true).await;

        let order = paper.place_market_buy("KRW-BTC", dec!(50000)).await.unwrap();
        assert_eq!(paper.get_order(&order.order_id).await.unwrap().state, OrderState::Wait);

        paper.settle_order(&order.order_id, dec!(100000)).await.unwrap();
        let status = paper.get_order(&order.order_id).await.unwrap();
        assert_eq!(status.state, OrderState::Done);
        assert_eq!(status.executed_volume, dec!(0.5));
        assert_eq!(status.avg_price, dec!(100000));
    }
}
