//! Exchange data types: candles, orders, balances.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One OHLCV bucket. Indicator math runs on `f64`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// Bucket start in milliseconds since the epoch
    pub timestamp: i64,
}

impl Candle {
    /// Typical price used for VWAP.
    pub fn typical_price(&self) -> f64 {
        (self.high + self.low + self.close) / 3.0
    }

    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }
}

/// Order side as the exchange names it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    /// Buy
    Bid,
    /// Sell
    Ask,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Bid => write!(f, "bid"),
            OrderSide::Ask => write!(f, "ask"),
        }
    }
}

/// Order type submitted to the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderKind {
    /// Market buy sized in quote currency (KRW)
    Price,
    /// Market sell sized in base volume
    Market,
    /// Limit order
    Limit,
}

/// Lifecycle state reported by the exchange for an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderState {
    Wait,
    Watch,
    Done,
    Cancel,
}

impl OrderState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderState::Done | OrderState::Cancel)
    }
}

/// Acknowledgement returned right after order submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResult {
    pub order_id: String,
    pub market: String,
    pub side: OrderSide,
    pub kind: OrderKind,
    pub state: OrderState,
    pub created_at: DateTime<Utc>,
}

/// Snapshot of an order's fill progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderStatus {
    pub order_id: String,
    pub market: String,
    pub side: OrderSide,
    pub state: OrderState,
    pub executed_volume: Decimal,
    /// Average fill price; zero when nothing executed yet
    pub avg_price: Decimal,
    pub paid_fee: Decimal,
    pub updated_at: DateTime<Utc>,
}

/// Account balance for one currency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Balance {
    pub currency: String,
    pub balance: Decimal,
    pub locked: Decimal,
    pub avg_buy_price: Decimal,
}

/// Split a market id such as `KRW-BTC` into its coin symbol.
pub fn coin_of(market: &str) -> &str {
    market.split_once('-').map(|(_, coin)| coin).unwrap_or(market)
}

/// Build a KRW market id from a coin symbol.
pub fn krw_market(coin: &str) -> String {
    format!("KRW-{}", coin)
}
