//! Open position held by a session.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::api::krw_market;

/// Direction set after three consecutive ticks the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrendDirection {
    Up,
    Down,
    Sideways,
}

/// A long spot position in one KRW market.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    /// Coin symbol, e.g. `BTC`
    pub coin: String,

    /// Market id, e.g. `KRW-BTC`
    pub market: String,

    pub entry_price: Decimal,

    /// Coin units held
    pub amount: Decimal,

    /// KRW committed from the budget for the units still held
    pub cost_basis: Decimal,

    pub entry_time: DateTime<Utc>,

    /// Take-profit price
    pub profit_target: Decimal,

    /// Stop-loss price
    pub stop_loss: Decimal,

    pub current_price: Decimal,
    pub previous_price: Decimal,
    pub unrealized_pnl: Decimal,

    pub trailing_enabled: bool,
    /// Trail distance below the highest price, in percent
    pub trailing_pct: Decimal,
    pub highest_price: Decimal,

    pub partial_taken: bool,

    pub trend: TrendDirection,
    up_ticks: u32,
    down_ticks: u32,

    /// Absolute percent change of the last tick
    pub volatility: f64,

    /// Profit stages reached so far (0 to 3)
    pub profit_stage: u8,

    pub max_hold: Duration,

    pub buy_order_id: Option<String>,

    pub last_updated: DateTime<Utc>,
}

impl Position {
    pub fn new(
        coin: &str,
        entry_price: Decimal,
        amount: Decimal,
        cost_basis: Decimal,
        profit_target: Decimal,
        stop_loss: Decimal,
        max_hold: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            coin: coin.to_string(),
            market: krw_market(coin),
            entry_price,
            amount,
            cost_basis,
            entry_time: now,
            profit_target,
            stop_loss,
            current_price: entry_price,
            previous_price: entry_price,
            unrealized_pnl: Decimal::ZERO,
            trailing_enabled: false,
            trailing_pct: Decimal::ZERO,
            highest_price: entry_price,
            partial_taken: false,
            trend: TrendDirection::Sideways,
            up_ticks: 0,
            down_ticks: 0,
            volatility: 0.0,
            profit_stage: 0,
            max_hold,
            buy_order_id: None,
            last_updated: now,
        }
    }

    pub fn with_order_id(mut self, order_id: impl Into<String>) -> Self {
        self.buy_order_id = Some(order_id.into());
        self
    }

    pub fn with_entry_time(mut self, entry_time: DateTime<Utc>) -> Self {
        self.entry_time = entry_time;
        self
    }

    /// Apply a new price tick.
    pub fn update_price(&mut self, price: Decimal) {
        self.previous_price = self.current_price;
        self.current_price = price;
        self.unrealized_pnl = (price - self.entry_price) * self.amount;

        if price > self.highest_price {
            self.highest_price = price;
        }

        if price > self.previous_price {
            self.up_ticks += 1;
            self.down_ticks = 0;
            if self.up_ticks >= 3 {
                self.trend = TrendDirection::Up;
            }
        } else if price < self.previous_price {
            self.down_ticks += 1;
            self.up_ticks = 0;
            if self.down_ticks >= 3 {
                self.trend = TrendDirection::Down;
            }
        }

        if !self.previous_price.is_zero() {
            let change = ((price - self.previous_price) / self.previous_price).abs()
                * Decimal::ONE_HUNDRED;
            self.volatility = change.to_f64().unwrap_or(0.0);
        }

        self.last_updated = Utc::now();
    }

    /// Gain of the current price over entry, in percent.
    pub fn profit_pct(&self) -> Decimal {
        percent_from(self.entry_price, self.current_price)
    }

    /// Gain of the highest price seen over entry, in percent.
    pub fn peak_gain_pct(&self) -> Decimal {
        percent_from(self.entry_price, self.highest_price)
    }

    /// Pullback of the current price from the highest price, in percent.
    pub fn drawdown_from_peak_pct(&self) -> Decimal {
        if self.highest_price.is_zero() {
            return Decimal::ZERO;
        }
        (self.highest_price - self.current_price) / self.highest_price * Decimal::ONE_HUNDRED
    }

    /// Realized P&L if the whole position were sold at `price`.
    pub fn pnl_at(&self, price: Decimal) -> Decimal {
        (price - self.entry_price) * self.amount
    }

    pub fn held_for(&self, now: DateTime<Utc>) -> Duration {
        (now - self.entry_time).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.held_for(now) >= self.max_hold
    }

    /// Stop price when trailing is active and the peak cleared `activation_pct`.
    pub fn trailing_stop_price(&self, activation_pct: Decimal) -> Option<Decimal> {
        if !self.trailing_enabled || self.peak_gain_pct() < activation_pct {
            return None;
        }
        Some(self.highest_price * (Decimal::ONE - self.trailing_pct / Decimal::ONE_HUNDRED))
    }

    /// Remove `fraction` of the holding. Returns `(units, cost_basis)` removed.
    pub fn reduce(&mut self, fraction: Decimal) -> (Decimal, Decimal) {
        let fraction = fraction.clamp(Decimal::ZERO, Decimal::ONE);
        let units = self.amount * fraction;
        let cost = self.cost_basis * fraction;
        self.amount -= units;
        self.cost_basis -= cost;
        self.unrealized_pnl = self.pnl_at(self.current_price);
        (units, cost)
    }
}

fn percent_from(base: Decimal, value: Decimal) -> Decimal {
    if base.is_zero() {
        return Decimal::ZERO;
    }
    (value - base) / base * Decimal::ONE_HUNDRED
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn make_position() -> Position {
        Position::new(
            "BTC",
            dec!(100),
            dec!(10),
            dec!(1000),
            dec!(102.5),
            dec!(99),
            Duration::from_secs(600),
        )
    }

    #[test]
    fn test_price_updates_track_pnl_and_peak() {
        let mut pos = make_position();
        assert_eq!(pos.market, "KRW-BTC");

        pos.update_price(dec!(103));
        assert_eq!(pos.unrealized_pnl, dec!(30));
        assert_eq!(pos.previous_price, dec!(100));
        assert_eq!(pos.highest_price, dec!(103));

        pos.update_price(dec!(101));
        assert_eq!(pos.highest_price, dec!(103));
        assert_eq!(pos.unrealized_pnl, dec!(10));
        assert_eq!(pos.profit_pct(), dec!(1));
    }

    #[test]
    fn test_trend_needs_three_ticks() {
        let mut pos = make_position();
        pos.update_price(dec!(100.1));
        pos.update_price(dec!(100.2));
        assert_eq!(pos.trend, TrendDirection::Sideways);
        pos.update_price(dec!(100.3));
        assert_eq!(pos.trend, TrendDirection::Up);

        pos.update_price(dec!(100.2));
        pos.update_price(dec!(100.1));
        assert_eq!(pos.trend, TrendDirection::Up);
        pos.update_price(dec!(100.0));
        assert_eq!(pos.trend, TrendDirection::Down);
        assert!((pos.volatility - 0.0998).abs() < 0.001);
    }

    #[test]
    fn test_trailing_stop_requires_activation() {
        let mut pos = make_position();
        pos.trailing_enabled = true;
        pos.trailing_pct = dec!(0.1);

        pos.update_price(dec!(100.1));
        assert_eq!(pos.trailing_stop_price(dec!(0.2)), None);

        pos.update_price(dec!(101));
        assert_eq!(pos.trailing_stop_price(dec!(0.2)), Some(dec!(100.899)));
    }

    #[test]
    fn test_reduce_is_proportional() {
        let mut pos = make_position();
        let (units, cost) = pos.reduce(dec!(0.5));
        assert_eq!(units, dec!(5));
        assert_eq!(cost, dec!(500));
        assert_eq!(pos.amount, dec!(5));
        assert_eq!(pos.cost_basis, dec!(500));
    }

    #[test]
    fn test_expiry() {
        let pos = make_position().with_entry_time(Utc::now() - chrono::Duration::minutes(11));
        assert!(pos.is_expired(Utc::now()));
        assert!(!make_position().is_expired(Utc::now()));
    }
}
