//! Budget, open positions and daily risk counters for one session.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info};

use super::config::RiskConfig;
use crate::models::Position;

/// Why a new entry was refused.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TradeRejection {
    #[error("insufficient budget: need {needed}, available {available}")]
    InsufficientBudget { needed: Decimal, available: Decimal },

    #[error("position limit reached ({max})")]
    PositionLimit { max: usize },

    #[error("position already open for {coin}")]
    DuplicatePosition { coin: String },

    #[error("daily loss limit reached: {loss} >= {limit}")]
    DailyLossLimit { loss: Decimal, limit: Decimal },

    #[error("{coin} in cooldown for another {remaining_secs}s")]
    Cooldown { coin: String, remaining_secs: u64 },
}

/// Result of closing a position.
#[derive(Debug, Clone, Serialize)]
pub struct ClosedTrade {
    pub coin: String,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub amount: Decimal,
    pub cost_basis: Decimal,
    pub proceeds: Decimal,
    pub pnl: Decimal,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

/// Per-session trading state. Mutated only under the session's write lock.
#[derive(Debug)]
pub struct TradingState {
    positions: HashMap<String, Position>,
    available_budget: Decimal,
    reserved_budget: Decimal,
    daily_trades: u32,
    daily_loss: Decimal,
    last_trade_at: HashMap<String, Instant>,
    trading_day: NaiveDate,
    risk: RiskConfig,
}

impl TradingState {
    pub fn new(budget: Decimal, risk: RiskConfig) -> Self {
        Self {
            positions: HashMap::new(),
            available_budget: budget,
            reserved_budget: Decimal::ZERO,
            daily_trades: 0,
            daily_loss: Decimal::ZERO,
            last_trade_at: HashMap::new(),
            trading_day: Utc::now().date_naive(),
            risk,
        }
    }

    pub fn risk(&self) -> &RiskConfig {
        &self.risk
    }

    pub fn available_budget(&self) -> Decimal {
        self.available_budget
    }

    pub fn reserved_budget(&self) -> Decimal {
        self.reserved_budget
    }

    /// Available plus reserved.
    pub fn total_budget(&self) -> Decimal {
        self.available_budget + self.reserved_budget
    }

    pub fn daily_trades(&self) -> u32 {
        self.daily_trades
    }

    pub fn daily_loss(&self) -> Decimal {
        self.daily_loss
    }

    pub fn daily_loss_exceeded(&self) -> bool {
        self.daily_loss >= self.risk.daily_loss_limit
    }

    pub fn position(&self, coin: &str) -> Option<&Position> {
        self.positions.get(coin)
    }

    pub fn position_mut(&mut self, coin: &str) -> Option<&mut Position> {
        self.positions.get_mut(coin)
    }

    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    pub fn position_count(&self) -> usize {
        self.positions.len()
    }

    pub fn coins(&self) -> Vec<String> {
        let mut coins: Vec<String> = self.positions.keys().cloned().collect();
        coins.sort();
        coins
    }

    /// Single gate for new entries.
    pub fn check_trade(&self, coin: &str, amount: Decimal) -> Result<(), TradeRejection> {
        self.check_trade_at(coin, amount, Instant::now())
    }

    pub fn can_trade(&self, coin: &str, amount: Decimal) -> bool {
        self.check_trade(coin, amount).is_ok()
    }

    fn check_trade_at(&self, coin: &str, amount: Decimal, now: Instant) -> Result<(), TradeRejection> {
        if self.available_budget <= Decimal::ZERO || self.available_budget < amount {
            return Err(TradeRejection::InsufficientBudget {
                needed: amount,
                available: self.available_budget,
            });
        }
        if self.positions.len() >= self.risk.max_positions {
            return Err(TradeRejection::PositionLimit {
                max: self.risk.max_positions,
            });
        }
        if self.positions.contains_key(coin) {
            return Err(TradeRejection::DuplicatePosition {
                coin: coin.to_string(),
            });
        }
        if self.daily_loss_exceeded() {
            return Err(TradeRejection::DailyLossLimit {
                loss: self.daily_loss,
                limit: self.risk.daily_loss_limit,
            });
        }
        if let Some(last) = self.last_trade_at.get(coin) {
            let elapsed = now.saturating_duration_since(*last);
            if elapsed < self.risk.coin_cooldown {
                return Err(TradeRejection::Cooldown {
                    coin: coin.to_string(),
                    remaining_secs: (self.risk.coin_cooldown - elapsed).as_secs(),
                });
            }
        }
        Ok(())
    }

    /// Whether `coin` is still inside its cooldown window.
    pub fn in_cooldown(&self, coin: &str) -> bool {
        self.last_trade_at
            .get(coin)
            .is_some_and(|last| last.elapsed() < self.risk.coin_cooldown)
    }

    /// Record a filled entry, moving its cost from available to reserved.
    pub fn open_position(&mut self, position: Position) -> Result<(), TradeRejection> {
        self.check_trade(&position.coin, position.cost_basis)?;

        let cost = position.cost_basis;
        self.available_budget -= cost;
        self.reserved_budget += cost;
        self.daily_trades += 1;
        self.last_trade_at.insert(position.coin.clone(), Instant::now());

        info!(
            coin = %position.coin,
            entry = %position.entry_price,
            amount = %position.amount,
            cost = %cost,
            available = %self.available_budget,
            "Position opened"
        );
        self.positions.insert(position.coin.clone(), position);
        Ok(())
    }

    /// Close the whole position at `exit_price`.
    pub fn close_position(&mut self, coin: &str, exit_price: Decimal) -> Option<ClosedTrade> {
        let position = self.positions.remove(coin)?;
        let proceeds = position.amount * exit_price;
        let pnl = proceeds - position.cost_basis;

        self.reserved_budget -= position.cost_basis;
        self.available_budget += proceeds;
        if pnl < Decimal::ZERO {
            self.daily_loss += pnl.abs();
        }

        info!(
            coin = %coin,
            exit = %exit_price,
            pnl = %pnl,
            daily_loss = %self.daily_loss,
            "Position closed"
        );

        Some(ClosedTrade {
            coin: position.coin,
            entry_price: position.entry_price,
            exit_price,
            amount: position.amount,
            cost_basis: position.cost_basis,
            proceeds,
            pnl,
            opened_at: position.entry_time,
            closed_at: Utc::now(),
        })
    }

    /// Sell `fraction` of a position at `price`; the rest stays open.
    pub fn partial_close(
        &mut self,
        coin: &str,
        fraction: Decimal,
        price: Decimal,
    ) -> Option<ClosedTrade> {
        let position = self.positions.get_mut(coin)?;
        let entry_price = position.entry_price;
        let opened_at = position.entry_time;
        let (units, cost) = position.reduce(fraction);
        position.partial_taken = true;

        let proceeds = units * price;
        let pnl = proceeds - cost;
        self.reserved_budget -= cost;
        self.available_budget += proceeds;
        if pnl < Decimal::ZERO {
            self.daily_loss += pnl.abs();
        }
        debug!(coin = %coin, units = %units, pnl = %pnl, "Partial close");

        Some(ClosedTrade {
            coin: coin.to_string(),
            entry_price,
            exit_price: price,
            amount: units,
            cost_basis: cost,
            proceeds,
            pnl,
            opened_at,
            closed_at: Utc::now(),
        })
    }

    /// Reset daily counters when the UTC date changes. Returns true on roll-over.
    pub fn roll_day(&mut self, today: NaiveDate) -> bool {
        if today == self.trading_day {
            return false;
        }
        info!(
            previous = %self.trading_day,
            trades = self.daily_trades,
            loss = %self.daily_loss,
            "New trading day, resetting daily counters"
        );
        self.trading_day = today;
        self.daily_trades = 0;
        self.daily_loss = Decimal::ZERO;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn make_state(budget: Decimal) -> TradingState {
        TradingState::new(budget, RiskConfig::default())
    }

    fn make_position(coin: &str, entry: Decimal, amount: Decimal) -> Position {
        Position::new(
            coin,
            entry,
            amount,
            entry * amount,
            entry * dec!(1.025),
            entry * dec!(0.99),
            Duration::from_secs(600),
        )
    }

    #[tokio::test]
    async fn test_open_moves_budget_to_reserved() {
        let mut state = make_state(dec!(1000000));
        state.open_position(make_position("BTC", dec!(100), dec!(1000))).unwrap();

        assert_eq!(state.available_budget(), dec!(900000));
        assert_eq!(state.reserved_budget(), dec!(100000));
        assert_eq!(state.total_budget(), dec!(1000000));
        assert_eq!(state.daily_trades(), 1);
    }

    #[tokio::test]
    async fn test_close_changes_total_by_pnl() {
        let mut state = make_state(dec!(1000000));
        state.open_position(make_position("BTC", dec!(100), dec!(1000))).unwrap();

        let trade = state.close_position("BTC", dec!(103)).unwrap();
        assert_eq!(trade.pnl, dec!(3000));
        assert_eq!(state.total_budget(), dec!(1003000));
        assert_eq!(state.reserved_budget(), Decimal::ZERO);
        assert_eq!(state.daily_loss(), Decimal::ZERO);
        assert!(state.position("BTC").is_none());
    }

    #[tokio::test]
    async fn test_loss_accumulates_and_blocks_entries() {
        let mut state = make_state(dec!(10000000));
        state.open_position(make_position("ETH", dec!(100), dec!(10000))).unwrap();
        let trade = state.close_position("ETH", dec!(94)).unwrap();
        assert_eq!(trade.pnl, dec!(-60000));
        assert!(state.daily_loss_exceeded());

        assert!(matches!(
            state.check_trade("XRP", dec!(1000)),
            Err(TradeRejection::DailyLossLimit { .. })
        ));

        assert!(state.roll_day(Utc::now().date_naive() + chrono::Days::new(1)));
        assert!(state.can_trade("XRP", dec!(1000)));
    }

    #[tokio::test]
    async fn test_rejections() {
        let mut state = make_state(dec!(100000));
        assert!(matches!(
            state.check_trade("BTC", dec!(200000)),
            Err(TradeRejection::InsufficientBudget { .. })
        ));

        state.open_position(make_position("BTC", dec!(100), dec!(10))).unwrap();
        assert!(matches!(
            state.check_trade("BTC", dec!(1000)),
            Err(TradeRejection::DuplicatePosition { .. })
        ));

        for coin in ["A", "B", "C", "D"] {
            state.open_position(make_position(coin, dec!(10), dec!(10))).unwrap();
        }
        assert!(matches!(
            state.check_trade("E", dec!(100)),
            Err(TradeRejection::PositionLimit { max: 5 })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_after_close() {
        let mut state = make_state(dec!(1000000));
        state.open_position(make_position("BTC", dec!(100), dec!(10))).unwrap();
        state.close_position("BTC", dec!(100));

        assert!(matches!(
            state.check_trade("BTC", dec!(1000)),
            Err(TradeRejection::Cooldown { .. })
        ));
        assert!(state.in_cooldown("BTC"));

        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(state.can_trade("BTC", dec!(1000)));
    }

    #[tokio::test]
    async fn test_partial_close_is_proportional() {
        let mut state = make_state(dec!(1000000));
        state.open_position(make_position("BTC", dec!(100), dec!(100))).unwrap();

        let part = state.partial_close("BTC", dec!(0.5), dec!(110)).unwrap();
        assert_eq!(part.amount, dec!(50));
        assert_eq!(part.pnl, dec!(500));
        assert_eq!(state.reserved_budget(), dec!(5000));
        assert_eq!(state.available_budget(), dec!(990000) + dec!(5500));

        let pos = state.position("BTC").unwrap();
        assert!(pos.partial_taken);
        assert_eq!(pos.amount, dec!(50));
    }
}
