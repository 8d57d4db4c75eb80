//! Exit rules for open positions and entry exit-level selection.
//!
//! Each tick yields exactly one decision. Rules are checked in order:
//! 1. Risk cutoff
//! 2. Trailing stop
//! 3. Target reached past the trailing extension
//! 4. Partial profit
//! 5. Time-based take-profit
//! 6. Take-profit and stop-loss both touched within the tick
//! 7. Take-profit
//! 8. Stop-loss
//! 9. Max hold time

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::config::{confidence_levels, MarketParams};
use crate::models::Position;

/// Exit rule parameters. Percentages are in percent units (0.2 = 0.2%).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitPolicy {
    // === Trailing stop ===
    /// Peak gain needed before the trailing stop can fire
    pub trailing_activation_pct: Decimal,

    /// Trail distance below the peak
    pub trailing_pct: Decimal,

    /// With trailing on, close outright once price clears target by this much
    pub target_extension_pct: Decimal,

    /// Gains at which profit stages 1-3 are reached; stage 1 enables trailing
    pub profit_stages: [Decimal; 3],

    // === Partial profit ===
    pub partial_trigger_pct: Decimal,
    pub partial_fraction: Decimal,

    /// Exchange minimum order size in KRW for each side of a partial sale
    pub min_order_krw: Decimal,

    // === Time and risk ===
    /// Fraction of max hold after which any gain is taken
    pub time_risk_ratio: f64,

    /// Loss beyond which the position is dumped ahead of other rules
    pub hard_loss_cutoff_pct: Decimal,

    // === Same-tick take-profit / stop-loss tie-break ===
    /// Tick drop treated as a sharp move
    pub sharp_drop_pct: Decimal,

    /// Pullback from peak still counted as low during a sharp drop
    pub low_drawdown_pct: Decimal,

    /// Pullback from peak small enough to keep a prior gain
    pub mild_pullback_pct: Decimal,
}

impl Default for ExitPolicy {
    fn default() -> Self {
        Self {
            trailing_activation_pct: dec!(0.2),
            trailing_pct: dec!(0.1),
            target_extension_pct: dec!(1.0),
            profit_stages: [dec!(0.2), dec!(0.4), dec!(0.6)],

            partial_trigger_pct: dec!(0.3),
            partial_fraction: dec!(0.5),
            min_order_krw: dec!(5000),

            time_risk_ratio: 0.8,
            hard_loss_cutoff_pct: dec!(1.5),

            sharp_drop_pct: dec!(0.3),
            low_drawdown_pct: dec!(1.0),
            mild_pullback_pct: dec!(0.5),
        }
    }
}

/// Reason a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    RiskCutoff,
    TrailingStop,
    TargetReached,
    TimeTakeProfit,
    TakeProfit,
    StopLoss,
    MaxHoldTime,
    Manual,
    Emergency,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::RiskCutoff => "risk_cutoff",
            ExitReason::TrailingStop => "trailing_stop",
            ExitReason::TargetReached => "target_reached",
            ExitReason::TimeTakeProfit => "time_take_profit",
            ExitReason::TakeProfit => "take_profit",
            ExitReason::StopLoss => "stop_loss",
            ExitReason::MaxHoldTime => "max_hold_time",
            ExitReason::Manual => "manual",
            ExitReason::Emergency => "emergency",
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExitDecision {
    Hold,
    Close(ExitReason),
    /// Sell this fraction and keep the rest open
    PartialSale { fraction: Decimal },
}

impl ExitPolicy {
    /// Advance at most one profit stage. Returns the new stage when it moved.
    pub fn advance_stage(&self, position: &mut Position) -> Option<u8> {
        let stage = position.profit_stage as usize;
        if stage >= self.profit_stages.len() || position.profit_pct() < self.profit_stages[stage] {
            return None;
        }
        position.profit_stage += 1;
        if position.profit_stage == 1 && !position.trailing_enabled {
            position.trailing_enabled = true;
            position.trailing_pct = self.trailing_pct;
        }
        debug!(coin = %position.coin, stage = position.profit_stage, "Profit stage reached");
        Some(position.profit_stage)
    }

    /// Decide what to do with `position` after its latest price update.
    pub fn evaluate(&self, position: &Position, now: DateTime<Utc>) -> ExitDecision {
        let price = position.current_price;
        let prev = position.previous_price;
        let gain = position.profit_pct();

        // 1
        if gain <= -self.hard_loss_cutoff_pct {
            return ExitDecision::Close(ExitReason::RiskCutoff);
        }

        // 2
        if let Some(trail) = position.trailing_stop_price(self.trailing_activation_pct) {
            if price <= trail {
                return ExitDecision::Close(ExitReason::TrailingStop);
            }
        }

        // 3
        let extended = position.profit_target * (Decimal::ONE + self.target_extension_pct / dec!(100));
        if position.trailing_enabled && price >= extended {
            return ExitDecision::Close(ExitReason::TargetReached);
        }

        // 4
        if !position.partial_taken && gain >= self.partial_trigger_pct && price < position.profit_target {
            let sold = position.amount * self.partial_fraction * price;
            let kept = position.amount * (Decimal::ONE - self.partial_fraction) * price;
            if sold >= self.min_order_krw && kept >= self.min_order_krw {
                return ExitDecision::PartialSale {
                    fraction: self.partial_fraction,
                };
            }
        }

        // 5
        let held = position.held_for(now).as_secs_f64();
        if gain > Decimal::ZERO && held >= position.max_hold.as_secs_f64() * self.time_risk_ratio {
            return ExitDecision::Close(ExitReason::TimeTakeProfit);
        }

        // 6
        let (low, high) = (prev.min(price), prev.max(price));
        if high >= position.profit_target && low <= position.stop_loss {
            return ExitDecision::Close(self.resolve_touch(position));
        }

        if price >= position.profit_target {
            return ExitDecision::Close(ExitReason::TakeProfit);
        }
        if price <= position.stop_loss {
            return ExitDecision::Close(ExitReason::StopLoss);
        }
        if position.is_expired(now) {
            return ExitDecision::Close(ExitReason::MaxHoldTime);
        }
        ExitDecision::Hold
    }

    /// Which level is assumed hit first when one tick spans both.
    fn resolve_touch(&self, position: &Position) -> ExitReason {
        let prev = position.previous_price;
        let delta = if prev.is_zero() {
            Decimal::ZERO
        } else {
            (position.current_price - prev) / prev * dec!(100)
        };
        let drawdown = position.drawdown_from_peak_pct();

        if delta <= -self.sharp_drop_pct && drawdown <= self.low_drawdown_pct {
            ExitReason::StopLoss
        } else if position.peak_gain_pct() > Decimal::ZERO && drawdown <= self.mild_pullback_pct {
            ExitReason::TakeProfit
        } else {
            ExitReason::StopLoss
        }
    }
}

/// Take-profit and stop-loss prices for a new entry.
///
/// The confidence-scaled levels and the market's static levels are combined
/// conservatively: the nearer target and the wider stop.
pub fn resolve_exit_levels(
    entry_price: Decimal,
    confidence: f64,
    params: &MarketParams,
) -> (Decimal, Decimal) {
    let (conf_tp, conf_sl) = confidence_levels(confidence);
    let tp_pct = conf_tp.min(params.profit_target_pct);
    let sl_pct = conf_sl.abs().max(params.stop_loss_pct.abs());

    let target = entry_price * (Decimal::ONE + tp_pct / dec!(100));
    let stop = entry_price * (Decimal::ONE - sl_pct / dec!(100));
    (target, stop)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn make_position(target: Decimal, stop: Decimal) -> Position {
        Position::new(
            "BTC",
            dec!(100),
            dec!(1000),
            dec!(100000),
            target,
            stop,
            Duration::from_secs(600),
        )
    }

    fn tick(position: &mut Position, policy: &ExitPolicy, price: Decimal) -> ExitDecision {
        position.update_price(price);
        policy.advance_stage(position);
        policy.evaluate(position, Utc::now())
    }

    #[test]
    fn test_jump_through_target_takes_profit() {
        let policy = ExitPolicy::default();
        let mut pos = make_position(dec!(102.5), dec!(99));
        assert_eq!(
            tick(&mut pos, &policy, dec!(103)),
            ExitDecision::Close(ExitReason::TakeProfit)
        );
        assert_eq!(pos.pnl_at(dec!(103)), dec!(3000));
    }

    #[test]
    fn test_stop_loss() {
        let policy = ExitPolicy::default();
        let mut pos = make_position(dec!(102.5), dec!(99));
        assert_eq!(
            tick(&mut pos, &policy, dec!(98.9)),
            ExitDecision::Close(ExitReason::StopLoss)
        );
    }

    #[test]
    fn test_hard_loss_cutoff_comes_first() {
        let policy = ExitPolicy::default();
        let mut pos = make_position(dec!(102.5), dec!(99));
        pos.entry_time = Utc::now() - chrono::Duration::hours(1);
        assert_eq!(
            tick(&mut pos, &policy, dec!(98)),
            ExitDecision::Close(ExitReason::RiskCutoff)
        );
    }

    #[test]
    fn test_hard_loss_cutoff_ignores_a_wider_stop() {
        let policy = ExitPolicy::default();
        let mut pos = make_position(dec!(102.5), dec!(97));
        assert_eq!(
            tick(&mut pos, &policy, dec!(98.4)),
            ExitDecision::Close(ExitReason::RiskCutoff)
        );
    }

    #[test]
    fn test_hard_loss_cutoff_is_configurable() {
        let tight = ExitPolicy {
            hard_loss_cutoff_pct: dec!(0.25),
            ..ExitPolicy::default()
        };
        let mut pos = make_position(dec!(102.5), dec!(99));
        assert_eq!(
            tick(&mut pos, &tight, dec!(99.7)),
            ExitDecision::Close(ExitReason::RiskCutoff)
        );

        let mut pos = make_position(dec!(102.5), dec!(99));
        assert_eq!(tick(&mut pos, &ExitPolicy::default(), dec!(99.7)), ExitDecision::Hold);
    }

    #[test]
    fn test_partial_then_trailing_stop() {
        let policy = ExitPolicy::default();
        let mut pos = make_position(dec!(102.5), dec!(99));

        assert_eq!(tick(&mut pos, &policy, dec!(100.1)), ExitDecision::Hold);
        assert_eq!(
            tick(&mut pos, &policy, dec!(100.5)),
            ExitDecision::PartialSale { fraction: dec!(0.5) }
        );
        assert!(pos.trailing_enabled);
        pos.partial_taken = true;

        assert_eq!(tick(&mut pos, &policy, dec!(100.8)), ExitDecision::Hold);
        // trail = 100.8 * 0.999 = 100.6992
        assert_eq!(
            tick(&mut pos, &policy, dec!(100.65)),
            ExitDecision::Close(ExitReason::TrailingStop)
        );
    }

    #[test]
    fn test_partial_skipped_below_min_order() {
        let policy = ExitPolicy::default();
        let mut pos = Position::new(
            "BTC",
            dec!(100),
            dec!(60),
            dec!(6000),
            dec!(102.5),
            dec!(99),
            Duration::from_secs(600),
        );
        assert_eq!(tick(&mut pos, &policy, dec!(100.5)), ExitDecision::Hold);
    }

    #[test]
    fn test_extension_past_target_with_trailing() {
        let policy = ExitPolicy::default();
        let mut pos = make_position(dec!(102.5), dec!(99));
        pos.trailing_enabled = true;
        pos.trailing_pct = dec!(0.1);
        assert_eq!(
            tick(&mut pos, &policy, dec!(104)),
            ExitDecision::Close(ExitReason::TargetReached)
        );
    }

    #[test]
    fn test_time_take_profit_and_max_hold() {
        let policy = ExitPolicy::default();
        let mut pos = make_position(dec!(102.5), dec!(99));
        pos.entry_time = Utc::now() - chrono::Duration::seconds(500);
        assert_eq!(
            tick(&mut pos, &policy, dec!(100.1)),
            ExitDecision::Close(ExitReason::TimeTakeProfit)
        );

        let mut pos = make_position(dec!(102.5), dec!(99));
        pos.entry_time = Utc::now() - chrono::Duration::seconds(601);
        assert_eq!(
            tick(&mut pos, &policy, dec!(99.9)),
            ExitDecision::Close(ExitReason::MaxHoldTime)
        );
    }

    #[test]
    fn test_same_tick_touch_prefers_stop_on_sharp_drop() {
        let policy = ExitPolicy::default();
        // Narrow band so one tick can span both levels.
        let mut pos = make_position(dec!(100.3), dec!(99.9));
        pos.partial_taken = true;
        pos.previous_price = dec!(100.4);
        pos.current_price = dec!(99.8);
        pos.highest_price = dec!(100.4);
        assert_eq!(
            policy.evaluate(&pos, Utc::now()),
            ExitDecision::Close(ExitReason::StopLoss)
        );
    }

    #[test]
    fn test_same_tick_touch_keeps_gain_on_mild_pullback() {
        let policy = ExitPolicy {
            sharp_drop_pct: dec!(5),
            ..ExitPolicy::default()
        };
        let mut pos = make_position(dec!(100.3), dec!(99.9));
        pos.partial_taken = true;
        pos.previous_price = dec!(100.35);
        pos.current_price = dec!(99.9);
        pos.highest_price = dec!(100.35);
        assert_eq!(
            policy.evaluate(&pos, Utc::now()),
            ExitDecision::Close(ExitReason::TakeProfit)
        );
    }

    #[test]
    fn test_exit_levels_take_conservative_side() {
        let params = MarketParams::default(); // +3.0 / -1.0
        let (target, stop) = resolve_exit_levels(dec!(1000), 0.82, &params);
        // confidence band +0.6 / -0.4
        assert_eq!(target, dec!(1006));
        assert_eq!(stop, dec!(990));

        let tight = MarketParams {
            profit_target_pct: dec!(0.5),
            stop_loss_pct: dec!(-0.2),
            ..MarketParams::default()
        };
        let (target, stop) = resolve_exit_levels(dec!(1000), 0.95, &tight);
        assert_eq!(target, dec!(1005));
        assert_eq!(stop, dec!(995));
    }
}
