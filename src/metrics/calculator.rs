//! Summaries over completed fills and closed trades: slippage dispersion,
//! win rate, profit factor and drawdown.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use statrs::statistics::Statistics;

use crate::models::{TradeVerification, VerificationStatus};
use crate::trading::ClosedTrade;

/// Fill quality over verified orders.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionStats {
    pub samples: usize,
    pub mean_slippage_pct: f64,
    pub slippage_std_dev: f64,
    pub worst_slippage_pct: f64,
    pub mean_execution_secs: f64,
    pub high_slippage_share: f64,
}

/// Realized performance of closed trades.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TradeSummary {
    pub trades: usize,
    pub wins: usize,
    pub losses: usize,
    pub win_rate: f64,
    pub total_pnl: Decimal,
    pub avg_win: Decimal,
    pub avg_loss: Decimal,
    pub profit_factor: f64,
    /// Largest peak-to-trough drop of cumulative P&L, in KRW
    pub max_drawdown: Decimal,
}

pub struct MetricsCalculator;

impl MetricsCalculator {
    /// Slippage statistics over verified orders.
    pub fn execution_stats(verifications: &[TradeVerification]) -> ExecutionStats {
        let verified: Vec<&TradeVerification> = verifications
            .iter()
            .filter(|v| v.status == VerificationStatus::Verified)
            .collect();
        if verified.is_empty() {
            return ExecutionStats::default();
        }

        let slippage: Vec<f64> = verified.iter().map(|v| v.slippage_pct).collect();
        let exec: Vec<f64> = verified.iter().map(|v| v.execution_secs).collect();
        let high = verified.iter().filter(|v| v.high_slippage).count();

        let std_dev = if slippage.len() > 1 {
            slippage.iter().std_dev()
        } else {
            0.0
        };

        ExecutionStats {
            samples: verified.len(),
            mean_slippage_pct: slippage.iter().mean(),
            slippage_std_dev: std_dev,
            worst_slippage_pct: slippage.iter().fold(0.0_f64, |acc, s| acc.max(s.abs())),
            mean_execution_secs: exec.iter().mean(),
            high_slippage_share: high as f64 / verified.len() as f64,
        }
    }

    pub fn trade_summary(trades: &[ClosedTrade]) -> TradeSummary {
        if trades.is_empty() {
            return TradeSummary::default();
        }

        let (wins, losses): (Vec<Decimal>, Vec<Decimal>) = trades
            .iter()
            .map(|t| t.pnl)
            .partition(|p| *p > Decimal::ZERO);

        let gross_profit: Decimal = wins.iter().copied().sum();
        let gross_loss: Decimal = losses.iter().map(|l| l.abs()).sum();

        let mut summary = TradeSummary {
            trades: trades.len(),
            wins: wins.len(),
            losses: losses.len(),
            win_rate: wins.len() as f64 / trades.len() as f64,
            total_pnl: gross_profit - gross_loss,
            ..TradeSummary::default()
        };

        if !wins.is_empty() {
            summary.avg_win = gross_profit / Decimal::from(wins.len() as u32);
        }
        if !losses.is_empty() {
            summary.avg_loss = gross_loss / Decimal::from(losses.len() as u32);
        }
        if gross_loss > Decimal::ZERO {
            summary.profit_factor =
                gross_profit.to_f64().unwrap_or(0.0) / gross_loss.to_f64().unwrap_or(1.0);
        }

        let mut equity = Decimal::ZERO;
        let mut peak = Decimal::ZERO;
        for trade in trades {
            equity += trade.pnl;
            peak = peak.max(equity);
            summary.max_drawdown = summary.max_drawdown.max(peak - equity);
        }

        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{OrderKind, OrderSide};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn verified(slippage: f64) -> TradeVerification {
        let mut v = TradeVerification::new("id", "KRW-BTC", OrderSide::Bid, OrderKind::Price, dec!(10000), dec!(100));
        v.status = VerificationStatus::Verified;
        v.slippage_pct = slippage;
        v.high_slippage = slippage.abs() > 0.2;
        v.execution_secs = 2.0;
        v
    }

    fn closed(pnl: Decimal) -> ClosedTrade {
        ClosedTrade {
            coin: "BTC".to_string(),
            entry_price: dec!(100),
            exit_price: dec!(100),
            amount: dec!(1),
            cost_basis: dec!(100),
            proceeds: dec!(100) + pnl,
            pnl,
            opened_at: Utc::now(),
            closed_at: Utc::now(),
        }
    }

    #[test]
    fn test_execution_stats() {
        let mut cancelled = verified(5.0);
        cancelled.status = VerificationStatus::Cancelled;
        let stats = MetricsCalculator::execution_stats(&[
            verified(0.1),
            verified(0.3),
            verified(-0.1),
            cancelled,
        ]);

        assert_eq!(stats.samples, 3);
        assert!((stats.mean_slippage_pct - 0.1).abs() < 1e-9);
        assert!((stats.slippage_std_dev - 0.2).abs() < 1e-9);
        assert!((stats.worst_slippage_pct - 0.3).abs() < 1e-9);
        assert!((stats.high_slippage_share - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(stats.mean_execution_secs, 2.0);
    }

    #[test]
    fn test_trade_summary_drawdown() {
        let summary = MetricsCalculator::trade_summary(&[
            closed(dec!(100)),
            closed(dec!(-50)),
            closed(dec!(-30)),
            closed(dec!(200)),
        ]);

        assert_eq!(summary.trades, 4);
        assert_eq!(summary.wins, 2);
        assert_eq!(summary.total_pnl, dec!(220));
        assert_eq!(summary.avg_loss, dec!(40));
        assert_eq!(summary.max_drawdown, dec!(80));
        assert!((summary.profit_factor - 3.75).abs() < 1e-9);
    }

    #[test]
    fn test_empty_inputs() {
        assert_eq!(MetricsCalculator::execution_stats(&[]).samples, 0);
        assert_eq!(MetricsCalculator::trade_summary(&[]).total_pnl, Decimal::ZERO);
    }
}
