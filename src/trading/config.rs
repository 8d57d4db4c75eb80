//! Per-market strategy parameters and session risk limits.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Tuned parameters for one market.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketParams {
    /// Take-profit distance in percent
    pub profit_target_pct: Decimal,

    /// Stop-loss distance in percent (negative)
    pub stop_loss_pct: Decimal,

    pub max_hold_minutes: u64,

    /// Minimum signal confidence (0.0 to 1.0) to enter
    pub mtfa_threshold: f64,

    // === Signal gates ===
    /// Recent volume must be this multiple of the window average
    pub volume_multiplier: f64,

    /// Minimum 5-candle price change in percent
    pub price_change_threshold: f64,

    /// Minimum close position within the candle range (0.0 to 1.0)
    pub candle_position: f64,

    pub rsi_period: usize,
    pub ema_fast: usize,
    pub ema_slow: usize,
    pub volume_window: usize,
}

impl Default for MarketParams {
    fn default() -> Self {
        Self {
            profit_target_pct: dec!(3.0),
            stop_loss_pct: dec!(-1.0),
            max_hold_minutes: 30,
            mtfa_threshold: 0.80,
            volume_multiplier: 1.3,
            price_change_threshold: 0.15,
            candle_position: 0.6,
            rsi_period: 14,
            ema_fast: 5,
            ema_slow: 10,
            volume_window: 20,
        }
    }
}

impl MarketParams {
    fn tuned(tp: Decimal, sl: Decimal, max_hold_minutes: u64, threshold: f64) -> Self {
        Self {
            profit_target_pct: tp,
            stop_loss_pct: sl,
            max_hold_minutes,
            mtfa_threshold: threshold,
            ..Self::default()
        }
    }

    pub fn max_hold(&self) -> Duration {
        Duration::from_secs(self.max_hold_minutes * 60)
    }
}

/// Market id to parameters. Unknown markets use the `KRW-BTC` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyTable {
    markets: HashMap<String, MarketParams>,
}

const FALLBACK_MARKET: &str = "KRW-BTC";

/// Markets traded when none are configured.
pub const DEFAULT_MARKETS: [&str; 10] = [
    "KRW-IOTA", "KRW-WCT", "KRW-GMT", "KRW-BTC", "KRW-MEW",
    "KRW-ETH", "KRW-SHIB", "KRW-PEPE", "KRW-ANIME", "KRW-LPT",
];

impl Default for StrategyTable {
    fn default() -> Self {
        let rows = [
            ("KRW-IOTA", dec!(2.5), dec!(-1.0), 5, 0.80),
            ("KRW-WCT", dec!(3.0), dec!(-1.0), 20, 0.80),
            ("KRW-GMT", dec!(2.5), dec!(-1.0), 5, 0.85),
            ("KRW-BTC", dec!(3.0), dec!(-1.0), 30, 0.80),
            ("KRW-MEW", dec!(3.0), dec!(-0.2), 5, 0.82),
            ("KRW-ETH", dec!(2.5), dec!(-1.0), 10, 0.80),
            ("KRW-SHIB", dec!(2.5), dec!(-1.0), 10, 0.83),
            ("KRW-PEPE", dec!(1.5), dec!(-0.6), 10, 0.85),
            ("KRW-ANIME", dec!(3.0), dec!(-0.8), 5, 0.82),
            ("KRW-LPT", dec!(2.5), dec!(-1.0), 60, 0.80),
        ];
        let markets = rows
            .into_iter()
            .map(|(m, tp, sl, hold, th)| (m.to_string(), MarketParams::tuned(tp, sl, hold, th)))
            .collect();
        Self { markets }
    }
}

impl StrategyTable {
    pub fn get(&self, market: &str) -> MarketParams {
        self.markets
            .get(market)
            .or_else(|| self.markets.get(FALLBACK_MARKET))
            .cloned()
            .unwrap_or_default()
    }

    pub fn insert(&mut self, market: &str, params: MarketParams) {
        self.markets.insert(market.to_string(), params);
    }

    /// Sorted view for display.
    pub fn entries(&self) -> Vec<(&str, &MarketParams)> {
        let mut out: Vec<_> = self.markets.iter().map(|(k, v)| (k.as_str(), v)).collect();
        out.sort_by(|a, b| a.0.cmp(b.0));
        out
    }

    /// Default table with overrides from a JSON object of market id to params.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading strategy table {}", path.display()))?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let overrides: HashMap<String, MarketParams> =
            serde_json::from_str(raw).context("parsing strategy table")?;
        let mut table = Self::default();
        table.markets.extend(overrides);
        Ok(table)
    }
}

/// Take-profit and stop-loss percent scaled by signal confidence.
pub fn confidence_levels(confidence: f64) -> (Decimal, Decimal) {
    const BANDS: [(f64, f64, Decimal, Decimal); 3] = [
        (0.80, 0.85, dec!(0.6), dec!(-0.4)),
        (0.85, 0.92, dec!(0.9), dec!(-0.45)),
        (0.92, 1.01, dec!(1.2), dec!(-0.5)),
    ];
    BANDS
        .iter()
        .find(|(lo, hi, _, _)| (*lo..*hi).contains(&confidence))
        .map(|(_, _, tp, sl)| (*tp, *sl))
        .unwrap_or((dec!(0.5), dec!(-0.3)))
}

/// Session risk limits checked before every entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    pub max_positions: usize,

    /// Realized KRW loss per day after which entries stop
    pub daily_loss_limit: Decimal,

    /// Minimum time between entries in the same coin
    pub coin_cooldown: Duration,

    /// Cap on a single entry in KRW
    pub max_investment: Decimal,

    /// Fraction of the available budget a single entry may use
    pub max_budget_fraction: Decimal,

    /// Exchange minimum order size in KRW
    pub min_order_krw: Decimal,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_positions: 5,
            daily_loss_limit: dec!(50000),
            coin_cooldown: Duration::from_secs(300),
            max_investment: dec!(200000),
            max_budget_fraction: dec!(0.2),
            min_order_krw: dec!(5000),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_market_falls_back_to_btc() {
        let table = StrategyTable::default();
        assert_eq!(table.get("KRW-DOGE"), table.get("KRW-BTC"));
        assert_eq!(table.get("KRW-MEW").stop_loss_pct, dec!(-0.2));
        assert_eq!(table.get("KRW-LPT").max_hold(), Duration::from_secs(3600));
        assert_eq!(table.entries().len(), DEFAULT_MARKETS.len());
    }

    #[test]
    fn test_json_overrides_keep_other_markets() {
        let table = StrategyTable::from_json(
            r#"{"KRW-PEPE": {"profit_target_pct": "2.0", "mtfa_threshold": 0.9}}"#,
        )
        .unwrap();
        let pepe = table.get("KRW-PEPE");
        assert_eq!(pepe.profit_target_pct, dec!(2.0));
        assert_eq!(pepe.mtfa_threshold, 0.9);
        assert_eq!(pepe.rsi_period, 14);
        assert_eq!(table.get("KRW-GMT").mtfa_threshold, 0.85);
    }

    #[test]
    fn test_confidence_bands() {
        assert_eq!(confidence_levels(0.82), (dec!(0.6), dec!(-0.4)));
        assert_eq!(confidence_levels(0.85), (dec!(0.9), dec!(-0.45)));
        assert_eq!(confidence_levels(1.0), (dec!(1.2), dec!(-0.5)));
        assert_eq!(confidence_levels(0.5), (dec!(0.5), dec!(-0.3)));
    }
}
