//! Entry signal scoring from minute candles.
//!
//! Gates, in order:
//! 1. Volume surge: mean of the last 3 volumes over the earlier window mean
//! 2. Five-candle price change
//! 3. Technical score (EMA cross, RSI band, VWAP, short trend, volume uptick)
//! 4. Candle pattern score
//! 5. Combined strength against the market's confidence threshold

use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use super::config::MarketParams;
use super::indicators;
use crate::api::{Candle, ExchangeClient};
use crate::error::ExchangeError;

/// Fewest candles a decision is made on.
pub const MIN_CANDLES: usize = 20;

const PASSING_SCORE: u32 = 50;
const SURGE_RECENT: usize = 3;
const PRICE_LOOKBACK: usize = 5;

/// First gate a market failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SignalGate {
    InsufficientData,
    VolumeSurge,
    PriceChange,
    Technical,
    CandlePattern,
    Strength,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TechnicalScore {
    pub score: u32,
    pub ema_fast: f64,
    pub ema_slow: f64,
    pub rsi: f64,
    pub vwap: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PatternScore {
    pub score: u32,
    pub candle_position: Option<f64>,
}

/// Every sub-score for one market, whether or not it passed.
#[derive(Debug, Clone, Serialize)]
pub struct SignalReport {
    pub market: String,
    pub candles: usize,
    pub current_price: f64,
    pub volume_ratio: Option<f64>,
    pub price_change_pct: f64,
    pub technical: TechnicalScore,
    pub pattern: PatternScore,
    /// 0 to 100
    pub strength: u32,
    pub threshold: f64,
    pub failed_gate: Option<SignalGate>,
}

/// An accepted buy signal.
#[derive(Debug, Clone, Serialize)]
pub struct SignalResult {
    pub market: String,
    pub strength: u32,
    /// `strength / 100`
    pub confidence: f64,
    pub current_price: f64,
    pub volume_ratio: f64,
    pub price_change_pct: f64,
    pub technical_score: u32,
    pub pattern_score: u32,
    pub reason: String,
}

/// Whether a strength clears a 0-1 threshold.
pub fn meets_threshold(strength: u32, threshold: f64) -> bool {
    strength as f64 + 1e-9 >= threshold * 100.0
}

impl SignalReport {
    pub fn passed(&self) -> bool {
        self.failed_gate.is_none()
    }

    pub fn into_signal(self) -> Option<SignalResult> {
        if !self.passed() {
            return None;
        }
        let volume_ratio = self.volume_ratio.unwrap_or(0.0);
        Some(SignalResult {
            reason: format!(
                "volume surge {:.1}x, price +{:.2}%",
                volume_ratio, self.price_change_pct
            ),
            market: self.market,
            strength: self.strength,
            confidence: self.strength as f64 / 100.0,
            current_price: self.current_price,
            volume_ratio,
            price_change_pct: self.price_change_pct,
            technical_score: self.technical.score,
            pattern_score: self.pattern.score,
        })
    }
}

/// Scores candles; fetches them through the given client.
pub struct SignalAnalyzer {
    client: Arc<dyn ExchangeClient>,
    candle_unit: u32,
}

impl SignalAnalyzer {
    pub fn new(client: Arc<dyn ExchangeClient>, candle_unit: u32) -> Self {
        Self {
            client,
            candle_unit,
        }
    }

    fn candle_count(params: &MarketParams) -> usize {
        params.volume_window.max(MIN_CANDLES)
    }

    /// Buy signal for `market`, or `None` when data is short or a gate fails.
    pub async fn evaluate(
        &self,
        market: &str,
        params: &MarketParams,
    ) -> Result<Option<SignalResult>, ExchangeError> {
        Ok(self.evaluate_detailed(market, params).await?.into_signal())
    }

    /// Full report including the first failed gate.
    pub async fn evaluate_detailed(
        &self,
        market: &str,
        params: &MarketParams,
    ) -> Result<SignalReport, ExchangeError> {
        let candles = self
            .client
            .get_candles(market, self.candle_unit, Self::candle_count(params))
            .await?;
        let report = analyze(market, &candles, params);
        debug!(
            market = %market,
            strength = report.strength,
            failed = ?report.failed_gate,
            "Signal evaluated"
        );
        Ok(report)
    }
}

/// Score a candle series, oldest first.
pub fn analyze(market: &str, candles: &[Candle], params: &MarketParams) -> SignalReport {
    let mut report = SignalReport {
        market: market.to_string(),
        candles: candles.len(),
        current_price: candles.last().map(|c| c.close).unwrap_or(0.0),
        volume_ratio: None,
        price_change_pct: 0.0,
        technical: TechnicalScore::default(),
        pattern: PatternScore::default(),
        strength: 0,
        threshold: params.mtfa_threshold,
        failed_gate: None,
    };
    if candles.len() < MIN_CANDLES {
        report.failed_gate = Some(SignalGate::InsufficientData);
        return report;
    }

    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let window = &candles[candles.len().saturating_sub(params.volume_window.max(MIN_CANDLES))..];
    let volumes: Vec<f64> = window.iter().map(|c| c.volume).collect();

    report.volume_ratio = indicators::volume_surge_ratio(&volumes, SURGE_RECENT);
    report.price_change_pct = indicators::price_change_pct(&closes, PRICE_LOOKBACK);
    report.technical = technical_score(candles, &closes, params);
    report.pattern = pattern_score(candles, params);

    let surge = report.volume_ratio.filter(|r| *r >= params.volume_multiplier);
    report.strength = strength(
        surge,
        report.technical.score,
        report.pattern.score,
        report.price_change_pct,
    );

    report.failed_gate = first_failed_gate(&report, params);
    report
}

fn first_failed_gate(report: &SignalReport, params: &MarketParams) -> Option<SignalGate> {
    let surge = report.volume_ratio.filter(|r| *r >= params.volume_multiplier);
    if surge.is_none() {
        Some(SignalGate::VolumeSurge)
    } else if report.price_change_pct < params.price_change_threshold {
        Some(SignalGate::PriceChange)
    } else if report.technical.score < PASSING_SCORE {
        Some(SignalGate::Technical)
    } else if report.pattern.score < PASSING_SCORE {
        Some(SignalGate::CandlePattern)
    } else if !meets_threshold(report.strength, params.mtfa_threshold) {
        Some(SignalGate::Strength)
    } else {
        None
    }
}

fn technical_score(candles: &[Candle], closes: &[f64], params: &MarketParams) -> TechnicalScore {
    let ema_fast = indicators::ema(closes, params.ema_fast);
    let ema_slow = indicators::ema(closes, params.ema_slow);
    let rsi = indicators::rsi(closes, params.rsi_period);
    let vwap = indicators::vwap(candles);
    let n = closes.len();

    let mut score = 0;
    if ema_fast > ema_slow {
        score += 25;
    }
    if rsi > 30.0 && rsi < 70.0 {
        score += 20;
    }
    if closes[n - 1] > vwap {
        score += 25;
    }
    if closes[n - 1] > closes[n - 3] {
        score += 15;
    }
    if candles[n - 1].volume > candles[n - 2].volume {
        score += 15;
    }

    TechnicalScore {
        score,
        ema_fast,
        ema_slow,
        rsi,
        vwap,
    }
}

fn pattern_score(candles: &[Candle], params: &MarketParams) -> PatternScore {
    let latest = &candles[candles.len() - 1];
    let prev = &candles[candles.len() - 2];
    let position = indicators::candle_position(latest);

    let mut score = 0;
    if latest.is_bullish() {
        score += 30;
    }
    if latest.close > prev.close {
        score += 25;
    }
    if position.is_some_and(|p| p >= params.candle_position) {
        score += 25;
    }
    if latest.volume > prev.volume && latest.close > prev.close {
        score += 20;
    }

    PatternScore {
        score,
        candle_position: position,
    }
}

/// Combined 0-100 strength. Weighted parts are summed in tenths and truncated.
fn strength(surge: Option<f64>, technical: u32, pattern: u32, price_change_pct: f64) -> u32 {
    let volume_points = match surge {
        Some(r) if r >= 3.0 => 30,
        Some(r) if r >= 2.0 => 20,
        Some(r) if r >= 1.5 => 15,
        _ => 0,
    };
    let price_points = if price_change_pct >= 1.0 {
        20
    } else if price_change_pct >= 0.5 {
        15
    } else if price_change_pct >= 0.3 {
        10
    } else if price_change_pct >= 0.1 {
        5
    } else {
        0
    };

    let tenths = (volume_points + price_points) * 10 + (technical * 3).min(300) + (pattern * 2).min(200);
    (tenths / 10).min(100)
}
