//! Trading logic: signals, sizing, exit strategy, state, price lookup and fill verification.

mod config;
pub mod indicators;
mod position_sizer;
mod price;
pub(crate) mod signal;
mod state;
mod strategy;
mod verifier;

pub use config::{confidence_levels, MarketParams, RiskConfig, StrategyTable, DEFAULT_MARKETS};
pub use position_sizer::PositionSizer;
pub use price::{PriceCache, PriceResolver, PriceResolverConfig, PriceSource, ResolvedPrice};
pub use signal::{
    analyze, meets_threshold, PatternScore, SignalAnalyzer, SignalGate, SignalReport, SignalResult,
    TechnicalScore, MIN_CANDLES,
};
pub use state::{ClosedTrade, TradeRejection, TradingState};
pub use strategy::{resolve_exit_levels, ExitDecision, ExitPolicy, ExitReason};
pub use verifier::{OrderVerifier, VerifierConfig};
