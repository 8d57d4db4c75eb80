//! Execution and performance summaries.

mod calculator;

pub use calculator::{ExecutionStats, MetricsCalculator, TradeSummary};
