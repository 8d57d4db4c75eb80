//! Fill verification records for submitted orders.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::api::{OrderKind, OrderSide};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerificationStatus {
    Pending,
    Verified,
    Cancelled,
    Timeout,
    Failed,
}

impl VerificationStatus {
    pub fn is_final(&self) -> bool {
        !matches!(self, VerificationStatus::Pending)
    }
}

/// Tracks one order from submission until the exchange reports a final state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeVerification {
    pub order_id: String,
    pub market: String,
    pub side: OrderSide,
    pub kind: OrderKind,

    /// KRW for market buys, coin units for market sells
    pub requested_amount: Decimal,
    pub filled_amount: Decimal,

    pub requested_price: Decimal,
    pub avg_fill_price: Decimal,
    pub fee: Decimal,

    pub submitted_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Signed percent difference between fill and requested price
    pub slippage_pct: f64,
    pub execution_secs: f64,
    pub high_slippage: bool,

    pub status: VerificationStatus,
    pub attempts: u32,
    pub errors: Vec<String>,
}

impl TradeVerification {
    pub fn new(
        order_id: impl Into<String>,
        market: impl Into<String>,
        side: OrderSide,
        kind: OrderKind,
        requested_amount: Decimal,
        requested_price: Decimal,
    ) -> Self {
        Self {
            order_id: order_id.into(),
            market: market.into(),
            side,
            kind,
            requested_amount,
            filled_amount: Decimal::ZERO,
            requested_price,
            avg_fill_price: Decimal::ZERO,
            fee: Decimal::ZERO,
            submitted_at: Utc::now(),
            completed_at: None,
            slippage_pct: 0.0,
            execution_secs: 0.0,
            high_slippage: false,
            status: VerificationStatus::Pending,
            attempts: 0,
            errors: Vec::new(),
        }
    }

    /// KRW value of the fill.
    pub fn filled_value(&self) -> Decimal {
        self.filled_amount * self.avg_fill_price
    }
}

/// Running totals over completed verifications.
#[derive(Debug, Clone, Default, Serialize)]
pub struct VerificationMetrics {
    pub total: u64,
    pub verified: u64,
    pub cancelled: u64,
    pub timed_out: u64,
    pub failed: u64,
    pub high_slippage: u64,

    pub avg_slippage_pct: f64,
    pub avg_execution_secs: f64,
    /// Mean of filled / requested over verified orders
    pub avg_fill_rate: f64,

    pub total_fees: Decimal,
    pub total_volume: Decimal,
}

impl VerificationMetrics {
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.verified as f64 / self.total as f64
        }
    }

    /// Fold one completed verification into the totals.
    pub fn record(&mut self, v: &TradeVerification, fill_rate: f64) {
        self.total += 1;
        match v.status {
            VerificationStatus::Verified => {
                self.verified += 1;
                let n = self.verified as f64;
                self.avg_slippage_pct += (v.slippage_pct - self.avg_slippage_pct) / n;
                self.avg_execution_secs += (v.execution_secs - self.avg_execution_secs) / n;
                self.avg_fill_rate += (fill_rate - self.avg_fill_rate) / n;
                self.total_fees += v.fee;
                self.total_volume += v.filled_value();
                if v.high_slippage {
                    self.high_slippage += 1;
                }
            }
            VerificationStatus::Cancelled => self.cancelled += 1,
            VerificationStatus::Timeout => self.timed_out += 1,
            VerificationStatus::Failed | VerificationStatus::Pending => self.failed += 1,
        }
    }
}
