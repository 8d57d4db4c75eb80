//! Data models for positions and order verifications.

mod position;
mod verification;

pub use position::{Position, TrendDirection};
pub use verification::{TradeVerification, VerificationMetrics, VerificationStatus};
