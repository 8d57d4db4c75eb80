//! Entry sizing against the session budget.

use rust_decimal::Decimal;

use super::config::RiskConfig;

/// Calculator for entry sizes in KRW.
#[derive(Debug, Clone)]
pub struct PositionSizer {
    risk: RiskConfig,
}

impl PositionSizer {
    pub fn new(risk: RiskConfig) -> Self {
        Self { risk }
    }

    /// KRW to spend on a new entry: `min(max_investment, available × max_budget_fraction)`.
    ///
    /// Returns `None` when the result is below the exchange minimum order.
    pub fn entry_size(&self, available: Decimal) -> Option<Decimal> {
        if available <= Decimal::ZERO {
            return None;
        }
        let size = self
            .risk
            .max_investment
            .min(available * self.risk.max_budget_fraction)
            .floor();

        if size < self.risk.min_order_krw {
            return None;
        }
        Some(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_fraction_of_budget() {
        let sizer = PositionSizer::new(RiskConfig::default());
        assert_eq!(sizer.entry_size(dec!(500000)), Some(dec!(100000)));
    }

    #[test]
    fn test_capped_at_max_investment() {
        let sizer = PositionSizer::new(RiskConfig::default());
        assert_eq!(sizer.entry_size(dec!(10000000)), Some(dec!(200000)));
    }

    #[test]
    fn test_below_minimum_order() {
        let sizer = PositionSizer::new(RiskConfig::default());
        // 20% of 20,000 is under the 5,000 KRW minimum
        assert_eq!(sizer.entry_size(dec!(20000)), None);
        assert_eq!(sizer.entry_size(dec!(25000)), Some(dec!(5000)));
        assert_eq!(sizer.entry_size(Decimal::ZERO), None);
    }

    #[test]
    fn test_whole_won() {
        let sizer = PositionSizer::new(RiskConfig::default());
        assert_eq!(sizer.entry_size(dec!(123456.78)), Some(dec!(24691)));
    }
}
