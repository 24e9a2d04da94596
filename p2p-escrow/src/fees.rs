//! Fee policy - platform fee charged on matched trades
//!
//! Fees are an injected collaborator rather than constants baked into the
//! engine. The computed fee is recorded on the trade for reporting; the
//! escrowed quantity released to the buyer is not reduced by it.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::Advertisement;

/// Configuration for the default percentage fee
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeeConfig {
    /// Fee as a percentage of the traded quantity (0.5 = 0.5%)
    pub rate_percent: Decimal,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            rate_percent: Decimal::new(5, 1), // 0.5%
        }
    }
}

/// Computes the platform fee for a trade
pub trait FeePolicy: Send + Sync {
    /// Fee, denominated in the ad's asset, for trading `quantity` against `ad`
    fn fee_for(&self, ad: &Advertisement, quantity: Decimal) -> Decimal;
}

/// Charges nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFee;

impl FeePolicy for NoFee {
    fn fee_for(&self, _ad: &Advertisement, _quantity: Decimal) -> Decimal {
        Decimal::ZERO
    }
}

/// Flat percentage of the traded quantity
#[derive(Debug, Clone)]
pub struct PercentageFee {
    rate_percent: Decimal,
}

impl PercentageFee {
    pub fn new(config: &FeeConfig) -> Self {
        Self {
            rate_percent: config.rate_percent,
        }
    }
}

impl Default for PercentageFee {
    fn default() -> Self {
        Self::new(&FeeConfig::default())
    }
}

impl FeePolicy for PercentageFee {
    fn fee_for(&self, _ad: &Advertisement, quantity: Decimal) -> Decimal {
        (quantity * self.rate_percent / Decimal::ONE_HUNDRED).normalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AdSide, AdStatus};
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn ad() -> Advertisement {
        Advertisement {
            id: Uuid::new_v4(),
            owner: "owner".to_string(),
            side: AdSide::Sell,
            asset: "BTC".to_string(),
            fiat_currency: "USD".to_string(),
            price: dec!(60000),
            total_quantity: dec!(1),
            remaining_quantity: dec!(1),
            min_amount: dec!(100),
            max_amount: dec!(60000),
            payment_methods: vec![],
            terms: None,
            auto_reply: None,
            time_limit_minutes: 30,
            status: AdStatus::Active,
            completed_trades: 0,
            total_volume: Decimal::ZERO,
            version: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_percentage_fee() {
        let fees = PercentageFee::default();
        assert_eq!(fees.fee_for(&ad(), dec!(2)), dec!(0.01));
        assert_eq!(NoFee.fee_for(&ad(), dec!(2)), Decimal::ZERO);
    }
}
