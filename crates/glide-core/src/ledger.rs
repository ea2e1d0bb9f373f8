//! Token accounting for a rental session.
//!
//! Every billable event credits one category of the ledger; the running
//! total is maintained alongside the categories so that
//! `total == unlock + time + distance` holds at every observable point.

use serde::{Deserialize, Serialize};

use crate::config::PricingConfig;

/// Charge category, one per billable event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargeCategory {
    /// One-time unlock charge at session start.
    Unlock,
    /// Elapsed-time meter charge.
    Time,
    /// Distance increment charge.
    Distance,
}

impl ChargeCategory {
    /// Stable category name for logs and journal entries.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Unlock => "unlock",
            Self::Time => "time",
            Self::Distance => "distance",
        }
    }
}

/// Running token consumption, broken out by charge category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenLedger {
    /// Tokens consumed by the unlock charge.
    pub unlock: u64,

    /// Tokens consumed by elapsed-time charges.
    pub time: u64,

    /// Tokens consumed by distance charges.
    pub distance: u64,

    /// Sum of all categories.
    pub total: u64,
}

impl TokenLedger {
    /// Create an empty ledger.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            unlock: 0,
            time: 0,
            distance: 0,
            total: 0,
        }
    }

    /// Credit `tokens` to `category`, updating the total in the same step.
    pub const fn credit(&mut self, category: ChargeCategory, tokens: u64) {
        match category {
            ChargeCategory::Unlock => self.unlock = self.unlock.saturating_add(tokens),
            ChargeCategory::Time => self.time = self.time.saturating_add(tokens),
            ChargeCategory::Distance => self.distance = self.distance.saturating_add(tokens),
        }
        self.total = self.total.saturating_add(tokens);
    }

    /// Whether the total equals the sum of the categories.
    #[must_use]
    pub const fn is_balanced(&self) -> bool {
        self.unlock
            .saturating_add(self.time)
            .saturating_add(self.distance)
            == self.total
    }
}

/// Pricing terms applied to a session's token total.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pricing {
    /// Price in currency minor units per 1000 tokens.
    pub price_per_thousand: u64,

    /// ISO currency code.
    pub currency: String,
}

impl Pricing {
    /// Amount due in minor units for `tokens`, truncating fractional units.
    #[must_use]
    pub const fn amount_due(&self, tokens: u64) -> u64 {
        tokens.saturating_mul(self.price_per_thousand) / 1000
    }
}

impl From<&PricingConfig> for Pricing {
    fn from(config: &PricingConfig) -> Self {
        Self {
            price_per_thousand: config.price_per_thousand,
            currency: config.currency.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credit_updates_category_and_total() {
        let mut ledger = TokenLedger::new();
        ledger.credit(ChargeCategory::Unlock, 10);
        ledger.credit(ChargeCategory::Time, 2);
        ledger.credit(ChargeCategory::Time, 2);
        ledger.credit(ChargeCategory::Distance, 5);

        assert_eq!(ledger.unlock, 10);
        assert_eq!(ledger.time, 4);
        assert_eq!(ledger.distance, 5);
        assert_eq!(ledger.total, 19);
        assert!(ledger.is_balanced());
    }

    #[test]
    fn test_empty_ledger_is_balanced() {
        assert!(TokenLedger::new().is_balanced());
        assert_eq!(TokenLedger::new().total, 0);
    }

    #[test]
    fn test_amount_due_truncates() {
        let pricing = Pricing {
            price_per_thousand: 25,
            currency: "USD".to_string(),
        };
        assert_eq!(pricing.amount_due(1000), 25);
        assert_eq!(pricing.amount_due(80), 2);
        // 31 tokens at 25/1000 is 0.775 minor units, truncated
        assert_eq!(pricing.amount_due(31), 0);
        assert_eq!(pricing.amount_due(0), 0);
    }

    #[test]
    fn test_pricing_from_config_defaults() {
        let pricing = Pricing::from(&crate::config::PricingConfig::default());
        assert_eq!(pricing.price_per_thousand, 25);
        assert_eq!(pricing.currency, "USD");
    }
}

#[cfg(test)]
mod proptests {
    use proptest::prelude::*;

    use super::*;

    /// Strategy for generating per-event token amounts (tariff-sized).
    fn token_amount() -> impl Strategy<Value = u64> {
        0u64..1_000
    }

    /// Strategy for generating an arbitrary credit sequence.
    fn credit_sequence() -> impl Strategy<Value = Vec<(ChargeCategory, u64)>> {
        prop::collection::vec(
            (
                prop_oneof![
                    Just(ChargeCategory::Unlock),
                    Just(ChargeCategory::Time),
                    Just(ChargeCategory::Distance),
                ],
                token_amount(),
            ),
            0..64,
        )
    }

    proptest! {
        /// Property: the ledger stays balanced after any credit sequence.
        #[test]
        fn prop_ledger_always_balanced(credits in credit_sequence()) {
            let mut ledger = TokenLedger::new();
            for (category, tokens) in credits {
                ledger.credit(category, tokens);
            }
            prop_assert!(ledger.is_balanced());
        }

        /// Property: the total never decreases as credits are applied.
        #[test]
        fn prop_total_monotonic(credits in credit_sequence()) {
            let mut ledger = TokenLedger::new();
            let mut previous = 0u64;
            for (category, tokens) in credits {
                ledger.credit(category, tokens);
                prop_assert!(ledger.total >= previous);
                previous = ledger.total;
            }
        }

        /// Property: amount due is monotone in the token count.
        #[test]
        fn prop_amount_due_monotone(
            tokens_a in 0u64..1_000_000,
            tokens_b in 0u64..1_000_000,
            price in 0u64..10_000,
        ) {
            let pricing = Pricing {
                price_per_thousand: price,
                currency: "USD".to_string(),
            };
            if tokens_a <= tokens_b {
                prop_assert!(pricing.amount_due(tokens_a) <= pricing.amount_due(tokens_b));
            }
        }
    }
}
