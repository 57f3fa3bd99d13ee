//! Fixed-point money helpers.
//!
//! All monetary fields are `rust_decimal::Decimal`; nothing in the billing path
//! touches floating point. Amounts are persisted and compared at two decimal
//! places, rounded half away from zero.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of decimal places money is stored with.
pub const MONEY_SCALE: u32 = 2;

/// Round an amount to storage precision.
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// `amount * rate / 100`, unrounded.
pub fn percent_of(amount: Decimal, rate: Decimal) -> Decimal {
    amount * rate / Decimal::ONE_HUNDRED
}

/// Clamp a value into `[0, max]`.
pub fn clamp_non_negative(amount: Decimal, max: Decimal) -> Decimal {
    amount.max(Decimal::ZERO).min(max)
}

/// ISO-4217 style currency code, always upper case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Currency(String);

impl Currency {
    pub fn new(code: &str) -> Self {
        Self(code.trim().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Currency {
    fn from(code: &str) -> Self {
        Self::new(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_money_half_away_from_zero() {
        assert_eq!(round_money(Decimal::new(1005, 3)), Decimal::new(101, 2));
        assert_eq!(round_money(Decimal::new(-1005, 3)), Decimal::new(-101, 2));
        assert_eq!(round_money(Decimal::new(1004, 3)), Decimal::new(100, 2));
    }

    #[test]
    fn test_percent_of() {
        assert_eq!(percent_of(Decimal::new(55, 0), Decimal::new(10, 0)), Decimal::new(55, 1));
    }

    #[test]
    fn test_currency_normalized() {
        assert_eq!(Currency::new(" usd ").as_str(), "USD");
    }
}
