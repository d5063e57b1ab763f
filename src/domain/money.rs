//! Exact monetary amount backed by rust_decimal.
//!
//! Volume propagates through every ancestor of a position, so amounts must
//! never pass through floating point.

use rust_decimal::Decimal as RustDecimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::str::FromStr;

/// Monetary amount in the deployment's single currency unit.
///
/// Serializes to a JSON string to keep full precision on the wire.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Money(#[serde(with = "rust_decimal::serde::str")] RustDecimal);

impl Money {
    pub fn new(value: RustDecimal) -> Self {
        Money(value)
    }

    /// Parse an amount from a string losslessly.
    ///
    /// # Errors
    /// Returns an error if the string is not a valid decimal number.
    pub fn from_str_canonical(s: &str) -> Result<Self, rust_decimal::Error> {
        RustDecimal::from_str(s.trim()).map(Money)
    }

    /// Whole units, e.g. `Money::from_units(1000)`.
    pub fn from_units(units: i64) -> Self {
        Money(RustDecimal::from(units))
    }

    /// Format without exponent notation and without trailing zeros.
    pub fn to_canonical_string(&self) -> String {
        format!("{}", self.0.normalize())
    }

    pub fn inner(&self) -> RustDecimal {
        self.0
    }

    pub fn zero() -> Self {
        Money(RustDecimal::ZERO)
    }

    pub fn hundred() -> Self {
        Money(RustDecimal::ONE_HUNDRED)
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn is_positive(&self) -> bool {
        !self.is_zero() && self.0.is_sign_positive()
    }

    pub fn is_negative(&self) -> bool {
        !self.is_zero() && self.0.is_sign_negative()
    }

    pub fn abs(&self) -> Self {
        Money(self.0.abs())
    }

    /// Apply a percentage rate: `self * percent / 100`.
    /// `None` when the product leaves the decimal range.
    pub fn checked_percent_of(&self, percent: Money) -> Option<Money> {
        self.0
            .checked_mul(percent.0)?
            .checked_div(RustDecimal::ONE_HUNDRED)
            .map(Money)
    }

    /// Checked addition; `None` on overflow of the 96-bit mantissa.
    pub fn checked_add(&self, rhs: Money) -> Option<Money> {
        self.0.checked_add(rhs.0).map(Money)
    }

    pub fn checked_mul(&self, rhs: Money) -> Option<Money> {
        self.0.checked_mul(rhs.0).map(Money)
    }

    /// Checked division; `None` when dividing by zero.
    pub fn checked_div(&self, rhs: Money) -> Option<Money> {
        self.0.checked_div(rhs.0).map(Money)
    }

    /// Round to `dp` decimal places using banker's rounding.
    pub fn round_dp(&self, dp: u32) -> Money {
        Money(self.0.round_dp(dp))
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_canonical_string())
    }
}

impl FromStr for Money {
    type Err = rust_decimal::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_str_canonical(s)
    }
}

impl From<RustDecimal> for Money {
    fn from(value: RustDecimal) -> Self {
        Money(value)
    }
}

impl From<Money> for RustDecimal {
    fn from(value: Money) -> Self {
        value.0
    }
}

impl std::ops::Add for Money {
    type Output = Money;

    fn add(self, rhs: Money) -> Money {
        Money(self.0 + rhs.0)
    }
}

impl std::ops::AddAssign for Money {
    fn add_assign(&mut self, rhs: Money) {
        self.0 += rhs.0;
    }
}

impl std::ops::Sub for Money {
    type Output = Money;

    fn sub(self, rhs: Money) -> Money {
        Money(self.0 - rhs.0)
    }
}

impl std::ops::SubAssign for Money {
    fn sub_assign(&mut self, rhs: Money) {
        self.0 -= rhs.0;
    }
}

impl std::ops::Mul for Money {
    type Output = Money;

    fn mul(self, rhs: Money) -> Money {
        Money(self.0 * rhs.0)
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Money {
        iter.fold(Money::zero(), |acc, m| acc + m)
    }
}
