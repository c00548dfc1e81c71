//! Fixed-precision stock quantity.
//!
//! Quantities are decimals with at most [`QUANTITY_SCALE`] fractional digits,
//! never floating point, so that long movement histories fold without drift.

use core::ops::{Add, AddAssign, Neg, Sub, SubAssign};
use core::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Maximum number of fractional digits a quantity may carry.
pub const QUANTITY_SCALE: u32 = 4;

/// Maximum number of integer digits, matching `NUMERIC(24, 4)` columns.
pub const QUANTITY_INTEGER_DIGITS: u32 = 20;

/// Exclusive magnitude bound, `10^QUANTITY_INTEGER_DIGITS`.
fn magnitude_limit() -> Decimal {
    Decimal::from_i128_with_scale(10i128.pow(QUANTITY_INTEGER_DIGITS), 0)
}

/// Signed stock quantity (on-hand, reserved, deltas, magnitudes).
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Quantity(Decimal);

impl Quantity {
    pub const ZERO: Quantity = Quantity(Decimal::ZERO);

    /// Wrap a decimal, rejecting values finer than [`QUANTITY_SCALE`] or
    /// with more than [`QUANTITY_INTEGER_DIGITS`] integer digits.
    pub fn new(value: Decimal) -> DomainResult<Self> {
        let normalized = value.normalize();
        if normalized.scale() > QUANTITY_SCALE {
            return Err(DomainError::validation(format!(
                "quantity {value} has more than {QUANTITY_SCALE} decimal places"
            )));
        }
        if normalized.abs() >= magnitude_limit() {
            return Err(DomainError::validation(format!(
                "quantity {value} has more than {QUANTITY_INTEGER_DIGITS} integer digits"
            )));
        }
        Ok(Self(normalized))
    }

    /// A strictly positive magnitude (movement quantity, reservation, receipt).
    pub fn positive(value: Decimal) -> DomainResult<Self> {
        let q = Self::new(value)?;
        if !q.is_positive() {
            return Err(DomainError::validation(format!(
                "quantity must be positive, got {value}"
            )));
        }
        Ok(q)
    }

    pub fn from_i64(value: i64) -> Self {
        Self(Decimal::from(value))
    }

    pub fn as_decimal(&self) -> Decimal {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn is_positive(&self) -> bool {
        self.0 > Decimal::ZERO
    }

    pub fn is_negative(&self) -> bool {
        self.0 < Decimal::ZERO
    }

    pub fn abs(&self) -> Self {
        Self(self.0.abs())
    }

    /// Sum that stays within the storable range.
    pub fn checked_add(self, rhs: Self) -> DomainResult<Self> {
        self.0
            .checked_add(rhs.0)
            .filter(|v| v.abs() < magnitude_limit())
            .map(Self)
            .ok_or_else(|| DomainError::invariant("quantity overflow"))
    }

    pub fn checked_sub(self, rhs: Self) -> DomainResult<Self> {
        self.0
            .checked_sub(rhs.0)
            .filter(|v| v.abs() < magnitude_limit())
            .map(Self)
            .ok_or_else(|| DomainError::invariant("quantity overflow"))
    }
}

impl TryFrom<Decimal> for Quantity {
    type Error = DomainError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Quantity> for Decimal {
    fn from(value: Quantity) -> Self {
        value.0
    }
}

impl From<i64> for Quantity {
    fn from(value: i64) -> Self {
        Self::from_i64(value)
    }
}

impl FromStr for Quantity {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = Decimal::from_str(s.trim())
            .map_err(|e| DomainError::validation(format!("invalid quantity '{s}': {e}")))?;
        Self::new(value)
    }
}

impl core::fmt::Display for Quantity {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl Add for Quantity {
    type Output = Quantity;

    fn add(self, rhs: Self) -> Self::Output {
        Quantity(self.0 + rhs.0)
    }
}

impl Sub for Quantity {
    type Output = Quantity;

    fn sub(self, rhs: Self) -> Self::Output {
        Quantity(self.0 - rhs.0)
    }
}

impl Neg for Quantity {
    type Output = Quantity;

    fn neg(self) -> Self::Output {
        Quantity(-self.0)
    }
}

impl AddAssign for Quantity {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl SubAssign for Quantity {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 -= rhs.0;
    }
}

impl core::iter::Sum for Quantity {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Quantity::ZERO, |acc, q| acc + q)
    }
}
