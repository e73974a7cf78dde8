//! Exact fixed-point decimal arithmetic for monetary and score fields.
//!
//! Per the decimal law (§8): every monetary value is stored and read back
//! exactly, never introduces floating-point rounding, and is rejected at the
//! boundary if it overflows its declared precision. `rust_decimal::Decimal`
//! is a base-10 mantissa+scale type, so round-tripping through Postgres
//! `NUMERIC` via the `rust_decimal` sqlx feature never touches binary float.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// 12 integer digits + 2 fractional digits, per §3: "exact fixed-point
/// decimal, 12 integer + 2 fractional digits". Max representable magnitude.
pub const MAX_INTEGER_DIGITS: u32 = 12;
pub const SCALE: u32 = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MoneyError {
    #[error("not a valid decimal number: {0}")]
    Parse(String),
    #[error("precision overflow: value has more than {max_integer_digits} integer digits")]
    PrecisionOverflow { max_integer_digits: u32 },
    #[error("negative amount is not permitted here")]
    Negative,
}

/// A monetary (or monetary-shaped, e.g. risk_score) value stored as an exact
/// base-10 decimal with a fixed scale of 2. Two `Money` values compare equal
/// iff their exact decimal representations are equal — no epsilon, no
/// rounding drift across a storage round-trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Money(Decimal);

impl Money {
    /// Parse and validate against the 12+2 precision ceiling
    /// (max magnitude 9,999,999,999.99), rejecting negative amounts.
    pub fn parse(raw: &str) -> Result<Self, MoneyError> {
        let mut d = Decimal::from_str(raw.trim()).map_err(|_| MoneyError::Parse(raw.to_string()))?;
        d.rescale(SCALE);
        let m = Money(d);
        m.validate_precision()?;
        if d.is_sign_negative() && !d.is_zero() {
            return Err(MoneyError::Negative);
        }
        Ok(m)
    }

    /// Like `parse` but permits negative values (not used for application
    /// monetary fields, but risk_score deltas or ledger adjustments might).
    pub fn parse_signed(raw: &str) -> Result<Self, MoneyError> {
        let mut d = Decimal::from_str(raw.trim()).map_err(|_| MoneyError::Parse(raw.to_string()))?;
        d.rescale(SCALE);
        let m = Money(d);
        m.validate_precision()?;
        Ok(m)
    }

    pub fn from_decimal(d: Decimal) -> Result<Self, MoneyError> {
        let mut d = d;
        d.rescale(SCALE);
        let m = Money(d);
        m.validate_precision()?;
        Ok(m)
    }

    pub fn zero() -> Self {
        Money(Decimal::new(0, SCALE))
    }

    pub fn as_decimal(self) -> Decimal {
        self.0
    }

    fn validate_precision(self) -> Result<(), MoneyError> {
        // Decimal's `mantissa` digit count minus scale gives the integer
        // digit count; compare against the declared ceiling.
        let unscaled = self.0.mantissa().unsigned_abs();
        let digits = if unscaled == 0 {
            1
        } else {
            unscaled.to_string().len() as u32
        };
        let integer_digits = digits.saturating_sub(self.0.scale());
        if integer_digits > MAX_INTEGER_DIGITS {
            return Err(MoneyError::PrecisionOverflow {
                max_integer_digits: MAX_INTEGER_DIGITS,
            });
        }
        Ok(())
    }
}

impl std::fmt::Display for Money {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for Money {
    type Error = MoneyError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        Money::parse(&value)
    }
}

impl From<Money> for String {
    fn from(value: Money) -> Self {
        value.0.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_round_trip_no_rounding() {
        let m = Money::parse("15000.00").unwrap();
        assert_eq!(m.to_string(), "15000.00");
    }

    #[test]
    fn rejects_precision_overflow() {
        let err = Money::parse("99999999999999.00").unwrap_err();
        assert!(matches!(err, MoneyError::PrecisionOverflow { .. }));
    }

    #[test]
    fn accepts_max_boundary() {
        let m = Money::parse("9999999999.99").unwrap();
        assert_eq!(m.to_string(), "9999999999.99");
    }

    #[test]
    fn rejects_negative_for_amounts() {
        let err = Money::parse("-5.00").unwrap_err();
        assert_eq!(err, MoneyError::Negative);
    }

    #[test]
    fn rescales_fewer_fractional_digits() {
        let m = Money::parse("100").unwrap();
        assert_eq!(m.to_string(), "100.00");
    }

    #[test]
    fn equality_is_exact() {
        let a = Money::parse("3500.00").unwrap();
        let b = Money::parse("3500.00").unwrap();
        assert_eq!(a, b);
    }
}
