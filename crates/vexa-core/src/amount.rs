//! Fixed-point credit amounts.
//!
//! Balances and prices are stored as signed hundredths of a credit. Fractional
//! prices (for example per-character speech pricing) are rounded half-up to
//! [`SCALE`] decimal places before they reach the ledger, so rounding never
//! systematically under-charges.
//!
//! Typed input from operators and users is parsed leniently: Persian and
//! Arabic-Indic digits are accepted and thousands separators are ignored.

use std::fmt;
use std::str::FromStr;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of decimal places kept for every stored or displayed amount.
pub const SCALE: u32 = 2;

const MINOR_PER_CREDIT: i64 = 100;

/// Errors produced when building or parsing an amount.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AmountError {
    /// The input is not a number.
    #[error("invalid amount: {0:?}")]
    Invalid(String),

    /// The value does not fit in the ledger's 64-bit fixed-point range.
    #[error("amount out of range: {0}")]
    OutOfRange(String),
}

/// A credit amount with two decimal places.
///
/// Serialised as a decimal string (`"80"`, `"0.1"`) at API boundaries.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(into = "String", try_from = "String")]
pub struct Credits(i64);

impl Credits {
    /// The zero amount.
    pub const ZERO: Self = Self(0);

    /// Creates an amount from hundredths of a credit.
    #[must_use]
    pub const fn from_minor(minor: i64) -> Self {
        Self(minor)
    }

    /// Creates an amount from a whole number of credits.
    #[must_use]
    pub const fn whole(credits: i64) -> Self {
        Self(credits.saturating_mul(MINOR_PER_CREDIT))
    }

    /// Returns the amount in hundredths of a credit (the stored unit).
    #[must_use]
    pub const fn minor(self) -> i64 {
        self.0
    }

    /// Returns `true` if the amount is greater than zero.
    #[must_use]
    pub const fn is_positive(self) -> bool {
        self.0 > 0
    }

    /// Returns `true` if the amount is less than zero.
    #[must_use]
    pub const fn is_negative(self) -> bool {
        self.0 < 0
    }

    /// Returns the absolute value.
    #[must_use]
    pub const fn abs(self) -> Self {
        Self(self.0.saturating_abs())
    }

    /// Converts a decimal to credits, rounding half-up (midpoint away from
    /// zero) to [`SCALE`] places.
    ///
    /// # Errors
    ///
    /// Returns [`AmountError::OutOfRange`] if the value cannot be represented.
    pub fn from_decimal(value: Decimal) -> Result<Self, AmountError> {
        let rounded = value.round_dp_with_strategy(SCALE, RoundingStrategy::MidpointAwayFromZero);
        rounded
            .checked_mul(Decimal::from(MINOR_PER_CREDIT))
            .and_then(|minor| minor.to_i64())
            .map(Self)
            .ok_or_else(|| AmountError::OutOfRange(value.to_string()))
    }

    /// Returns the amount as an exact decimal.
    #[must_use]
    pub fn to_decimal(self) -> Decimal {
        Decimal::new(self.0, SCALE)
    }

    /// Prices `units` items at `rate` credits each, rounded half-up.
    ///
    /// # Errors
    ///
    /// Returns [`AmountError::OutOfRange`] if the total overflows.
    pub fn per_unit(rate: Decimal, units: u64) -> Result<Self, AmountError> {
        let total = rate
            .checked_mul(Decimal::from(units))
            .ok_or_else(|| AmountError::OutOfRange(format!("{rate} x {units}")))?;
        Self::from_decimal(total)
    }

    /// Checked addition.
    #[must_use]
    pub const fn checked_add(self, other: Self) -> Option<Self> {
        match self.0.checked_add(other.0) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Checked subtraction.
    #[must_use]
    pub const fn checked_sub(self, other: Self) -> Option<Self> {
        match self.0.checked_sub(other.0) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Parses an amount typed by a person.
    ///
    /// Accepts ASCII, Persian and Arabic-Indic digits, a leading `+` or `-`,
    /// `.` or `٫` as the decimal separator, and ignores spaces and thousands
    /// separators. More than two decimal places are rounded half-up.
    ///
    /// # Errors
    ///
    /// Returns [`AmountError::Invalid`] for empty or non-numeric input.
    pub fn parse_lenient(input: &str) -> Result<Self, AmountError> {
        let normalized = normalize_digits(input);
        let unsigned = normalized.strip_prefix('+').unwrap_or(&normalized);
        if unsigned.is_empty() {
            return Err(AmountError::Invalid(input.to_string()));
        }
        let value =
            Decimal::from_str(unsigned).map_err(|_| AmountError::Invalid(input.to_string()))?;
        Self::from_decimal(value)
    }
}

impl fmt::Display for Credits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_decimal().normalize())
    }
}

impl FromStr for Credits {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_lenient(s)
    }
}

impl From<Credits> for String {
    fn from(value: Credits) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for Credits {
    type Error = AmountError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse_lenient(&value)
    }
}

/// Maps Persian and Arabic-Indic digits to ASCII and strips separators.
#[must_use]
pub fn normalize_digits(input: &str) -> String {
    input
        .trim()
        .chars()
        .filter_map(|c| match c {
            '\u{06F0}'..='\u{06F9}' => char::from_digit(u32::from(c) - 0x06F0, 10),
            '\u{0660}'..='\u{0669}' => char::from_digit(u32::from(c) - 0x0660, 10),
            '\u{066B}' => Some('.'),
            ',' | '\u{066C}' | ' ' | '\u{00A0}' | '_' => None,
            other => Some(other),
        })
        .collect()
}

/// Parses an integer typed by a person (account ids, counts).
///
/// # Errors
///
/// Returns [`AmountError::Invalid`] for empty or non-integer input.
pub fn parse_int_lenient(input: &str) -> Result<i64, AmountError> {
    let normalized = normalize_digits(input);
    let unsigned = normalized.strip_prefix('+').unwrap_or(&normalized);
    unsigned
        .parse::<i64>()
        .map_err(|_| AmountError::Invalid(input.to_string()))
}
