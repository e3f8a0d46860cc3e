//! Money helpers.
//!
//! Balances and prices are `rust_decimal::Decimal` so that holds and refunds
//! round-trip exactly. Amounts arriving as floats (config files, pricing
//! tables) pass through [`amount_from_f64`], which is the only place NaN and
//! infinities can enter and therefore the place they are rejected.

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;

use crate::error::{Result, ValidationError};

/// Ensure an amount is not negative.
///
/// # Errors
///
/// Returns `ValidationError::NegativeAmount` for amounts below zero.
pub fn ensure_non_negative(amount: Decimal) -> Result<Decimal> {
    if amount < Decimal::ZERO {
        return Err(ValidationError::NegativeAmount { amount });
    }
    Ok(amount)
}

/// Convert a float amount into a validated non-negative decimal.
///
/// # Errors
///
/// - `ValidationError::NonFiniteAmount` for NaN and ±Infinity.
/// - `ValidationError::AmountOutOfRange` if the value does not fit a `Decimal`.
/// - `ValidationError::NegativeAmount` for values below zero.
pub fn amount_from_f64(value: f64) -> Result<Decimal> {
    if !value.is_finite() {
        return Err(ValidationError::NonFiniteAmount);
    }
    let amount =
        Decimal::from_f64(value).ok_or_else(|| ValidationError::AmountOutOfRange(value.to_string()))?;
    ensure_non_negative(amount.normalize())
}

/// Parse a decimal amount from text, rejecting negatives.
///
/// # Errors
///
/// Returns `ValidationError::AmountOutOfRange` if the text is not a decimal and
/// `ValidationError::NegativeAmount` if it is below zero.
pub fn parse_amount(text: &str) -> Result<Decimal> {
    let amount: Decimal = text
        .trim()
        .parse()
        .map_err(|_| ValidationError::AmountOutOfRange(text.to_string()))?;
    ensure_non_negative(amount)
}
