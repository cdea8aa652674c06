//! Money Conversion Module
//!
//! Decodes client-supplied amounts into the internal integer minor-unit
//! representation. All request-layer conversions MUST go through this module.
//!
//! ## Design Principles
//! 1. Integer minor units only: a wallet holds cents, never fractions of a cent
//! 2. Explicit Error Handling: no silent truncation or rounding
//! 3. Zero and negative amounts are rejected at the boundary
//!
//! ## Usage
//! ```rust
//! use wallet_ledger::money::parse_minor_units;
//!
//! assert_eq!(parse_minor_units("1500").unwrap(), 1500);
//! assert!(parse_minor_units("15.00").is_err()); // fractional input is rejected
//! ```

use rust_decimal::prelude::*;
use thiserror::Error;

use crate::core_types::MinorUnits;

/// Money conversion errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MoneyError {
    #[error("Amount must be positive")]
    NotPositive,

    #[error("Amount must be a whole number of minor units")]
    Fractional,

    #[error("Amount too large, would overflow")]
    Overflow,

    #[error("Invalid format: {0}")]
    InvalidFormat(String),
}

/// Convert a client string amount to minor units
///
/// Only plain ASCII digits are accepted. A decimal point, sign, exponent,
/// separator or whitespace inside the number is an error.
///
/// # Errors
/// * `Fractional` - input contains a decimal point
/// * `NotPositive` - amount is zero or negative
/// * `Overflow` - would overflow u64
/// * `InvalidFormat` - anything else that is not a digit string
pub fn parse_minor_units(amount_str: &str) -> Result<MinorUnits, MoneyError> {
    let amount_str = amount_str.trim();
    if amount_str.is_empty() {
        return Err(MoneyError::InvalidFormat("empty string".into()));
    }

    if amount_str.starts_with('-') {
        return Err(MoneyError::NotPositive);
    }

    if amount_str.contains('.') {
        return Err(MoneyError::Fractional);
    }

    if !amount_str.bytes().all(|b| b.is_ascii_digit()) {
        return Err(MoneyError::InvalidFormat(format!(
            "not a digit string: {}",
            amount_str
        )));
    }

    let amount = amount_str.parse::<u64>().map_err(|e| {
        let err_str = e.to_string();
        if err_str.contains("too large") {
            MoneyError::Overflow
        } else {
            MoneyError::InvalidFormat(amount_str.to_string())
        }
    })?;

    if amount == 0 {
        return Err(MoneyError::NotPositive);
    }

    Ok(amount)
}

/// Convert a `Decimal` to minor units
///
/// A decimal is accepted only when its scale is zero, so `100` passes and
/// `100.0` does not: the client is expected to send minor units, not a
/// display value.
pub fn parse_decimal(decimal: Decimal) -> Result<MinorUnits, MoneyError> {
    if decimal.is_sign_negative() || decimal.is_zero() {
        return Err(MoneyError::NotPositive);
    }

    if decimal.scale() > 0 {
        return Err(MoneyError::Fractional);
    }

    decimal.to_u64().ok_or(MoneyError::Overflow)
}

/// Convert a JSON number to minor units
///
/// `serde_json` keeps integers and floats apart; any float literal
/// (including `1e3` and `100.0`) is rejected.
pub fn parse_json_number(number: &serde_json::Number) -> Result<MinorUnits, MoneyError> {
    if let Some(v) = number.as_u64() {
        if v == 0 {
            return Err(MoneyError::NotPositive);
        }
        return Ok(v);
    }

    if number.as_i64().is_some() {
        return Err(MoneyError::NotPositive);
    }

    match number.as_f64() {
        Some(f) if f <= 0.0 => Err(MoneyError::NotPositive),
        _ => Err(MoneyError::Fractional),
    }
}

/// Validate a raw signed amount handed to the engine directly
pub fn check_positive(amount: i64) -> Result<MinorUnits, MoneyError> {
    if amount <= 0 {
        return Err(MoneyError::NotPositive);
    }
    Ok(amount as MinorUnits)
}
