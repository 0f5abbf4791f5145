//! Currency codec
//!
//! All amounts are stored as integer cents. Conversions go through
//! arbitrary-precision decimals so binary floating point never touches the
//! rounding step.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use std::str::FromStr;

use crate::error::AgentError;
use crate::Result;

/// Upper bound on stored amounts: 999,999,999 cents ($10 million).
pub const MAX_MINOR_UNITS: i64 = 999_999_999;

/// Convert a decimal dollar amount to integer cents.
///
/// Rounds half-away-from-zero at the cent boundary, so `"10.555"` becomes
/// `1056` and `"10.554"` becomes `1055`.
pub fn to_minor_units(amount: &str) -> Result<i64> {
    let parsed = Decimal::from_str(amount.trim())
        .map_err(|_| AgentError::InvalidAmount(format!("cannot parse '{}' as a number", amount)))?;

    decimal_to_minor_units(parsed)
}

/// Convert a float dollar amount to integer cents.
///
/// The float is first rendered to its shortest decimal representation and
/// re-parsed as a `Decimal`, matching how the value was written, before the
/// cent rounding is applied.
pub fn f64_to_minor_units(amount: f64) -> Result<i64> {
    if !amount.is_finite() {
        return Err(AgentError::InvalidAmount(format!(
            "'{}' is not a finite number",
            amount
        )));
    }

    let parsed = Decimal::from_str(&amount.to_string())
        .map_err(|_| AgentError::InvalidAmount(format!("cannot represent '{}' exactly", amount)))?;

    decimal_to_minor_units(parsed)
}

fn decimal_to_minor_units(amount: Decimal) -> Result<i64> {
    let cents = (amount * Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);

    cents
        .to_i64()
        .ok_or_else(|| AgentError::InvalidAmount(format!("'{}' is out of range", amount)))
}

/// Convert integer cents back to an exact dollar decimal.
pub fn to_major_units(minor: i64) -> Decimal {
    Decimal::new(minor, 2)
}

/// Reject negative amounts and amounts above the ledger ceiling.
pub fn validate_minor_units(minor: i64) -> Result<()> {
    if minor < 0 {
        return Err(AgentError::InvalidAmount(
            "amount cannot be negative".to_string(),
        ));
    }
    if minor > MAX_MINOR_UNITS {
        return Err(AgentError::InvalidAmount(format!(
            "amount exceeds maximum of {} cents",
            MAX_MINOR_UNITS
        )));
    }
    Ok(())
}

/// Parse a dollar amount string, then validate it against the ledger bounds.
pub fn validate_amount(amount: &str) -> Result<i64> {
    let minor = to_minor_units(amount)?;
    validate_minor_units(minor)?;
    Ok(minor)
}

/// Render cents as a currency string: `$10.50`, negatives as `-$10.50`.
pub fn format_currency(minor: i64) -> String {
    let dollars = to_major_units(minor.abs());
    if minor < 0 {
        format!("-${}", dollars)
    } else {
        format!("${}", dollars)
    }
}

/// Parse amount text that may carry a currency symbol or thousands
/// separators (`"$1,050.25"`) into cents.
pub fn parse_amount_string(amount: &str) -> Result<i64> {
    let cleaned: String = amount
        .trim()
        .chars()
        .filter(|c| *c != '$' && *c != ',')
        .collect();

    if cleaned.is_empty() {
        return Err(AgentError::InvalidAmount(format!(
            "'{}' contains no amount",
            amount
        )));
    }

    to_minor_units(&cleaned)
}
