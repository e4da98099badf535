//! Conversion between decimal major-unit amounts and gateway minor units.
//!
//! Amounts are kept as `Decimal` dollars everywhere inside the crate and only
//! become integer cents when they cross into the payment gateway.

use crate::error::BillingError;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

const CENT_PLACES: u32 = 2;

/// Round to the nearest cent, halves away from zero.
pub fn round_to_cents(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(CENT_PLACES, RoundingStrategy::MidpointAwayFromZero)
}

/// Convert a major-unit amount to integer minor units (cents).
pub fn to_minor_units(amount: Decimal) -> Result<i64, BillingError> {
    let cents = round_to_cents(amount) * Decimal::ONE_HUNDRED;
    cents
        .to_i64()
        .ok_or_else(|| BillingError::Validation(format!("amount {} is out of range", amount)))
}

pub fn from_minor_units(cents: i64) -> Decimal {
    Decimal::new(cents, CENT_PLACES)
}
