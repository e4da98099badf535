//! Quote and line item models.

use crate::error::BillingError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Open bar package sold with a quote, charged per guest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenBarPackage {
    #[default]
    None,
    Partial,
    Full,
}

impl OpenBarPackage {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpenBarPackage::None => "none",
            OpenBarPackage::Partial => "partial",
            OpenBarPackage::Full => "full",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "none" => Some(OpenBarPackage::None),
            "partial" => Some(OpenBarPackage::Partial),
            "full" => Some(OpenBarPackage::Full),
            _ => None,
        }
    }
}

/// Add-on flags and quantities a quote can request.
///
/// A `true` flag means the business supplies that item and bills for it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceOptions {
    pub liquor: bool,
    pub beer_and_wine: bool,
    pub mixers: bool,
    pub juices: bool,
    pub soft_drinks: bool,
    pub cups: bool,
    pub ice: bool,
    pub glassware: bool,
    pub bar_units: i32,
    #[serde(default)]
    pub open_bar: OpenBarPackage,
}

/// One priced event proposal for a lead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub quote_id: Uuid,
    pub external_id: String,
    pub lead_id: Uuid,
    pub guests: i32,
    pub hours: Decimal,
    pub staff_count: i32,
    pub event_date: DateTime<Utc>,
    pub options: ServiceOptions,
    /// Last amount computed from the quote's line items.
    pub amount: Decimal,
}

impl Quote {
    /// Checks that run before any ledger or gateway call.
    pub fn validate_for_billing(&self) -> Result<(), BillingError> {
        if self.quote_id.is_nil() {
            return Err(BillingError::Validation("quote id is missing".to_string()));
        }
        if self.guests <= 0 {
            return Err(BillingError::Validation(format!(
                "guest count must be positive, got {}",
                self.guests
            )));
        }
        Ok(())
    }
}

/// A billable service component attached to a quote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteLineItem {
    pub line_item_id: Uuid,
    pub quote_id: Uuid,
    /// Service catalog reference.
    pub service: String,
    pub units: Decimal,
    pub price_per_unit: Decimal,
}

impl QuoteLineItem {
    pub fn new(
        quote_id: Uuid,
        service: impl Into<String>,
        units: Decimal,
        price_per_unit: Decimal,
    ) -> Result<Self, BillingError> {
        if units < Decimal::ZERO {
            return Err(BillingError::Validation(format!(
                "unit count must not be negative, got {}",
                units
            )));
        }
        if price_per_unit < Decimal::ZERO {
            return Err(BillingError::Validation(format!(
                "price per unit must not be negative, got {}",
                price_per_unit
            )));
        }

        Ok(Self {
            line_item_id: Uuid::new_v4(),
            quote_id,
            service: service.into(),
            units,
            price_per_unit,
        })
    }

    /// Units × price, with negative inputs contributing nothing.
    pub fn subtotal(&self) -> Decimal {
        self.units.max(Decimal::ZERO) * self.price_per_unit.max(Decimal::ZERO)
    }
}

/// Who receives the invoices for a lead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingContact {
    pub lead_id: Uuid,
    pub email: String,
    pub full_name: String,
    pub gateway_customer_id: Option<String>,
}
