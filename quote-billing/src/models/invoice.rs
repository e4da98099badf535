//! Invoice model for quote-billing.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Billing document pattern an invoice follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceKind {
    Deposit,
    Remaining,
    Full,
}

impl InvoiceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceKind::Deposit => "deposit",
            InvoiceKind::Remaining => "remaining",
            InvoiceKind::Full => "full",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "deposit" => Some(InvoiceKind::Deposit),
            "remaining" => Some(InvoiceKind::Remaining),
            "full" => Some(InvoiceKind::Full),
            _ => None,
        }
    }

    /// Paying this invoice secures the event date.
    pub fn books_event(&self) -> bool {
        matches!(self, InvoiceKind::Deposit | InvoiceKind::Full)
    }

    pub fn description(&self) -> &'static str {
        match self {
            InvoiceKind::Deposit => "This deposit will lock down your event date.",
            InvoiceKind::Remaining => "Remaining balance for your event.",
            InvoiceKind::Full => "Full payment for your event.",
        }
    }
}

impl fmt::Display for InvoiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configured invoice type: which share of the quote amount it bills.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceType {
    pub invoice_type_id: i32,
    pub kind: InvoiceKind,
    /// Share of the quote amount, in `[0, 1]`.
    pub percentage: Decimal,
}

/// Invoice status.
///
/// `Paid` and `Void` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Open,
    Paid,
    Void,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Open => "open",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Void => "void",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "open" => Some(InvoiceStatus::Open),
            "paid" => Some(InvoiceStatus::Paid),
            "void" => Some(InvoiceStatus::Void),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, InvoiceStatus::Open)
    }

    pub fn can_transition_to(&self, next: InvoiceStatus) -> bool {
        !self.is_terminal() && next.is_terminal()
    }
}

impl fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Local ledger record of a gateway-backed invoice.
///
/// Several rows may share one `remote_invoice_id`: a reconciliation voids the
/// current row and inserts a fresh Open row for the same remote invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    pub invoice_id: Uuid,
    pub remote_invoice_id: String,
    pub quote_id: Uuid,
    pub invoice_type_id: i32,
    pub amount: Decimal,
    pub due_date: DateTime<Utc>,
    pub hosted_url: Option<String>,
    pub status: InvoiceStatus,
    pub created_utc: DateTime<Utc>,
    pub paid_utc: Option<DateTime<Utc>>,
    pub voided_utc: Option<DateTime<Utc>>,
}

/// Input for recording a new Open invoice.
#[derive(Debug, Clone)]
pub struct NewInvoice {
    pub remote_invoice_id: String,
    pub quote_id: Uuid,
    pub invoice_type_id: i32,
    pub amount: Decimal,
    pub due_date: DateTime<Utc>,
    pub hosted_url: Option<String>,
    pub created_utc: DateTime<Utc>,
}

impl NewInvoice {
    pub fn into_open_invoice(self) -> Invoice {
        Invoice {
            invoice_id: Uuid::new_v4(),
            remote_invoice_id: self.remote_invoice_id,
            quote_id: self.quote_id,
            invoice_type_id: self.invoice_type_id,
            amount: self.amount,
            due_date: self.due_date,
            hosted_url: self.hosted_url,
            status: InvoiceStatus::Open,
            created_utc: self.created_utc,
            paid_utc: None,
            voided_utc: None,
        }
    }
}
