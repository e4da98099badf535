//! Persistence contract for quotes, line items, invoices and invoice types.

use crate::models::{BillingContact, Invoice, InvoiceStatus, InvoiceType, NewInvoice, Quote, QuoteLineItem};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Record not found: {0}")]
    NotFound(String),

    /// A write lost a race or would break a uniqueness rule, e.g. a second
    /// Open invoice for the same quote and invoice type.
    #[error("Conflicting write: {0}")]
    Conflict(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn get_quote(&self, quote_id: Uuid) -> Result<Option<Quote>, LedgerError>;

    async fn update_quote_amount(&self, quote_id: Uuid, amount: Decimal) -> Result<(), LedgerError>;

    async fn get_line_items_for_quote(&self, quote_id: Uuid) -> Result<Vec<QuoteLineItem>, LedgerError>;

    async fn get_open_invoices_for_quote(&self, quote_id: Uuid) -> Result<Vec<Invoice>, LedgerError>;

    /// Every row for the quote, any status, oldest first.
    async fn get_invoices_for_quote(&self, quote_id: Uuid) -> Result<Vec<Invoice>, LedgerError>;

    /// The row currently representing a remote invoice: its Open row if
    /// there is one, otherwise the most recent row.
    async fn get_current_invoice(&self, remote_invoice_id: &str) -> Result<Option<Invoice>, LedgerError>;

    async fn insert_invoice(&self, invoice: NewInvoice) -> Result<Invoice, LedgerError>;

    /// Move the Open row for `remote_invoice_id` to `status`, stamping the
    /// paid or voided timestamp with `at`. Returns `false` when no Open row
    /// exists.
    async fn set_invoice_status(
        &self,
        remote_invoice_id: &str,
        status: InvoiceStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, LedgerError>;

    /// Void the Open row `invoice_id` and insert `replacement` as one unit.
    async fn supersede_invoice(
        &self,
        invoice_id: Uuid,
        replacement: NewInvoice,
        at: DateTime<Utc>,
    ) -> Result<Invoice, LedgerError>;

    async fn get_invoice_types(&self) -> Result<Vec<InvoiceType>, LedgerError>;

    async fn get_billing_contact(&self, lead_id: Uuid) -> Result<Option<BillingContact>, LedgerError>;

    async fn assign_gateway_customer(&self, lead_id: Uuid, customer_id: &str) -> Result<(), LedgerError>;

    async fn list_quotes_with_open_invoices(&self) -> Result<Vec<Uuid>, LedgerError>;

    /// Archive leads not contacted since `last_contact_before`. Returns how
    /// many were archived.
    async fn archive_unresponsive_leads(&self, last_contact_before: DateTime<Utc>) -> Result<u64, LedgerError>;
}
