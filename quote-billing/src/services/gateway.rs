//! Remote invoicing gateway contract.
//!
//! Amounts cross this boundary as integer minor units. Implementations must
//! make `finalize_invoice` a no-op for invoices that are already finalized and
//! honour the idempotency key on `create_invoice`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use service_core::retry::Retryable;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Gateway call timed out")]
    Timeout,

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Rate limited by gateway")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Gateway rejected request ({status}): {message}")]
    Api {
        status: u16,
        code: Option<String>,
        message: String,
    },

    #[error("Could not decode gateway response: {0}")]
    Decode(String),

    #[error("Gateway credentials not configured")]
    NotConfigured,
}

impl GatewayError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, GatewayError::Timeout)
    }
}

impl Retryable for GatewayError {
    fn is_retryable(&self) -> bool {
        match self {
            GatewayError::Network(_) | GatewayError::Timeout | GatewayError::RateLimited { .. } => {
                true
            }
            GatewayError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            GatewayError::RateLimited {
                retry_after_secs: Some(secs),
            } => Some(Duration::from_secs(*secs)),
            _ => None,
        }
    }
}

/// Remote lifecycle status of an invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteInvoiceStatus {
    Draft,
    Open,
    Paid,
    Void,
    Uncollectible,
}

impl RemoteInvoiceStatus {
    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(RemoteInvoiceStatus::Draft),
            "open" => Some(RemoteInvoiceStatus::Open),
            "paid" => Some(RemoteInvoiceStatus::Paid),
            "void" => Some(RemoteInvoiceStatus::Void),
            "uncollectible" => Some(RemoteInvoiceStatus::Uncollectible),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteInvoice {
    pub remote_invoice_id: String,
    pub customer_id: String,
    pub status: RemoteInvoiceStatus,
    pub due_date: Option<DateTime<Utc>>,
    pub amount_due_minor: i64,
    pub amount_paid_minor: i64,
    pub hosted_url: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
}

impl RemoteInvoice {
    pub fn is_paid(&self) -> bool {
        self.status == RemoteInvoiceStatus::Paid
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteLineItem {
    pub line_item_id: String,
    pub amount_minor: i64,
    pub description: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CreateInvoiceRequest {
    pub customer_id: String,
    pub due_date: DateTime<Utc>,
    pub description: String,
    /// Repeating a create with the same key returns the original invoice.
    pub idempotency_key: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Create a customer and return its id.
    async fn ensure_customer(&self, email: &str, full_name: &str) -> Result<String, GatewayError>;

    /// Create a draft invoice and return its remote id.
    async fn create_invoice(&self, request: &CreateInvoiceRequest) -> Result<String, GatewayError>;

    /// Attach a line item and return its id.
    async fn attach_line_item(
        &self,
        customer_id: &str,
        remote_invoice_id: &str,
        amount_minor: i64,
        description: &str,
    ) -> Result<String, GatewayError>;

    async fn list_line_items(&self, remote_invoice_id: &str) -> Result<Vec<RemoteLineItem>, GatewayError>;

    /// Only permitted on unpaid invoices.
    async fn delete_line_item(&self, line_item_id: &str) -> Result<(), GatewayError>;

    async fn update_due_date(
        &self,
        remote_invoice_id: &str,
        due_date: DateTime<Utc>,
    ) -> Result<(), GatewayError>;

    async fn finalize_invoice(&self, remote_invoice_id: &str) -> Result<(), GatewayError>;

    /// Email the invoice to the customer and return the hosted payment page.
    async fn send_invoice(&self, remote_invoice_id: &str) -> Result<Option<String>, GatewayError>;

    async fn get_invoice(&self, remote_invoice_id: &str) -> Result<RemoteInvoice, GatewayError>;

    async fn void_invoice(&self, remote_invoice_id: &str) -> Result<(), GatewayError>;

    /// Record a payment collected outside the gateway.
    async fn mark_paid_out_of_band(&self, remote_invoice_id: &str) -> Result<(), GatewayError>;
}
