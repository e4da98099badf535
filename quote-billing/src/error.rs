//! Error taxonomy for quote pricing and invoice lifecycle operations.

use crate::models::InvoiceStatus;
use crate::services::gateway::GatewayError;
use crate::services::ledger::LedgerError;
use service_core::error::AppError;
use thiserror::Error;

/// Message shown to whoever triggered a failed billing update.
pub const BILLING_UPDATE_FAILED: &str = "could not update billing";

#[derive(Debug, Error)]
pub enum BillingError {
    /// The quote cannot be priced yet. Raised before any I/O.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The requested invoice plan conflicts with invoices that already exist.
    #[error("Invoice plan conflict: {0}")]
    PlanConflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Gateway call '{operation}' failed: {source}")]
    Gateway {
        operation: &'static str,
        #[source]
        source: GatewayError,
    },

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// The remote mutation succeeded but recording it locally failed.
    /// Local and remote state have diverged until the operation is re-run.
    #[error("Ledger write failed after remote mutation of invoice {remote_invoice_id}: {source}")]
    LedgerDiverged {
        remote_invoice_id: String,
        #[source]
        source: LedgerError,
    },

    #[error("Invoice {remote_invoice_id} cannot move from {from} to {to}")]
    InvalidTransition {
        remote_invoice_id: String,
        from: InvoiceStatus,
        to: InvoiceStatus,
    },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl BillingError {
    pub fn gateway(operation: &'static str, source: GatewayError) -> Self {
        BillingError::Gateway { operation, source }
    }

    /// Message safe to surface to the caller that triggered the operation.
    pub fn user_message(&self) -> String {
        match self {
            BillingError::Validation(msg) => format!("quote cannot be priced yet: {}", msg),
            _ => BILLING_UPDATE_FAILED.to_string(),
        }
    }

    /// Label used for the error counter.
    pub fn kind(&self) -> &'static str {
        match self {
            BillingError::Validation(_) => "validation",
            BillingError::PlanConflict(_) => "plan_conflict",
            BillingError::NotFound(_) => "not_found",
            BillingError::Gateway { .. } => "gateway",
            BillingError::Ledger(_) => "ledger",
            BillingError::LedgerDiverged { .. } => "ledger_diverged",
            BillingError::InvalidTransition { .. } => "guard_trip",
            BillingError::Config(_) => "config",
        }
    }
}

impl From<BillingError> for AppError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::Validation(_) => AppError::BadRequest(anyhow::anyhow!(err.user_message())),
            BillingError::PlanConflict(_) | BillingError::InvalidTransition { .. } => {
                AppError::Conflict(anyhow::anyhow!(err.user_message()))
            }
            BillingError::NotFound(msg) => AppError::NotFound(anyhow::anyhow!(msg)),
            BillingError::Gateway { source, .. } if source.is_timeout() => {
                AppError::ServiceUnavailable
            }
            BillingError::Gateway { .. } => AppError::BadGateway(BILLING_UPDATE_FAILED.to_string()),
            BillingError::Ledger(e) | BillingError::LedgerDiverged { source: e, .. } => {
                AppError::DatabaseError(anyhow::Error::new(e))
            }
            BillingError::Config(msg) => AppError::ConfigError(anyhow::anyhow!(msg)),
        }
    }
}
