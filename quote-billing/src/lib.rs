//! quote-billing: quote pricing and invoice lifecycle over a remote
//! invoicing gateway.

pub mod config;
pub mod error;
pub mod invoice_types;
pub mod lifecycle;
pub mod models;
pub mod pricing;
pub mod services;
pub mod startup;
pub mod sweeper;

pub use error::BillingError;
pub use invoice_types::{BillingPlan, InvoiceTypeResolver};
pub use lifecycle::InvoiceLifecycleManager;
pub use pricing::PricingEngine;
