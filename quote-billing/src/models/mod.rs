//! Domain models for quote-billing.

mod invoice;
pub mod money;
mod quote;

pub use invoice::{Invoice, InvoiceKind, InvoiceStatus, InvoiceType, NewInvoice};
pub use quote::{BillingContact, OpenBarPackage, Quote, QuoteLineItem, ServiceOptions};
