pub mod database;
pub mod gateway;
pub mod ledger;
pub mod memory;
pub mod metrics;
pub mod stripe;
pub mod webhook;

pub use database::PgLedger;
pub use gateway::{GatewayError, PaymentGateway};
pub use ledger::{LedgerError, LedgerStore};
pub use memory::InMemoryLedger;
pub use metrics::{get_metrics, init_metrics};
pub use stripe::StripeClient;
pub use webhook::WebhookVerifier;
