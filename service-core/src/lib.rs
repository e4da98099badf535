//! service-core: Shared infrastructure for the quote billing workspace.
pub mod config;
pub mod error;
pub mod observability;
pub mod retry;
pub mod utils;

pub use serde;
pub use serde_json;
pub use tokio;
pub use tracing;
