//! quote-billing settings.
//!
//! Loaded from an optional `billing.{toml,yaml,json}` file overlaid with
//! `BILLING__*` environment variables, e.g. `BILLING__STRIPE__API_KEY` or
//! `BILLING__LIFECYCLE__GRACE_HOURS`.

use crate::error::BillingError;
use crate::invoice_types::DEFAULT_GRACE_HOURS;
use crate::models::InvoiceType;
use crate::pricing::FeeSchedule;
use secrecy::Secret;
use serde::Deserialize;
use service_core::config::{load_layered, Config as CommonConfig};
use service_core::error::AppError;

#[derive(Debug, Clone, Deserialize)]
pub struct BillingConfig {
    #[serde(flatten)]
    pub common: CommonConfig,
    #[serde(default)]
    pub fees: FeeSchedule,
    /// Overrides the ledger's invoice type table when set.
    #[serde(default)]
    pub invoice_types: Option<Vec<InvoiceType>>,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub stripe: StripeConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub sweeps: SweepConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Upper bound on any single gateway call.
    pub gateway_timeout_secs: u64,
    /// Hours before the event the remaining balance falls due.
    pub grace_hours: i64,
    /// Email invoices to the customer as soon as they are created.
    pub auto_send: bool,
    pub line_item_description: String,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            gateway_timeout_secs: 15,
            grace_hours: DEFAULT_GRACE_HOURS,
            auto_send: true,
            line_item_description: "Bartending service.".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StripeConfig {
    pub api_key: Secret<String>,
    pub webhook_secret: Secret<String>,
    pub api_base_url: String,
    pub currency: String,
    pub timeout_secs: u64,
    /// Accepted age of a webhook signature timestamp.
    pub webhook_tolerance_secs: i64,
    pub invoice_footer: Option<String>,
}

impl Default for StripeConfig {
    fn default() -> Self {
        Self {
            api_key: Secret::new(String::new()),
            webhook_secret: Secret::new(String::new()),
            api_base_url: "https://api.stripe.com".to_string(),
            currency: "usd".to_string(),
            timeout_secs: 10,
            webhook_tolerance_secs: 300,
            invoice_footer: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// PostgreSQL URL. Without one the process keeps its ledger in memory.
    pub url: Option<Secret<String>>,
    pub max_connections: u32,
    pub run_migrations: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 5,
            run_migrations: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub payment_poll_enabled: bool,
    pub payment_poll_interval_secs: u64,
    pub lead_sweep_enabled: bool,
    pub lead_sweep_interval_secs: u64,
    /// Leads with no contact for this many days are archived.
    pub unresponsive_after_days: i64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            payment_poll_enabled: true,
            payment_poll_interval_secs: 15 * 60,
            lead_sweep_enabled: true,
            lead_sweep_interval_secs: 24 * 60 * 60,
            unresponsive_after_days: 14,
        }
    }
}

impl SweepConfig {
    /// Enabled sweeps need a non-zero interval.
    pub fn validate(&self) -> Result<(), BillingError> {
        let sweeps = [
            ("payment_poll", self.payment_poll_enabled, self.payment_poll_interval_secs),
            ("lead_sweep", self.lead_sweep_enabled, self.lead_sweep_interval_secs),
        ];
        for (name, enabled, interval_secs) in sweeps {
            if enabled && interval_secs == 0 {
                return Err(BillingError::Config(format!(
                    "{} interval must be greater than zero",
                    name
                )));
            }
        }
        Ok(())
    }
}

impl BillingConfig {
    pub fn load() -> Result<Self, AppError> {
        load_layered("billing", "BILLING")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_sources() {
        let config: BillingConfig =
            load_layered("does-not-exist", "QUOTE_BILLING_TEST_UNSET").unwrap();
        assert_eq!(config.common.service_name, "quote-billing");
        assert_eq!(config.lifecycle.grace_hours, 48);
        assert_eq!(config.sweeps.unresponsive_after_days, 14);
        assert_eq!(config.fees, FeeSchedule::default());
        assert!(config.invoice_types.is_none());
        assert!(config.database.url.is_none());
    }

    #[test]
    fn zero_interval_is_rejected_only_for_enabled_sweeps() {
        let mut sweeps = SweepConfig::default();
        assert!(sweeps.validate().is_ok());

        sweeps.payment_poll_interval_secs = 0;
        assert!(matches!(sweeps.validate(), Err(BillingError::Config(_))));

        sweeps.payment_poll_enabled = false;
        assert!(sweeps.validate().is_ok());
    }
}
