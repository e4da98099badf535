//! Application wiring: ledger, gateway, lifecycle manager and sweeps.

use crate::config::BillingConfig;
use crate::invoice_types::{default_invoice_types, InvoiceTypeResolver};
use crate::lifecycle::{Clock, InvoiceLifecycleManager, LifecycleSettings, SystemClock};
use crate::pricing::PricingEngine;
use crate::services::{InMemoryLedger, LedgerStore, PaymentGateway, PgLedger, StripeClient, WebhookVerifier};
use crate::sweeper::{PaymentPollSweep, Sweeper, UnresponsiveLeadSweep};
use anyhow::Context;
use secrecy::ExposeSecret;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub struct Application {
    config: BillingConfig,
    ledger: Arc<dyn LedgerStore>,
    manager: Arc<InvoiceLifecycleManager>,
    webhook_verifier: WebhookVerifier,
    clock: Arc<dyn Clock>,
}

impl Application {
    pub async fn build(config: BillingConfig) -> anyhow::Result<Self> {
        let ledger: Arc<dyn LedgerStore> = match &config.database.url {
            Some(url) => {
                let pg = PgLedger::connect(url.expose_secret(), config.database.max_connections)
                    .await
                    .context("Failed to connect to ledger database")?;
                if config.database.run_migrations {
                    pg.run_migrations().await.context("Failed to migrate ledger database")?;
                }
                Arc::new(pg)
            }
            None if config.common.is_production() => {
                anyhow::bail!("A database URL is required in production")
            }
            None => {
                tracing::warn!("No database URL configured, keeping the ledger in memory");
                Arc::new(InMemoryLedger::new())
            }
        };

        let gateway = StripeClient::new(config.stripe.clone()).context("Failed to build Stripe client")?;
        if !gateway.is_configured() {
            tracing::warn!("Stripe API key not configured, gateway calls will fail");
        }

        Self::build_with(config, ledger, Arc::new(gateway), Arc::new(SystemClock)).await
    }

    /// Wire the application around an existing ledger and gateway.
    pub async fn build_with(
        config: BillingConfig,
        ledger: Arc<dyn LedgerStore>,
        gateway: Arc<dyn PaymentGateway>,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        config
            .sweeps
            .validate()
            .context("Invalid sweep configuration")?;

        let invoice_types = match &config.invoice_types {
            Some(types) => types.clone(),
            None => {
                let stored = ledger
                    .get_invoice_types()
                    .await
                    .context("Failed to load invoice types")?;
                if stored.is_empty() {
                    default_invoice_types()
                } else {
                    stored
                }
            }
        };

        let resolver = InvoiceTypeResolver::new(
            invoice_types,
            chrono::Duration::hours(config.lifecycle.grace_hours),
        )
        .context("Invalid invoice type configuration")?;

        let manager = Arc::new(InvoiceLifecycleManager::new(
            ledger.clone(),
            gateway,
            resolver,
            PricingEngine::new(config.fees.clone()),
            clock.clone(),
            LifecycleSettings::from(&config.lifecycle),
        ));

        let webhook_verifier = WebhookVerifier::new(
            config.stripe.webhook_secret.clone(),
            config.stripe.webhook_tolerance_secs,
        );

        tracing::info!(
            grace_hours = config.lifecycle.grace_hours,
            gateway_timeout_secs = config.lifecycle.gateway_timeout_secs,
            auto_send = config.lifecycle.auto_send,
            "Application built"
        );

        Ok(Self {
            config,
            ledger,
            manager,
            webhook_verifier,
            clock,
        })
    }

    pub fn manager(&self) -> Arc<InvoiceLifecycleManager> {
        self.manager.clone()
    }

    pub fn ledger(&self) -> Arc<dyn LedgerStore> {
        self.ledger.clone()
    }

    pub fn webhook_verifier(&self) -> &WebhookVerifier {
        &self.webhook_verifier
    }

    pub fn sweeper(&self) -> Sweeper {
        let sweeps = &self.config.sweeps;
        let mut sweeper = Sweeper::new();

        if sweeps.payment_poll_enabled {
            sweeper = sweeper.with_task(Arc::new(PaymentPollSweep::new(
                self.manager.clone(),
                Duration::from_secs(sweeps.payment_poll_interval_secs),
            )));
        }
        if sweeps.lead_sweep_enabled {
            sweeper = sweeper.with_task(Arc::new(UnresponsiveLeadSweep::new(
                self.ledger.clone(),
                self.clock.clone(),
                Duration::from_secs(sweeps.lead_sweep_interval_secs),
                chrono::Duration::days(sweeps.unresponsive_after_days),
            )));
        }

        sweeper
    }

    /// Run the sweeps until `shutdown` resolves, then stop them.
    pub async fn run_until_stopped<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let sweeper = self.sweeper();
        if sweeper.is_empty() {
            tracing::warn!("All sweeps disabled, waiting for shutdown");
        }

        let handle = sweeper.start();
        shutdown.await;
        handle.shutdown().await;
    }
}
