//! quote-billing entry point: runs the background sweeps until stopped.

use quote_billing::config::BillingConfig;
use quote_billing::services::{get_metrics, init_metrics};
use quote_billing::startup::Application;

use service_core::observability::init_tracing;
use tokio::signal;

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = BillingConfig::load().map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        anyhow::anyhow!("Configuration error: {}", e)
    })?;

    init_tracing(
        &config.common.service_name,
        &config.common.log_level,
        config.common.otlp_endpoint.as_deref(),
    )?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = %config.common.environment,
        "Starting quote-billing"
    );

    init_metrics();

    tracing::info!(
        database_configured = config.database.url.is_some(),
        stripe_base_url = %config.stripe.api_base_url,
        payment_poll_enabled = config.sweeps.payment_poll_enabled,
        lead_sweep_enabled = config.sweeps.lead_sweep_enabled,
        "Configuration loaded"
    );

    let app = Application::build(config).await.map_err(|e| {
        tracing::error!(error = %e, "Failed to build application");
        e
    })?;

    app.run_until_stopped(shutdown_signal()).await;

    tracing::debug!(metrics = %get_metrics(), "Final metrics snapshot");

    tracing::info!("Service shutdown complete");
    Ok(())
}
