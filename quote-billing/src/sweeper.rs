//! Background sweeps.
//!
//! Each [`SweepTask`] runs on its own interval in its own tokio task. A run
//! always finishes (or is cancelled) before the next tick is taken, and ticks
//! missed while a run was in progress are skipped.

use crate::lifecycle::{Clock, InvoiceLifecycleManager};
use crate::services::ledger::LedgerStore;
use crate::services::metrics::SWEEP_RUNS_TOTAL;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait SweepTask: Send + Sync {
    fn name(&self) -> &'static str;

    fn interval(&self) -> Duration;

    /// One pass. Returns how many records it changed.
    async fn run_once(&self) -> anyhow::Result<u64>;
}

#[derive(Default)]
pub struct Sweeper {
    tasks: Vec<Arc<dyn SweepTask>>,
}

impl Sweeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_task(mut self, task: Arc<dyn SweepTask>) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Spawn every task. The first run of each happens immediately.
    pub fn start(self) -> SweeperHandle {
        let token = CancellationToken::new();
        let handles = self
            .tasks
            .into_iter()
            .map(|task| {
                let token = token.clone();
                tokio::spawn(run_task(task, token))
            })
            .collect();

        SweeperHandle { token, handles }
    }
}

pub struct SweeperHandle {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl SweeperHandle {
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Cancel all tasks and wait for them to stop.
    pub async fn shutdown(self) {
        self.token.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Sweep task panicked");
            }
        }
        tracing::info!("Sweeps stopped");
    }
}

async fn run_task(task: Arc<dyn SweepTask>, token: CancellationToken) {
    let name = task.name();
    let mut ticker = tokio::time::interval(task.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(task = name, interval_secs = task.interval().as_secs(), "Sweep started");

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        tokio::select! {
            _ = token.cancelled() => {
                tracing::info!(task = name, "Sweep run cancelled");
                break;
            }
            result = task.run_once() => match result {
                Ok(changed) => {
                    SWEEP_RUNS_TOTAL.with_label_values(&[name, "ok"]).inc();
                    tracing::info!(task = name, changed, "Sweep run complete");
                }
                Err(e) => {
                    SWEEP_RUNS_TOTAL.with_label_values(&[name, "error"]).inc();
                    tracing::error!(task = name, error = %e, "Sweep run failed");
                }
            }
        }
    }

    tracing::info!(task = name, "Sweep shutting down");
}

/// Marks Open invoices paid when the gateway says they were paid, covering
/// payments whose webhook never arrived.
pub struct PaymentPollSweep {
    manager: Arc<InvoiceLifecycleManager>,
    interval: Duration,
}

impl PaymentPollSweep {
    pub fn new(manager: Arc<InvoiceLifecycleManager>, interval: Duration) -> Self {
        Self { manager, interval }
    }
}

#[async_trait]
impl SweepTask for PaymentPollSweep {
    fn name(&self) -> &'static str {
        "payment_poll"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run_once(&self) -> anyhow::Result<u64> {
        let quote_ids = self.manager.ledger().list_quotes_with_open_invoices().await?;

        let mut paid = 0;
        for quote_id in quote_ids {
            match self.manager.sync_payments_for_quote(quote_id).await {
                Ok(outcomes) => paid += outcomes.len() as u64,
                Err(e) => {
                    tracing::warn!(quote_id = %quote_id, error = %e, "Payment sync failed for quote");
                }
            }
        }

        self.manager.locks().prune();
        Ok(paid)
    }
}

/// Archives leads nobody has heard from within the configured window.
pub struct UnresponsiveLeadSweep {
    ledger: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    unresponsive_after: chrono::Duration,
}

impl UnresponsiveLeadSweep {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        clock: Arc<dyn Clock>,
        interval: Duration,
        unresponsive_after: chrono::Duration,
    ) -> Self {
        Self {
            ledger,
            clock,
            interval,
            unresponsive_after,
        }
    }
}

#[async_trait]
impl SweepTask for UnresponsiveLeadSweep {
    fn name(&self) -> &'static str {
        "unresponsive_leads"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run_once(&self) -> anyhow::Result<u64> {
        let cutoff = self.clock.now() - self.unresponsive_after;
        let archived = self.ledger.archive_unresponsive_leads(cutoff).await?;
        if archived > 0 {
            tracing::info!(archived, cutoff = %cutoff, "Archived unresponsive leads");
        }
        Ok(archived)
    }
}
