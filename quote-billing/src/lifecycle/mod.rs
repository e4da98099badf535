//! Invoice lifecycle orchestration.
//!
//! [`InvoiceLifecycleManager`] keeps the remote gateway's invoices in line
//! with a quote's current amount. Every routine runs under the quote's lock,
//! mutates the gateway first and writes the ledger only after the remote
//! side succeeded. Reconciliation reads the remote invoice before deciding
//! anything, so re-running it after a partial failure converges instead of
//! duplicating work.

mod clock;
mod locks;

pub use clock::{Clock, ManualClock, SystemClock};
pub use locks::QuoteLocks;

use crate::config::LifecycleConfig;
use crate::error::BillingError;
use crate::invoice_types::{BillingPlan, DueDatePolicy, InvoiceTypeResolver, ResolvedType};
use crate::models::money::{from_minor_units, round_to_cents, to_minor_units};
use crate::models::{Invoice, InvoiceKind, InvoiceStatus, NewInvoice, Quote};
use crate::pricing::PricingEngine;
use crate::services::gateway::{
    CreateInvoiceRequest, GatewayError, PaymentGateway, RemoteInvoice, RemoteInvoiceStatus,
};
use crate::services::ledger::{LedgerError, LedgerStore};
use crate::services::metrics::{
    ERRORS_TOTAL, GATEWAY_CALL_DURATION, INVOICE_TRANSITIONS_TOTAL, RECONCILIATIONS_TOTAL,
};
use crate::services::webhook::PaymentNotice;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub gateway_timeout: Duration,
    pub auto_send: bool,
    pub line_item_description: String,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self::from(&LifecycleConfig::default())
    }
}

impl From<&LifecycleConfig> for LifecycleSettings {
    fn from(config: &LifecycleConfig) -> Self {
        Self {
            gateway_timeout: Duration::from_secs(config.gateway_timeout_secs),
            auto_send: config.auto_send,
            line_item_description: config.line_item_description.clone(),
        }
    }
}

/// What a reconciliation did.
#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    pub quote_id: Uuid,
    pub amount: Decimal,
    /// Open rows after the run, one per invoice type still being billed.
    pub open_invoices: Vec<Invoice>,
    /// Remote ids whose Open row was replaced.
    pub superseded: Vec<String>,
    /// Remote ids found paid on the gateway and marked Paid locally.
    pub marked_paid: Vec<String>,
    /// Remote ids voided because nothing is left to bill or the gateway
    /// already voided them.
    pub voided: Vec<String>,
    /// Number of mutating gateway calls made.
    pub remote_mutations: usize,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.superseded.is_empty()
            && self.marked_paid.is_empty()
            && self.voided.is_empty()
            && self.remote_mutations == 0
    }
}

/// Result of a successful Open → Paid transition.
#[derive(Debug, Clone)]
pub struct PaymentOutcome {
    pub invoice: Invoice,
    pub kind: InvoiceKind,
    /// Paying this invoice secures the event date.
    pub books_event: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuoteBalance {
    pub quote_id: Uuid,
    pub amount: Decimal,
    pub paid: Decimal,
    pub outstanding: Decimal,
    /// The event is close enough that the remaining balance is due.
    pub within_grace_window: bool,
}

/// Order in which invoice kinds are processed within a quote. The deposit
/// goes first so a deposit found paid changes the remaining balance in the
/// same run.
fn processing_rank(kind: InvoiceKind) -> u8 {
    match kind {
        InvoiceKind::Deposit => 0,
        InvoiceKind::Full => 1,
        InvoiceKind::Remaining => 2,
    }
}

/// Key for a remote create. It must come out the same on every retry of one
/// logical invoice, so an immediate due date (which follows the clock) stays
/// out of it. `generation` separates reissues after the previous invoice of
/// the type was voided.
fn idempotency_key(
    quote: &Quote,
    resolved: &ResolvedType,
    amount_minor: i64,
    due_date: DateTime<Utc>,
    generation: usize,
) -> String {
    let base = format!(
        "{}-{}-{}-{}",
        quote.quote_id, resolved.invoice_type.invoice_type_id, generation, amount_minor
    );
    match resolved.due_date_policy {
        DueDatePolicy::Immediate => base,
        DueDatePolicy::BeforeEvent(_) => format!("{}-{}", base, due_date.timestamp()),
    }
}

fn same_instant(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
    a.timestamp() == b.timestamp()
}

pub struct InvoiceLifecycleManager {
    ledger: Arc<dyn LedgerStore>,
    gateway: Arc<dyn PaymentGateway>,
    resolver: InvoiceTypeResolver,
    pricing: PricingEngine,
    clock: Arc<dyn Clock>,
    settings: LifecycleSettings,
    locks: QuoteLocks,
}

impl InvoiceLifecycleManager {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        gateway: Arc<dyn PaymentGateway>,
        resolver: InvoiceTypeResolver,
        pricing: PricingEngine,
        clock: Arc<dyn Clock>,
        settings: LifecycleSettings,
    ) -> Self {
        Self {
            ledger,
            gateway,
            resolver,
            pricing,
            clock,
            settings,
            locks: QuoteLocks::new(),
        }
    }

    pub fn resolver(&self) -> &InvoiceTypeResolver {
        &self.resolver
    }

    pub fn pricing(&self) -> &PricingEngine {
        &self.pricing
    }

    pub fn ledger(&self) -> &Arc<dyn LedgerStore> {
        &self.ledger
    }

    pub fn locks(&self) -> &QuoteLocks {
        &self.locks
    }

    /// Run a gateway call under the configured timeout, recording its
    /// duration.
    async fn call<T, F>(&self, operation: &'static str, fut: F) -> Result<T, BillingError>
    where
        F: Future<Output = Result<T, GatewayError>>,
    {
        let timer = GATEWAY_CALL_DURATION
            .with_label_values(&[operation])
            .start_timer();
        let result = tokio::time::timeout(self.settings.gateway_timeout, fut).await;
        timer.observe_duration();

        let err = match result {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) => err,
            Err(_) => GatewayError::Timeout,
        };

        warn!(operation, error = %err, "Gateway call failed");
        ERRORS_TOTAL.with_label_values(&["gateway"]).inc();
        Err(BillingError::gateway(operation, err))
    }

    fn diverged(&self, remote_invoice_id: &str, source: LedgerError) -> BillingError {
        error!(
            remote_invoice_id,
            error = %source,
            "Ledger write failed after remote mutation; local and remote state have diverged"
        );
        ERRORS_TOTAL.with_label_values(&["ledger_diverged"]).inc();
        BillingError::LedgerDiverged {
            remote_invoice_id: remote_invoice_id.to_string(),
            source,
        }
    }

    fn guard_trip(&self, invoice: &Invoice, to: InvoiceStatus) -> BillingError {
        warn!(
            remote_invoice_id = %invoice.remote_invoice_id,
            from = %invoice.status,
            to = %to,
            "Invoice guard trip: terminal invoice cannot change"
        );
        ERRORS_TOTAL.with_label_values(&["guard_trip"]).inc();
        BillingError::InvalidTransition {
            remote_invoice_id: invoice.remote_invoice_id.clone(),
            from: invoice.status,
            to,
        }
    }

    /// Price the quote from its stored line items. The result is stored by
    /// [`Self::persist_amount`] once the invoices carry it.
    async fn price_quote(&self, quote: &Quote) -> Result<Decimal, BillingError> {
        let line_items = self.ledger.get_line_items_for_quote(quote.quote_id).await?;
        if line_items.is_empty() {
            return Err(BillingError::Validation("quote has no line items".to_string()));
        }

        let amount = self.pricing.compute_amount(&line_items);
        if amount <= Decimal::ZERO {
            return Err(BillingError::Validation(format!(
                "quote amount must be positive, got {}",
                amount
            )));
        }

        Ok(amount)
    }

    async fn persist_amount(&self, quote: &Quote, amount: Decimal) -> Result<(), BillingError> {
        if amount != quote.amount {
            self.ledger.update_quote_amount(quote.quote_id, amount).await?;
            info!(old_amount = %quote.amount, new_amount = %amount, "Quote amount updated");
        }
        Ok(())
    }

    /// Amount an invoice of `resolved` type should carry. Once the deposit is
    /// paid, the remaining invoice bills whatever the deposit did not cover.
    fn target_amount(resolved: &ResolvedType, amount: Decimal, paid_deposit: Option<Decimal>) -> Decimal {
        match (resolved.kind(), paid_deposit) {
            (InvoiceKind::Remaining, Some(paid)) => round_to_cents((amount - paid).max(Decimal::ZERO)),
            _ => round_to_cents(amount * resolved.percentage()),
        }
    }

    fn paid_deposit(&self, invoices: &[Invoice]) -> Option<Decimal> {
        invoices
            .iter()
            .filter(|i| i.status == InvoiceStatus::Paid)
            .find(|i| {
                self.resolver
                    .resolve(i.invoice_type_id)
                    .is_ok_and(|r| r.kind() == InvoiceKind::Deposit)
            })
            .map(|i| i.amount)
    }

    /// Gateway customer for the quote's lead, created on first use.
    async fn customer_for(&self, quote: &Quote) -> Result<String, BillingError> {
        let contact = self
            .ledger
            .get_billing_contact(quote.lead_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("lead {}", quote.lead_id)))?;

        if let Some(customer_id) = contact.gateway_customer_id {
            return Ok(customer_id);
        }

        let customer_id = self
            .call(
                "ensure_customer",
                self.gateway.ensure_customer(&contact.email, &contact.full_name),
            )
            .await?;
        self.ledger
            .assign_gateway_customer(quote.lead_id, &customer_id)
            .await?;

        info!(lead_id = %quote.lead_id, customer_id = %customer_id, "Gateway customer assigned");
        Ok(customer_id)
    }

    /// Issue the plan's invoices for a quote.
    ///
    /// Kinds that already have an Open or Paid invoice are left alone, so
    /// calling this again after a partial failure only issues what is
    /// missing.
    #[instrument(skip(self, quote), fields(quote_id = %quote.quote_id, plan = ?plan))]
    pub async fn create_invoices_for_quote(
        &self,
        quote: &Quote,
        plan: BillingPlan,
    ) -> Result<Vec<Invoice>, BillingError> {
        quote.validate_for_billing()?;
        let _guard = self.locks.acquire(quote.quote_id).await;

        let amount = self.price_quote(quote).await?;
        let existing = self.ledger.get_invoices_for_quote(quote.quote_id).await?;

        for invoice in existing.iter().filter(|i| i.status != InvoiceStatus::Void) {
            let kind = self.resolver.resolve(invoice.invoice_type_id)?.kind();
            if BillingPlan::of_kind(kind) != plan {
                return Err(BillingError::PlanConflict(format!(
                    "quote already has a {} invoice ({}), cannot bill it as {:?}",
                    kind, invoice.remote_invoice_id, plan
                )));
            }
        }

        let paid_deposit = self.paid_deposit(&existing);
        let mut customer_id = None;
        let mut created = Vec::new();

        for &kind in plan.kinds() {
            let resolved = self.resolver.resolve_kind(kind)?;
            let type_id = resolved.invoice_type.invoice_type_id;
            let already_billed = existing.iter().any(|i| {
                i.invoice_type_id == type_id
                    && matches!(i.status, InvoiceStatus::Open | InvoiceStatus::Paid)
            });
            if already_billed {
                info!(kind = %kind, "Invoice already issued, skipping");
                continue;
            }

            let target = Self::target_amount(&resolved, amount, paid_deposit);
            if target <= Decimal::ZERO {
                info!(kind = %kind, "Nothing left to bill, skipping");
                continue;
            }

            let customer = match customer_id.take() {
                Some(id) => id,
                None => self.customer_for(quote).await?,
            };

            // Voided predecessors of this type; unchanged by a failed attempt.
            let generation = existing
                .iter()
                .filter(|i| i.invoice_type_id == type_id && i.status == InvoiceStatus::Void)
                .count();
            let invoice = self
                .issue_invoice(quote, &resolved, &customer, target, generation)
                .await?;
            created.push(invoice);
            customer_id = Some(customer);
        }

        self.persist_amount(quote, amount).await?;
        Ok(created)
    }

    async fn issue_invoice(
        &self,
        quote: &Quote,
        resolved: &ResolvedType,
        customer_id: &str,
        amount: Decimal,
        generation: usize,
    ) -> Result<Invoice, BillingError> {
        let now = self.clock.now();
        let kind = resolved.kind();
        let amount_minor = to_minor_units(amount)?;
        let due_date = resolved.due_date_policy.due_date(now, quote.event_date);

        let request = CreateInvoiceRequest {
            customer_id: customer_id.to_string(),
            due_date,
            description: kind.description().to_string(),
            idempotency_key: idempotency_key(quote, resolved, amount_minor, due_date, generation),
        };
        let remote_id = self
            .call("create_invoice", self.gateway.create_invoice(&request))
            .await?;

        // A replayed create returns an invoice that may already carry its item.
        let items = self
            .call("list_line_items", self.gateway.list_line_items(&remote_id))
            .await?;
        let in_place = items.len() == 1 && items[0].amount_minor == amount_minor;
        if !in_place {
            for item in &items {
                self.call("delete_line_item", self.gateway.delete_line_item(&item.line_item_id))
                    .await?;
            }
            self.call(
                "attach_line_item",
                self.gateway.attach_line_item(
                    customer_id,
                    &remote_id,
                    amount_minor,
                    &self.settings.line_item_description,
                ),
            )
            .await?;
        }

        self.call("finalize_invoice", self.gateway.finalize_invoice(&remote_id))
            .await?;

        let hosted_url = if self.settings.auto_send {
            self.call("send_invoice", self.gateway.send_invoice(&remote_id))
                .await?
        } else {
            self.call("get_invoice", self.gateway.get_invoice(&remote_id))
                .await?
                .hosted_url
        };

        let record = self
            .ledger
            .insert_invoice(NewInvoice {
                remote_invoice_id: remote_id.clone(),
                quote_id: quote.quote_id,
                invoice_type_id: resolved.invoice_type.invoice_type_id,
                amount,
                due_date,
                hosted_url,
                created_utc: now,
            })
            .await
            .map_err(|e| self.diverged(&remote_id, e))?;

        INVOICE_TRANSITIONS_TOTAL.with_label_values(&["open"]).inc();
        info!(
            remote_invoice_id = %remote_id,
            kind = %kind,
            amount = %amount,
            due_date = %due_date,
            "Invoice issued"
        );
        Ok(record)
    }

    /// Bring every Open invoice of an edited quote in line with its new
    /// amount and event date.
    ///
    /// For each Open invoice the remote side is read first. Paid remote
    /// invoices are marked Paid locally and never touched. Otherwise the
    /// remote line items and due date are rewritten only where they differ
    /// from the target, the invoice is finalized, and the local row is
    /// voided and replaced. A quote that is already reconciled produces no
    /// remote mutation and no ledger write.
    #[instrument(skip(self, quote), fields(quote_id = %quote.quote_id))]
    pub async fn reconcile_on_quote_edit(&self, quote: &Quote) -> Result<ReconcileReport, BillingError> {
        quote.validate_for_billing()?;
        let _guard = self.locks.acquire(quote.quote_id).await;

        let result = self.reconcile_locked(quote).await;
        let outcome = match &result {
            Ok(report) if report.is_noop() => "unchanged",
            Ok(_) => "updated",
            Err(_) => "failed",
        };
        RECONCILIATIONS_TOTAL.with_label_values(&[outcome]).inc();
        result
    }

    async fn reconcile_locked(&self, quote: &Quote) -> Result<ReconcileReport, BillingError> {
        let amount = self.price_quote(quote).await?;
        let invoices = self.ledger.get_invoices_for_quote(quote.quote_id).await?;
        let mut paid_deposit = self.paid_deposit(&invoices);

        let mut work = Vec::new();
        for invoice in invoices.into_iter().filter(|i| i.status == InvoiceStatus::Open) {
            let resolved = self.resolver.resolve(invoice.invoice_type_id)?;
            work.push((invoice, resolved));
        }
        work.sort_by_key(|(_, resolved)| processing_rank(resolved.kind()));

        let mut report = ReconcileReport {
            quote_id: quote.quote_id,
            amount,
            ..ReconcileReport::default()
        };

        for (invoice, resolved) in work {
            let remote_id = invoice.remote_invoice_id.clone();
            let remote = self
                .call("get_invoice", self.gateway.get_invoice(&remote_id))
                .await?;

            match remote.status {
                RemoteInvoiceStatus::Paid => {
                    let paid_at = remote.paid_at.unwrap_or_else(|| self.clock.now());
                    if self
                        .ledger
                        .set_invoice_status(&remote_id, InvoiceStatus::Paid, paid_at)
                        .await?
                    {
                        INVOICE_TRANSITIONS_TOTAL.with_label_values(&["paid"]).inc();
                    }
                    if resolved.kind() == InvoiceKind::Deposit {
                        paid_deposit = Some(invoice.amount);
                    }
                    info!(remote_invoice_id = %remote_id, "Invoice paid on gateway, not modifying");
                    report.marked_paid.push(remote_id);
                    continue;
                }
                RemoteInvoiceStatus::Void => {
                    if self
                        .ledger
                        .set_invoice_status(&remote_id, InvoiceStatus::Void, self.clock.now())
                        .await?
                    {
                        INVOICE_TRANSITIONS_TOTAL.with_label_values(&["void"]).inc();
                    }
                    warn!(remote_invoice_id = %remote_id, "Invoice voided on gateway, closing local row");
                    report.voided.push(remote_id);
                    continue;
                }
                _ => {}
            }

            let target = Self::target_amount(&resolved, amount, paid_deposit);
            if target <= Decimal::ZERO {
                self.void_remote_and_local(&remote_id, &mut report).await?;
                continue;
            }

            let replacement = self
                .reconcile_invoice(quote, &invoice, &resolved, &remote, target, &mut report)
                .await?;
            report.open_invoices.push(replacement);
        }

        self.persist_amount(quote, amount).await?;
        Ok(report)
    }

    async fn reconcile_invoice(
        &self,
        quote: &Quote,
        invoice: &Invoice,
        resolved: &ResolvedType,
        remote: &RemoteInvoice,
        target: Decimal,
        report: &mut ReconcileReport,
    ) -> Result<Invoice, BillingError> {
        let remote_id = invoice.remote_invoice_id.as_str();
        let now = self.clock.now();
        let target_minor = to_minor_units(target)?;

        let items = self
            .call("list_line_items", self.gateway.list_line_items(remote_id))
            .await?;
        let amount_matches = items.len() == 1 && items[0].amount_minor == target_minor;

        let target_due = match resolved.due_date_policy {
            // An unchanged immediate invoice keeps the date it was issued with.
            DueDatePolicy::Immediate if amount_matches => remote.due_date.unwrap_or(now),
            policy => policy.due_date(now, quote.event_date),
        };
        let due_matches = remote.due_date.is_some_and(|d| same_instant(d, target_due));

        if amount_matches && due_matches {
            let local_matches = invoice.amount == target && same_instant(invoice.due_date, target_due);
            if local_matches {
                return Ok(invoice.clone());
            }

            // Remote already holds the target (an earlier run failed after
            // mutating it); only the ledger needs to catch up.
            let replacement = self
                .ledger
                .supersede_invoice(
                    invoice.invoice_id,
                    self.replacement_row(invoice, target, target_due, remote.hosted_url.clone(), now),
                    now,
                )
                .await?;
            self.record_supersede(invoice, &replacement, report);
            return Ok(replacement);
        }

        if !amount_matches {
            for item in &items {
                self.call("delete_line_item", self.gateway.delete_line_item(&item.line_item_id))
                    .await?;
                report.remote_mutations += 1;
            }
            self.call(
                "attach_line_item",
                self.gateway.attach_line_item(
                    &remote.customer_id,
                    remote_id,
                    target_minor,
                    &self.settings.line_item_description,
                ),
            )
            .await?;
            report.remote_mutations += 1;
        }

        if !due_matches {
            self.call("update_due_date", self.gateway.update_due_date(remote_id, target_due))
                .await?;
            report.remote_mutations += 1;
        }

        self.call("finalize_invoice", self.gateway.finalize_invoice(remote_id))
            .await?;

        // Build the new row from what the gateway now reports.
        let refreshed = self
            .call("get_invoice", self.gateway.get_invoice(remote_id))
            .await?;
        let due_date = refreshed.due_date.unwrap_or(target_due);
        let hosted_url = refreshed.hosted_url.or_else(|| remote.hosted_url.clone());

        let replacement = self
            .ledger
            .supersede_invoice(
                invoice.invoice_id,
                self.replacement_row(invoice, target, due_date, hosted_url, now),
                now,
            )
            .await
            .map_err(|e| self.diverged(remote_id, e))?;

        self.record_supersede(invoice, &replacement, report);
        Ok(replacement)
    }

    fn replacement_row(
        &self,
        invoice: &Invoice,
        amount: Decimal,
        due_date: DateTime<Utc>,
        hosted_url: Option<String>,
        now: DateTime<Utc>,
    ) -> NewInvoice {
        NewInvoice {
            remote_invoice_id: invoice.remote_invoice_id.clone(),
            quote_id: invoice.quote_id,
            invoice_type_id: invoice.invoice_type_id,
            amount,
            due_date,
            hosted_url: hosted_url.or_else(|| invoice.hosted_url.clone()),
            created_utc: now,
        }
    }

    fn record_supersede(&self, old: &Invoice, new: &Invoice, report: &mut ReconcileReport) {
        INVOICE_TRANSITIONS_TOTAL.with_label_values(&["void"]).inc();
        INVOICE_TRANSITIONS_TOTAL.with_label_values(&["open"]).inc();
        info!(
            remote_invoice_id = %old.remote_invoice_id,
            old_amount = %old.amount,
            new_amount = %new.amount,
            due_date = %new.due_date,
            "Invoice reconciled"
        );
        report.superseded.push(old.remote_invoice_id.clone());
    }

    async fn void_remote_and_local(
        &self,
        remote_id: &str,
        report: &mut ReconcileReport,
    ) -> Result<(), BillingError> {
        self.call("void_invoice", self.gateway.void_invoice(remote_id))
            .await?;
        report.remote_mutations += 1;

        self.ledger
            .set_invoice_status(remote_id, InvoiceStatus::Void, self.clock.now())
            .await
            .map_err(|e| self.diverged(remote_id, e))?;

        INVOICE_TRANSITIONS_TOTAL.with_label_values(&["void"]).inc();
        info!(remote_invoice_id = %remote_id, "Invoice voided");
        report.voided.push(remote_id.to_string());
        Ok(())
    }

    /// Open row for `remote_invoice_id`, or a guard trip if the invoice is
    /// already terminal.
    async fn open_invoice(&self, remote_invoice_id: &str, to: InvoiceStatus) -> Result<Invoice, BillingError> {
        let invoice = self
            .ledger
            .get_current_invoice(remote_invoice_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("invoice {}", remote_invoice_id)))?;

        if !invoice.status.can_transition_to(to) {
            return Err(self.guard_trip(&invoice, to));
        }
        Ok(invoice)
    }

    async fn quote_of(&self, remote_invoice_id: &str) -> Result<Uuid, BillingError> {
        self.ledger
            .get_current_invoice(remote_invoice_id)
            .await?
            .map(|i| i.quote_id)
            .ok_or_else(|| BillingError::NotFound(format!("invoice {}", remote_invoice_id)))
    }

    async fn outcome_for(&self, remote_invoice_id: &str) -> Result<PaymentOutcome, BillingError> {
        let invoice = self
            .ledger
            .get_current_invoice(remote_invoice_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("invoice {}", remote_invoice_id)))?;
        let kind = self.resolver.resolve(invoice.invoice_type_id)?.kind();
        Ok(PaymentOutcome {
            invoice,
            kind,
            books_event: kind.books_event(),
        })
    }

    /// Record a payment the gateway reported. Only Open invoices move.
    #[instrument(skip(self))]
    pub async fn mark_paid(
        &self,
        remote_invoice_id: &str,
        paid_at: DateTime<Utc>,
    ) -> Result<PaymentOutcome, BillingError> {
        let quote_id = self.quote_of(remote_invoice_id).await?;
        let _guard = self.locks.acquire(quote_id).await;
        self.mark_paid_locked(remote_invoice_id, paid_at).await
    }

    async fn mark_paid_locked(
        &self,
        remote_invoice_id: &str,
        paid_at: DateTime<Utc>,
    ) -> Result<PaymentOutcome, BillingError> {
        let invoice = self.open_invoice(remote_invoice_id, InvoiceStatus::Paid).await?;

        if !self
            .ledger
            .set_invoice_status(remote_invoice_id, InvoiceStatus::Paid, paid_at)
            .await?
        {
            return Err(self.guard_trip(&invoice, InvoiceStatus::Paid));
        }

        INVOICE_TRANSITIONS_TOTAL.with_label_values(&["paid"]).inc();
        let outcome = self.outcome_for(remote_invoice_id).await?;
        info!(
            remote_invoice_id,
            kind = %outcome.kind,
            books_event = outcome.books_event,
            "Invoice paid"
        );
        Ok(outcome)
    }

    /// Apply a verified payment webhook. Redelivered events for invoices
    /// that are already paid, and invoices this ledger does not know, are
    /// acknowledged without change.
    #[instrument(skip(self, notice), fields(event_id = %notice.event_id, remote_invoice_id = %notice.remote_invoice_id))]
    pub async fn apply_payment_notice(&self, notice: &PaymentNotice) -> Result<Option<PaymentOutcome>, BillingError> {
        let quote_id = match self.quote_of(&notice.remote_invoice_id).await {
            Ok(quote_id) => quote_id,
            Err(BillingError::NotFound(_)) => {
                warn!("Payment notice for unknown invoice ignored");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let _guard = self.locks.acquire(quote_id).await;
        let current = self.ledger.get_current_invoice(&notice.remote_invoice_id).await?;
        if current.is_some_and(|i| i.status == InvoiceStatus::Paid) {
            info!("Invoice already paid, duplicate notice ignored");
            return Ok(None);
        }

        let outcome = self
            .mark_paid_locked(&notice.remote_invoice_id, notice.paid_at)
            .await?;

        let reported = from_minor_units(notice.amount_paid_minor);
        if reported != outcome.invoice.amount {
            warn!(
                reported = %reported,
                invoiced = %outcome.invoice.amount,
                "Paid amount differs from invoiced amount"
            );
        }
        Ok(Some(outcome))
    }

    /// Record a payment collected outside the gateway: mark the remote
    /// invoice paid out of band, then the local row.
    #[instrument(skip(self))]
    pub async fn record_offline_payment(
        &self,
        remote_invoice_id: &str,
        paid_at: DateTime<Utc>,
    ) -> Result<PaymentOutcome, BillingError> {
        let quote_id = self.quote_of(remote_invoice_id).await?;
        let _guard = self.locks.acquire(quote_id).await;

        self.open_invoice(remote_invoice_id, InvoiceStatus::Paid).await?;

        self.call(
            "mark_paid_out_of_band",
            self.gateway.mark_paid_out_of_band(remote_invoice_id),
        )
        .await?;

        self.ledger
            .set_invoice_status(remote_invoice_id, InvoiceStatus::Paid, paid_at)
            .await
            .map_err(|e| self.diverged(remote_invoice_id, e))?;

        INVOICE_TRANSITIONS_TOTAL.with_label_values(&["paid"]).inc();
        info!(remote_invoice_id, "Offline payment recorded");
        self.outcome_for(remote_invoice_id).await
    }

    /// Void every Open invoice of an abandoned quote. Paid invoices are never
    /// touched; an invoice found paid on the gateway is marked Paid instead.
    #[instrument(skip(self))]
    pub async fn void_open_invoices_for_quote(&self, quote_id: Uuid) -> Result<ReconcileReport, BillingError> {
        if quote_id.is_nil() {
            return Err(BillingError::Validation("quote id is missing".to_string()));
        }
        let _guard = self.locks.acquire(quote_id).await;

        let mut report = ReconcileReport {
            quote_id,
            ..ReconcileReport::default()
        };

        for invoice in self.ledger.get_open_invoices_for_quote(quote_id).await? {
            let remote_id = invoice.remote_invoice_id.clone();
            let remote = self
                .call("get_invoice", self.gateway.get_invoice(&remote_id))
                .await?;

            match remote.status {
                RemoteInvoiceStatus::Paid => {
                    let paid_at = remote.paid_at.unwrap_or_else(|| self.clock.now());
                    self.ledger
                        .set_invoice_status(&remote_id, InvoiceStatus::Paid, paid_at)
                        .await?;
                    INVOICE_TRANSITIONS_TOTAL.with_label_values(&["paid"]).inc();
                    warn!(remote_invoice_id = %remote_id, "Invoice paid on gateway, not voiding");
                    report.marked_paid.push(remote_id);
                }
                RemoteInvoiceStatus::Void => {
                    self.ledger
                        .set_invoice_status(&remote_id, InvoiceStatus::Void, self.clock.now())
                        .await?;
                    INVOICE_TRANSITIONS_TOTAL.with_label_values(&["void"]).inc();
                    report.voided.push(remote_id);
                }
                _ => self.void_remote_and_local(&remote_id, &mut report).await?,
            }
        }

        Ok(report)
    }

    /// Mark paid every Open invoice of the quote the gateway reports paid.
    #[instrument(skip(self))]
    pub async fn sync_payments_for_quote(&self, quote_id: Uuid) -> Result<Vec<PaymentOutcome>, BillingError> {
        let _guard = self.locks.acquire(quote_id).await;

        let mut outcomes = Vec::new();
        for invoice in self.ledger.get_open_invoices_for_quote(quote_id).await? {
            let remote = self
                .call("get_invoice", self.gateway.get_invoice(&invoice.remote_invoice_id))
                .await?;
            if remote.is_paid() {
                let paid_at = remote.paid_at.unwrap_or_else(|| self.clock.now());
                outcomes.push(self.mark_paid_locked(&invoice.remote_invoice_id, paid_at).await?);
            }
        }
        Ok(outcomes)
    }

    /// Amount, paid total and outstanding balance of a quote.
    #[instrument(skip(self))]
    pub async fn quote_balance(&self, quote_id: Uuid) -> Result<QuoteBalance, BillingError> {
        let quote = self
            .ledger
            .get_quote(quote_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("quote {}", quote_id)))?;

        let paid: Decimal = self
            .ledger
            .get_invoices_for_quote(quote_id)
            .await?
            .iter()
            .filter(|i| i.status == InvoiceStatus::Paid)
            .map(|i| i.amount)
            .sum();

        let due_from = quote.event_date - self.resolver.grace_window();
        Ok(QuoteBalance {
            quote_id,
            amount: quote.amount,
            paid,
            outstanding: (quote.amount - paid).max(Decimal::ZERO),
            within_grace_window: self.clock.now() >= due_from,
        })
    }
}
