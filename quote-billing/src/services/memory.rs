//! In-process ledger for tests and local runs without PostgreSQL.
//!
//! Enforces the same rules as the SQL schema: one Open invoice per quote and
//! invoice type, and void + insert as a single step when superseding.

use crate::invoice_types::default_invoice_types;
use crate::models::{BillingContact, Invoice, InvoiceStatus, InvoiceType, NewInvoice, Quote, QuoteLineItem};
use crate::services::ledger::{LedgerError, LedgerStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct LeadRecord {
    contact: BillingContact,
    last_contact_utc: DateTime<Utc>,
    archived_utc: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct State {
    leads: HashMap<Uuid, LeadRecord>,
    quotes: HashMap<Uuid, Quote>,
    line_items: Vec<QuoteLineItem>,
    invoices: Vec<Invoice>,
    invoice_types: Vec<InvoiceType>,
}

impl State {
    fn ensure_no_open(&self, quote_id: Uuid, invoice_type_id: i32) -> Result<(), LedgerError> {
        let duplicate = self.invoices.iter().any(|i| {
            i.quote_id == quote_id
                && i.invoice_type_id == invoice_type_id
                && i.status == InvoiceStatus::Open
        });
        if duplicate {
            return Err(LedgerError::Conflict(format!(
                "quote {} already has an Open invoice of type {}",
                quote_id, invoice_type_id
            )));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct InMemoryLedger {
    state: Mutex<State>,
    fail_writes: AtomicBool,
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::with_invoice_types(default_invoice_types())
    }

    pub fn with_invoice_types(invoice_types: Vec<InvoiceType>) -> Self {
        Self {
            state: Mutex::new(State {
                invoice_types,
                ..State::default()
            }),
            fail_writes: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, LedgerError> {
        self.state
            .lock()
            .map_err(|_| LedgerError::Unavailable("ledger state lock poisoned".to_string()))
    }

    fn check_writable(&self) -> Result<(), LedgerError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(LedgerError::Unavailable("ledger writes are failing".to_string()));
        }
        Ok(())
    }

    /// Make every subsequent invoice write fail until switched off again.
    pub fn set_write_failure(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn upsert_lead(&self, contact: BillingContact, last_contact_utc: DateTime<Utc>) -> Result<(), LedgerError> {
        let mut state = self.lock()?;
        state.leads.insert(
            contact.lead_id,
            LeadRecord {
                contact,
                last_contact_utc,
                archived_utc: None,
            },
        );
        Ok(())
    }

    pub fn is_lead_archived(&self, lead_id: Uuid) -> Result<bool, LedgerError> {
        let state = self.lock()?;
        Ok(state
            .leads
            .get(&lead_id)
            .is_some_and(|lead| lead.archived_utc.is_some()))
    }

    pub fn upsert_quote(&self, quote: Quote) -> Result<(), LedgerError> {
        let mut state = self.lock()?;
        state.quotes.insert(quote.quote_id, quote);
        Ok(())
    }

    pub fn add_line_item(&self, item: QuoteLineItem) -> Result<(), LedgerError> {
        let mut state = self.lock()?;
        if !state.quotes.contains_key(&item.quote_id) {
            return Err(LedgerError::NotFound(format!("quote {}", item.quote_id)));
        }
        state.line_items.push(item);
        Ok(())
    }

    pub fn remove_line_item(&self, line_item_id: Uuid) -> Result<(), LedgerError> {
        let mut state = self.lock()?;
        state.line_items.retain(|i| i.line_item_id != line_item_id);
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedger {
    async fn get_quote(&self, quote_id: Uuid) -> Result<Option<Quote>, LedgerError> {
        Ok(self.lock()?.quotes.get(&quote_id).cloned())
    }

    async fn update_quote_amount(&self, quote_id: Uuid, amount: Decimal) -> Result<(), LedgerError> {
        let mut state = self.lock()?;
        let quote = state
            .quotes
            .get_mut(&quote_id)
            .ok_or_else(|| LedgerError::NotFound(format!("quote {}", quote_id)))?;
        quote.amount = amount;
        Ok(())
    }

    async fn get_line_items_for_quote(&self, quote_id: Uuid) -> Result<Vec<QuoteLineItem>, LedgerError> {
        Ok(self
            .lock()?
            .line_items
            .iter()
            .filter(|i| i.quote_id == quote_id)
            .cloned()
            .collect())
    }

    async fn get_open_invoices_for_quote(&self, quote_id: Uuid) -> Result<Vec<Invoice>, LedgerError> {
        let mut open: Vec<Invoice> = self
            .lock()?
            .invoices
            .iter()
            .filter(|i| i.quote_id == quote_id && i.status == InvoiceStatus::Open)
            .cloned()
            .collect();
        open.sort_by_key(|i| i.invoice_type_id);
        Ok(open)
    }

    async fn get_invoices_for_quote(&self, quote_id: Uuid) -> Result<Vec<Invoice>, LedgerError> {
        Ok(self
            .lock()?
            .invoices
            .iter()
            .filter(|i| i.quote_id == quote_id)
            .cloned()
            .collect())
    }

    async fn get_current_invoice(&self, remote_invoice_id: &str) -> Result<Option<Invoice>, LedgerError> {
        let state = self.lock()?;
        let rows = state
            .invoices
            .iter()
            .filter(|i| i.remote_invoice_id == remote_invoice_id);
        let open = rows.clone().find(|i| i.status == InvoiceStatus::Open);
        Ok(open.or_else(|| rows.last()).cloned())
    }

    async fn insert_invoice(&self, invoice: NewInvoice) -> Result<Invoice, LedgerError> {
        self.check_writable()?;
        let mut state = self.lock()?;
        state.ensure_no_open(invoice.quote_id, invoice.invoice_type_id)?;
        let inserted = invoice.into_open_invoice();
        state.invoices.push(inserted.clone());
        Ok(inserted)
    }

    async fn set_invoice_status(
        &self,
        remote_invoice_id: &str,
        status: InvoiceStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        self.check_writable()?;
        let mut state = self.lock()?;
        let Some(row) = state
            .invoices
            .iter_mut()
            .find(|i| i.remote_invoice_id == remote_invoice_id && i.status == InvoiceStatus::Open)
        else {
            return Ok(false);
        };

        row.status = status;
        match status {
            InvoiceStatus::Paid => row.paid_utc = Some(at),
            InvoiceStatus::Void => row.voided_utc = Some(at),
            InvoiceStatus::Open => {}
        }
        Ok(true)
    }

    async fn supersede_invoice(
        &self,
        invoice_id: Uuid,
        replacement: NewInvoice,
        at: DateTime<Utc>,
    ) -> Result<Invoice, LedgerError> {
        self.check_writable()?;
        let mut state = self.lock()?;
        let position = state
            .invoices
            .iter()
            .position(|i| i.invoice_id == invoice_id && i.status == InvoiceStatus::Open)
            .ok_or_else(|| LedgerError::Conflict(format!("invoice {} is no longer open", invoice_id)))?;

        let old_type = state.invoices[position].invoice_type_id;
        let old_quote = state.invoices[position].quote_id;
        if old_type != replacement.invoice_type_id || old_quote != replacement.quote_id {
            state.ensure_no_open(replacement.quote_id, replacement.invoice_type_id)?;
        }

        let old = &mut state.invoices[position];
        old.status = InvoiceStatus::Void;
        old.voided_utc = Some(at);

        let inserted = replacement.into_open_invoice();
        state.invoices.push(inserted.clone());
        Ok(inserted)
    }

    async fn get_invoice_types(&self) -> Result<Vec<InvoiceType>, LedgerError> {
        Ok(self.lock()?.invoice_types.clone())
    }

    async fn get_billing_contact(&self, lead_id: Uuid) -> Result<Option<BillingContact>, LedgerError> {
        Ok(self
            .lock()?
            .leads
            .get(&lead_id)
            .map(|lead| lead.contact.clone()))
    }

    async fn assign_gateway_customer(&self, lead_id: Uuid, customer_id: &str) -> Result<(), LedgerError> {
        let mut state = self.lock()?;
        let lead = state
            .leads
            .get_mut(&lead_id)
            .ok_or_else(|| LedgerError::NotFound(format!("lead {}", lead_id)))?;
        lead.contact.gateway_customer_id = Some(customer_id.to_string());
        Ok(())
    }

    async fn list_quotes_with_open_invoices(&self) -> Result<Vec<Uuid>, LedgerError> {
        let ids: BTreeSet<Uuid> = self
            .lock()?
            .invoices
            .iter()
            .filter(|i| i.status == InvoiceStatus::Open)
            .map(|i| i.quote_id)
            .collect();
        Ok(ids.into_iter().collect())
    }

    async fn archive_unresponsive_leads(&self, last_contact_before: DateTime<Utc>) -> Result<u64, LedgerError> {
        let mut state = self.lock()?;

        let booked: BTreeSet<Uuid> = state
            .invoices
            .iter()
            .filter(|i| i.status == InvoiceStatus::Paid)
            .filter_map(|i| state.quotes.get(&i.quote_id).map(|q| q.lead_id))
            .collect();

        let mut archived = 0;
        for lead in state.leads.values_mut() {
            if lead.archived_utc.is_none()
                && lead.last_contact_utc < last_contact_before
                && !booked.contains(&lead.contact.lead_id)
            {
                lead.archived_utc = Some(last_contact_before);
                archived += 1;
            }
        }
        Ok(archived)
    }
}
