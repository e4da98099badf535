#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use quote_billing::invoice_types::InvoiceTypeResolver;
use quote_billing::lifecycle::{InvoiceLifecycleManager, LifecycleSettings, ManualClock};
use quote_billing::models::{BillingContact, Quote, QuoteLineItem, ServiceOptions};
use quote_billing::pricing::PricingEngine;
use quote_billing::services::gateway::{
    CreateInvoiceRequest, GatewayError, PaymentGateway, RemoteInvoice, RemoteInvoiceStatus,
    RemoteLineItem,
};
use quote_billing::services::InMemoryLedger;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Gateway calls that change remote state.
pub const MUTATIONS: [&str; 9] = [
    "ensure_customer",
    "create_invoice",
    "attach_line_item",
    "delete_line_item",
    "update_due_date",
    "finalize_invoice",
    "send_invoice",
    "void_invoice",
    "mark_paid_out_of_band",
];

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

#[derive(Debug, Clone)]
pub struct FakeInvoice {
    pub customer_id: String,
    pub status: RemoteInvoiceStatus,
    pub due_date: DateTime<Utc>,
    pub items: Vec<RemoteLineItem>,
    pub paid_at: Option<DateTime<Utc>>,
}

impl FakeInvoice {
    pub fn total_minor(&self) -> i64 {
        self.items.iter().map(|i| i.amount_minor).sum()
    }
}

#[derive(Default)]
struct FakeState {
    next_id: u64,
    invoices: HashMap<String, FakeInvoice>,
    item_owner: HashMap<String, String>,
    idempotency: HashMap<String, String>,
    calls: Vec<&'static str>,
    failures: HashMap<&'static str, GatewayError>,
    delays: HashMap<&'static str, std::time::Duration>,
}

impl FakeState {
    fn id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}_{}", prefix, self.next_id)
    }
}

/// In-process stand-in for the invoicing gateway that records every call.
#[derive(Default)]
pub struct FakeGateway {
    state: Mutex<FakeState>,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    async fn enter(&self, op: &'static str) -> Result<(), GatewayError> {
        let delay = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(op);
            if let Some(err) = state.failures.remove(op) {
                return Err(err);
            }
            state.delays.get(op).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    /// Fail the next call to `op` with `err`.
    pub fn fail_next(&self, op: &'static str, err: GatewayError) {
        self.state.lock().unwrap().failures.insert(op, err);
    }

    /// Make every call to `op` take `delay`.
    pub fn delay(&self, op: &'static str, delay: std::time::Duration) {
        self.state.lock().unwrap().delays.insert(op, delay);
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    pub fn mutation_count(&self) -> usize {
        self.calls().iter().filter(|c| MUTATIONS.contains(c)).count()
    }

    pub fn count(&self, op: &str) -> usize {
        self.calls().iter().filter(|c| **c == op).count()
    }

    pub fn invoice(&self, remote_id: &str) -> FakeInvoice {
        self.state.lock().unwrap().invoices[remote_id].clone()
    }

    pub fn invoice_count(&self) -> usize {
        self.state.lock().unwrap().invoices.len()
    }

    /// Simulate the customer paying on the hosted page.
    pub fn pay(&self, remote_id: &str, at: DateTime<Utc>) {
        let mut state = self.state.lock().unwrap();
        let invoice = state.invoices.get_mut(remote_id).unwrap();
        invoice.status = RemoteInvoiceStatus::Paid;
        invoice.paid_at = Some(at);
    }

    pub fn void_remotely(&self, remote_id: &str) {
        let mut state = self.state.lock().unwrap();
        state.invoices.get_mut(remote_id).unwrap().status = RemoteInvoiceStatus::Void;
    }

    fn editable(invoice: &FakeInvoice, remote_id: &str) -> Result<(), GatewayError> {
        match invoice.status {
            RemoteInvoiceStatus::Draft | RemoteInvoiceStatus::Open => Ok(()),
            _ => Err(GatewayError::Api {
                status: 400,
                code: Some("invoice_not_editable".to_string()),
                message: format!("invoice {} is not editable", remote_id),
            }),
        }
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn ensure_customer(&self, _email: &str, _full_name: &str) -> Result<String, GatewayError> {
        self.enter("ensure_customer").await?;
        Ok(self.state.lock().unwrap().id("cus"))
    }

    async fn create_invoice(&self, request: &CreateInvoiceRequest) -> Result<String, GatewayError> {
        self.enter("create_invoice").await?;
        let mut state = self.state.lock().unwrap();
        if let Some(existing) = state.idempotency.get(&request.idempotency_key) {
            return Ok(existing.clone());
        }

        let id = state.id("in");
        state.invoices.insert(
            id.clone(),
            FakeInvoice {
                customer_id: request.customer_id.clone(),
                status: RemoteInvoiceStatus::Draft,
                due_date: request.due_date,
                items: Vec::new(),
                paid_at: None,
            },
        );
        state
            .idempotency
            .insert(request.idempotency_key.clone(), id.clone());
        Ok(id)
    }

    async fn attach_line_item(
        &self,
        _customer_id: &str,
        remote_invoice_id: &str,
        amount_minor: i64,
        description: &str,
    ) -> Result<String, GatewayError> {
        self.enter("attach_line_item").await?;
        let mut state = self.state.lock().unwrap();
        let item_id = state.id("ii");
        let invoice = state
            .invoices
            .get_mut(remote_invoice_id)
            .ok_or_else(|| GatewayError::NotFound(remote_invoice_id.to_string()))?;
        Self::editable(invoice, remote_invoice_id)?;
        invoice.items.push(RemoteLineItem {
            line_item_id: item_id.clone(),
            amount_minor,
            description: Some(description.to_string()),
        });
        state
            .item_owner
            .insert(item_id.clone(), remote_invoice_id.to_string());
        Ok(item_id)
    }

    async fn list_line_items(&self, remote_invoice_id: &str) -> Result<Vec<RemoteLineItem>, GatewayError> {
        self.enter("list_line_items").await?;
        let state = self.state.lock().unwrap();
        state
            .invoices
            .get(remote_invoice_id)
            .map(|i| i.items.clone())
            .ok_or_else(|| GatewayError::NotFound(remote_invoice_id.to_string()))
    }

    async fn delete_line_item(&self, line_item_id: &str) -> Result<(), GatewayError> {
        self.enter("delete_line_item").await?;
        let mut state = self.state.lock().unwrap();
        let owner = state
            .item_owner
            .get(line_item_id)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(line_item_id.to_string()))?;
        let invoice = state.invoices.get_mut(&owner).unwrap();
        Self::editable(invoice, &owner)?;
        invoice.items.retain(|i| i.line_item_id != line_item_id);
        Ok(())
    }

    async fn update_due_date(&self, remote_invoice_id: &str, due_date: DateTime<Utc>) -> Result<(), GatewayError> {
        self.enter("update_due_date").await?;
        let mut state = self.state.lock().unwrap();
        let invoice = state
            .invoices
            .get_mut(remote_invoice_id)
            .ok_or_else(|| GatewayError::NotFound(remote_invoice_id.to_string()))?;
        Self::editable(invoice, remote_invoice_id)?;
        invoice.due_date = due_date;
        Ok(())
    }

    async fn finalize_invoice(&self, remote_invoice_id: &str) -> Result<(), GatewayError> {
        self.enter("finalize_invoice").await?;
        let mut state = self.state.lock().unwrap();
        let invoice = state
            .invoices
            .get_mut(remote_invoice_id)
            .ok_or_else(|| GatewayError::NotFound(remote_invoice_id.to_string()))?;
        if invoice.status == RemoteInvoiceStatus::Draft {
            invoice.status = RemoteInvoiceStatus::Open;
        }
        Ok(())
    }

    async fn send_invoice(&self, remote_invoice_id: &str) -> Result<Option<String>, GatewayError> {
        self.enter("send_invoice").await?;
        Ok(Some(format!("https://pay.example.com/{}", remote_invoice_id)))
    }

    async fn get_invoice(&self, remote_invoice_id: &str) -> Result<RemoteInvoice, GatewayError> {
        self.enter("get_invoice").await?;
        let state = self.state.lock().unwrap();
        let invoice = state
            .invoices
            .get(remote_invoice_id)
            .ok_or_else(|| GatewayError::NotFound(remote_invoice_id.to_string()))?;
        let total = invoice.total_minor();
        let paid = invoice.status == RemoteInvoiceStatus::Paid;
        Ok(RemoteInvoice {
            remote_invoice_id: remote_invoice_id.to_string(),
            customer_id: invoice.customer_id.clone(),
            status: invoice.status,
            due_date: Some(invoice.due_date),
            amount_due_minor: if paid { 0 } else { total },
            amount_paid_minor: if paid { total } else { 0 },
            hosted_url: Some(format!("https://pay.example.com/{}", remote_invoice_id)),
            paid_at: invoice.paid_at,
        })
    }

    async fn void_invoice(&self, remote_invoice_id: &str) -> Result<(), GatewayError> {
        self.enter("void_invoice").await?;
        let mut state = self.state.lock().unwrap();
        let invoice = state
            .invoices
            .get_mut(remote_invoice_id)
            .ok_or_else(|| GatewayError::NotFound(remote_invoice_id.to_string()))?;
        Self::editable(invoice, remote_invoice_id)?;
        invoice.status = RemoteInvoiceStatus::Void;
        Ok(())
    }

    async fn mark_paid_out_of_band(&self, remote_invoice_id: &str) -> Result<(), GatewayError> {
        self.enter("mark_paid_out_of_band").await?;
        let mut state = self.state.lock().unwrap();
        let invoice = state
            .invoices
            .get_mut(remote_invoice_id)
            .ok_or_else(|| GatewayError::NotFound(remote_invoice_id.to_string()))?;
        Self::editable(invoice, remote_invoice_id)?;
        invoice.status = RemoteInvoiceStatus::Paid;
        Ok(())
    }
}

pub struct TestContext {
    pub ledger: Arc<InMemoryLedger>,
    pub gateway: Arc<FakeGateway>,
    pub clock: Arc<ManualClock>,
    pub manager: Arc<InvoiceLifecycleManager>,
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_settings(LifecycleSettings {
            gateway_timeout: std::time::Duration::from_secs(5),
            auto_send: true,
            line_item_description: "Bartending service.".to_string(),
        })
    }

    pub fn with_settings(settings: LifecycleSettings) -> Self {
        let ledger = Arc::new(InMemoryLedger::new());
        let gateway = Arc::new(FakeGateway::new());
        let clock = Arc::new(ManualClock::new(start_time()));
        let manager = Arc::new(InvoiceLifecycleManager::new(
            ledger.clone(),
            gateway.clone(),
            InvoiceTypeResolver::with_defaults().unwrap(),
            PricingEngine::default(),
            clock.clone(),
            settings,
        ));

        Self {
            ledger,
            gateway,
            clock,
            manager,
        }
    }

    /// Seed a lead and a quote for an event `event_in` from now, with line
    /// items given as `(units, price_per_unit)`.
    pub fn seed_quote(&self, event_in: Duration, items: &[(Decimal, Decimal)]) -> Quote {
        let lead_id = Uuid::new_v4();
        self.ledger
            .upsert_lead(
                BillingContact {
                    lead_id,
                    email: "host@example.com".to_string(),
                    full_name: "Pat Host".to_string(),
                    gateway_customer_id: None,
                },
                start_time(),
            )
            .unwrap();

        let quote = Quote {
            quote_id: Uuid::new_v4(),
            external_id: format!("Q-{}", lead_id.simple()),
            lead_id,
            guests: 40,
            hours: Decimal::new(4, 0),
            staff_count: 2,
            event_date: start_time() + event_in,
            options: ServiceOptions::default(),
            amount: Decimal::ZERO,
        };
        self.ledger.upsert_quote(quote.clone()).unwrap();

        for (units, price) in items {
            self.add_item(&quote, *units, *price);
        }
        quote
    }

    pub fn add_item(&self, quote: &Quote, units: Decimal, price: Decimal) {
        let item = QuoteLineItem::new(quote.quote_id, "service", units, price).unwrap();
        self.ledger.add_line_item(item).unwrap();
    }
}
