//! PostgreSQL ledger for quote-billing.

use crate::models::{
    BillingContact, Invoice, InvoiceKind, InvoiceStatus, InvoiceType, NewInvoice, OpenBarPackage,
    Quote, QuoteLineItem, ServiceOptions,
};
use crate::services::ledger::{LedgerError, LedgerStore};
use crate::services::metrics::DB_QUERY_DURATION;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

const INVOICE_COLUMNS: &str = "invoice_id, remote_invoice_id, quote_id, invoice_type_id, amount, \
     due_date, hosted_url, status, created_utc, paid_utc, voided_utc";

#[derive(Debug, FromRow)]
struct InvoiceRow {
    invoice_id: Uuid,
    remote_invoice_id: String,
    quote_id: Uuid,
    invoice_type_id: i32,
    amount: Decimal,
    due_date: DateTime<Utc>,
    hosted_url: Option<String>,
    status: String,
    created_utc: DateTime<Utc>,
    paid_utc: Option<DateTime<Utc>>,
    voided_utc: Option<DateTime<Utc>>,
}

impl TryFrom<InvoiceRow> for Invoice {
    type Error = LedgerError;

    fn try_from(row: InvoiceRow) -> Result<Self, Self::Error> {
        let status = InvoiceStatus::from_string(&row.status).ok_or_else(|| {
            LedgerError::Corrupt(format!(
                "invoice {} has unknown status '{}'",
                row.invoice_id, row.status
            ))
        })?;

        Ok(Invoice {
            invoice_id: row.invoice_id,
            remote_invoice_id: row.remote_invoice_id,
            quote_id: row.quote_id,
            invoice_type_id: row.invoice_type_id,
            amount: row.amount,
            due_date: row.due_date,
            hosted_url: row.hosted_url,
            status,
            created_utc: row.created_utc,
            paid_utc: row.paid_utc,
            voided_utc: row.voided_utc,
        })
    }
}

#[derive(Debug, FromRow)]
struct QuoteRow {
    quote_id: Uuid,
    external_id: String,
    lead_id: Uuid,
    guests: i32,
    hours: Decimal,
    staff_count: i32,
    event_date: DateTime<Utc>,
    liquor: bool,
    beer_and_wine: bool,
    mixers: bool,
    juices: bool,
    soft_drinks: bool,
    cups: bool,
    ice: bool,
    glassware: bool,
    bar_units: i32,
    open_bar: String,
    amount: Decimal,
}

impl From<QuoteRow> for Quote {
    fn from(row: QuoteRow) -> Self {
        Quote {
            quote_id: row.quote_id,
            external_id: row.external_id,
            lead_id: row.lead_id,
            guests: row.guests,
            hours: row.hours,
            staff_count: row.staff_count,
            event_date: row.event_date,
            options: ServiceOptions {
                liquor: row.liquor,
                beer_and_wine: row.beer_and_wine,
                mixers: row.mixers,
                juices: row.juices,
                soft_drinks: row.soft_drinks,
                cups: row.cups,
                ice: row.ice,
                glassware: row.glassware,
                bar_units: row.bar_units,
                open_bar: OpenBarPackage::from_string(&row.open_bar).unwrap_or_default(),
            },
            amount: row.amount,
        }
    }
}

#[derive(Debug, FromRow)]
struct LineItemRow {
    line_item_id: Uuid,
    quote_id: Uuid,
    service: String,
    units: Decimal,
    price_per_unit: Decimal,
}

#[derive(Debug, FromRow)]
struct InvoiceTypeRow {
    invoice_type_id: i32,
    kind: String,
    percentage: Decimal,
}

#[derive(Debug, FromRow)]
struct ContactRow {
    lead_id: Uuid,
    email: String,
    full_name: String,
    gateway_customer_id: Option<String>,
}

fn invoice_write_error(e: sqlx::Error, what: &str) -> LedgerError {
    match e {
        sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
            LedgerError::Conflict(format!("{}: an Open invoice of this type already exists", what))
        }
        other => LedgerError::Database(other),
    }
}

/// Ledger backed by a PostgreSQL connection pool.
#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "quote-billing"))]
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, LedgerError> {
        info!(max_connections = max_connections, "Connecting to PostgreSQL");

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), LedgerError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| LedgerError::Unavailable(format!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    async fn fetch_invoices(&self, sql: &str, quote_id: Uuid) -> Result<Vec<Invoice>, LedgerError> {
        sqlx::query_as::<_, InvoiceRow>(sql)
            .bind(quote_id)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Invoice::try_from)
            .collect()
    }
}

#[async_trait]
impl LedgerStore for PgLedger {
    #[instrument(skip(self), fields(quote_id = %quote_id))]
    async fn get_quote(&self, quote_id: Uuid) -> Result<Option<Quote>, LedgerError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_quote"])
            .start_timer();

        let row = sqlx::query_as::<_, QuoteRow>(
            r#"
            SELECT quote_id, external_id, lead_id, guests, hours, staff_count, event_date,
                   liquor, beer_and_wine, mixers, juices, soft_drinks, cups, ice, glassware,
                   bar_units, open_bar, amount
            FROM quotes
            WHERE quote_id = $1
            "#,
        )
        .bind(quote_id)
        .fetch_optional(&self.pool)
        .await?;

        timer.observe_duration();

        Ok(row.map(Quote::from))
    }

    #[instrument(skip(self), fields(quote_id = %quote_id))]
    async fn update_quote_amount(&self, quote_id: Uuid, amount: Decimal) -> Result<(), LedgerError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_quote_amount"])
            .start_timer();

        let result = sqlx::query("UPDATE quotes SET amount = $2 WHERE quote_id = $1")
            .bind(quote_id)
            .bind(amount)
            .execute(&self.pool)
            .await?;

        timer.observe_duration();

        if result.rows_affected() == 0 {
            return Err(LedgerError::NotFound(format!("quote {}", quote_id)));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(quote_id = %quote_id))]
    async fn get_line_items_for_quote(&self, quote_id: Uuid) -> Result<Vec<QuoteLineItem>, LedgerError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_line_items_for_quote"])
            .start_timer();

        let rows = sqlx::query_as::<_, LineItemRow>(
            r#"
            SELECT line_item_id, quote_id, service, units, price_per_unit
            FROM quote_line_items
            WHERE quote_id = $1
            ORDER BY created_utc, line_item_id
            "#,
        )
        .bind(quote_id)
        .fetch_all(&self.pool)
        .await?;

        timer.observe_duration();

        Ok(rows
            .into_iter()
            .map(|row| QuoteLineItem {
                line_item_id: row.line_item_id,
                quote_id: row.quote_id,
                service: row.service,
                units: row.units,
                price_per_unit: row.price_per_unit,
            })
            .collect())
    }

    #[instrument(skip(self), fields(quote_id = %quote_id))]
    async fn get_open_invoices_for_quote(&self, quote_id: Uuid) -> Result<Vec<Invoice>, LedgerError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_open_invoices_for_quote"])
            .start_timer();

        let sql = format!(
            "SELECT {} FROM invoices WHERE quote_id = $1 AND status = 'open' ORDER BY invoice_type_id",
            INVOICE_COLUMNS
        );
        let invoices = self.fetch_invoices(&sql, quote_id).await?;

        timer.observe_duration();

        Ok(invoices)
    }

    #[instrument(skip(self), fields(quote_id = %quote_id))]
    async fn get_invoices_for_quote(&self, quote_id: Uuid) -> Result<Vec<Invoice>, LedgerError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_invoices_for_quote"])
            .start_timer();

        let sql = format!(
            "SELECT {} FROM invoices WHERE quote_id = $1 ORDER BY created_utc, invoice_id",
            INVOICE_COLUMNS
        );
        let invoices = self.fetch_invoices(&sql, quote_id).await?;

        timer.observe_duration();

        Ok(invoices)
    }

    #[instrument(skip(self))]
    async fn get_current_invoice(&self, remote_invoice_id: &str) -> Result<Option<Invoice>, LedgerError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_current_invoice"])
            .start_timer();

        let sql = format!(
            "SELECT {} FROM invoices WHERE remote_invoice_id = $1 \
             ORDER BY (status = 'open') DESC, created_utc DESC LIMIT 1",
            INVOICE_COLUMNS
        );
        let row = sqlx::query_as::<_, InvoiceRow>(&sql)
            .bind(remote_invoice_id)
            .fetch_optional(&self.pool)
            .await?;

        timer.observe_duration();

        row.map(Invoice::try_from).transpose()
    }

    #[instrument(skip(self, invoice), fields(quote_id = %invoice.quote_id, remote_invoice_id = %invoice.remote_invoice_id))]
    async fn insert_invoice(&self, invoice: NewInvoice) -> Result<Invoice, LedgerError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_invoice"])
            .start_timer();

        let sql = format!(
            "INSERT INTO invoices ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, 'open', $8, NULL, NULL) RETURNING {}",
            INVOICE_COLUMNS, INVOICE_COLUMNS
        );
        let row = sqlx::query_as::<_, InvoiceRow>(&sql)
            .bind(Uuid::new_v4())
            .bind(&invoice.remote_invoice_id)
            .bind(invoice.quote_id)
            .bind(invoice.invoice_type_id)
            .bind(invoice.amount)
            .bind(invoice.due_date)
            .bind(&invoice.hosted_url)
            .bind(invoice.created_utc)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| invoice_write_error(e, "insert invoice"))?;

        timer.observe_duration();

        let inserted = Invoice::try_from(row)?;
        info!(invoice_id = %inserted.invoice_id, "Invoice recorded");
        Ok(inserted)
    }

    #[instrument(skip(self), fields(status = %status))]
    async fn set_invoice_status(
        &self,
        remote_invoice_id: &str,
        status: InvoiceStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["set_invoice_status"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE invoices
            SET status = $2,
                paid_utc = CASE WHEN $2 = 'paid' THEN $3 ELSE paid_utc END,
                voided_utc = CASE WHEN $2 = 'void' THEN $3 ELSE voided_utc END
            WHERE remote_invoice_id = $1 AND status = 'open'
            "#,
        )
        .bind(remote_invoice_id)
        .bind(status.as_str())
        .bind(at)
        .execute(&self.pool)
        .await?;

        timer.observe_duration();

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, replacement), fields(invoice_id = %invoice_id))]
    async fn supersede_invoice(
        &self,
        invoice_id: Uuid,
        replacement: NewInvoice,
        at: DateTime<Utc>,
    ) -> Result<Invoice, LedgerError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["supersede_invoice"])
            .start_timer();

        let mut tx = self.pool.begin().await?;

        let voided = sqlx::query(
            "UPDATE invoices SET status = 'void', voided_utc = $2 WHERE invoice_id = $1 AND status = 'open'",
        )
        .bind(invoice_id)
        .bind(at)
        .execute(&mut *tx)
        .await?;

        if voided.rows_affected() == 0 {
            tx.rollback().await.ok();
            return Err(LedgerError::Conflict(format!(
                "invoice {} is no longer open",
                invoice_id
            )));
        }

        let sql = format!(
            "INSERT INTO invoices ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, 'open', $8, NULL, NULL) RETURNING {}",
            INVOICE_COLUMNS, INVOICE_COLUMNS
        );
        let row = sqlx::query_as::<_, InvoiceRow>(&sql)
            .bind(Uuid::new_v4())
            .bind(&replacement.remote_invoice_id)
            .bind(replacement.quote_id)
            .bind(replacement.invoice_type_id)
            .bind(replacement.amount)
            .bind(replacement.due_date)
            .bind(&replacement.hosted_url)
            .bind(replacement.created_utc)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| invoice_write_error(e, "supersede invoice"))?;

        tx.commit().await?;

        timer.observe_duration();

        Invoice::try_from(row)
    }

    #[instrument(skip(self))]
    async fn get_invoice_types(&self) -> Result<Vec<InvoiceType>, LedgerError> {
        let rows = sqlx::query_as::<_, InvoiceTypeRow>(
            "SELECT invoice_type_id, kind, percentage FROM invoice_types ORDER BY invoice_type_id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let kind = InvoiceKind::from_string(&row.kind).ok_or_else(|| {
                    LedgerError::Corrupt(format!(
                        "invoice type {} has unknown kind '{}'",
                        row.invoice_type_id, row.kind
                    ))
                })?;
                Ok(InvoiceType {
                    invoice_type_id: row.invoice_type_id,
                    kind,
                    percentage: row.percentage,
                })
            })
            .collect()
    }

    #[instrument(skip(self), fields(lead_id = %lead_id))]
    async fn get_billing_contact(&self, lead_id: Uuid) -> Result<Option<BillingContact>, LedgerError> {
        let row = sqlx::query_as::<_, ContactRow>(
            "SELECT lead_id, email, full_name, gateway_customer_id FROM leads WHERE lead_id = $1",
        )
        .bind(lead_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| BillingContact {
            lead_id: row.lead_id,
            email: row.email,
            full_name: row.full_name,
            gateway_customer_id: row.gateway_customer_id,
        }))
    }

    #[instrument(skip(self), fields(lead_id = %lead_id))]
    async fn assign_gateway_customer(&self, lead_id: Uuid, customer_id: &str) -> Result<(), LedgerError> {
        let result = sqlx::query("UPDATE leads SET gateway_customer_id = $2 WHERE lead_id = $1")
            .bind(lead_id)
            .bind(customer_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::NotFound(format!("lead {}", lead_id)));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_quotes_with_open_invoices(&self) -> Result<Vec<Uuid>, LedgerError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_quotes_with_open_invoices"])
            .start_timer();

        let ids = sqlx::query_scalar::<_, Uuid>(
            "SELECT DISTINCT quote_id FROM invoices WHERE status = 'open' ORDER BY quote_id",
        )
        .fetch_all(&self.pool)
        .await?;

        timer.observe_duration();

        Ok(ids)
    }

    #[instrument(skip(self))]
    async fn archive_unresponsive_leads(&self, last_contact_before: DateTime<Utc>) -> Result<u64, LedgerError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["archive_unresponsive_leads"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE leads
            SET archived_utc = NOW()
            WHERE archived_utc IS NULL
              AND last_contact_utc < $1
              AND NOT EXISTS (
                  SELECT 1 FROM quotes q
                  JOIN invoices i ON i.quote_id = q.quote_id
                  WHERE q.lead_id = leads.lead_id AND i.status = 'paid'
              )
            "#,
        )
        .bind(last_contact_before)
        .execute(&self.pool)
        .await?;

        timer.observe_duration();

        Ok(result.rows_affected())
    }
}
