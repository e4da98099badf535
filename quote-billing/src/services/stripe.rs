//! Stripe invoicing client.
//!
//! Implements [`PaymentGateway`] over Stripe's customers, invoices and
//! invoice items endpoints. Requests are form encoded; reads and the
//! idempotency-keyed invoice create are retried on transient failures.

use crate::config::StripeConfig;
use crate::services::gateway::{
    CreateInvoiceRequest, GatewayError, PaymentGateway, RemoteInvoice, RemoteInvoiceStatus,
    RemoteLineItem,
};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::{Client, RequestBuilder, StatusCode};
use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use service_core::retry::{retry_call, RetryConfig};
use std::time::Duration;

#[derive(Clone)]
pub struct StripeClient {
    client: Client,
    config: StripeConfig,
    retry: RetryConfig,
}

#[derive(Debug, Deserialize)]
struct StripeObject {
    id: String,
}

#[derive(Debug, Deserialize)]
struct StripeInvoice {
    id: String,
    customer: Option<String>,
    status: Option<String>,
    due_date: Option<i64>,
    #[serde(default)]
    amount_due: i64,
    #[serde(default)]
    amount_paid: i64,
    hosted_invoice_url: Option<String>,
    status_transitions: Option<StatusTransitions>,
}

#[derive(Debug, Deserialize)]
struct StatusTransitions {
    paid_at: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct StripeInvoiceItem {
    id: String,
    amount: i64,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StripeList<T> {
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct StripeErrorBody {
    error: StripeErrorDetail,
}

#[derive(Debug, Deserialize)]
struct StripeErrorDetail {
    code: Option<String>,
    message: Option<String>,
}

fn from_unix(secs: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0).single()
}

impl StripeInvoice {
    fn into_remote(self) -> Result<RemoteInvoice, GatewayError> {
        let status = self
            .status
            .as_deref()
            .and_then(RemoteInvoiceStatus::from_string)
            .ok_or_else(|| {
                GatewayError::Decode(format!(
                    "invoice {} has unknown status {:?}",
                    self.id, self.status
                ))
            })?;

        Ok(RemoteInvoice {
            remote_invoice_id: self.id,
            customer_id: self.customer.unwrap_or_default(),
            status,
            due_date: self.due_date.and_then(from_unix),
            amount_due_minor: self.amount_due,
            amount_paid_minor: self.amount_paid,
            hosted_url: self.hosted_invoice_url,
            paid_at: self
                .status_transitions
                .and_then(|t| t.paid_at)
                .and_then(from_unix),
        })
    }
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| GatewayError::Network(e.to_string()))?;

        Ok(Self {
            client,
            config,
            retry: RetryConfig::quick(),
        })
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Check if Stripe is configured (API key is set).
    pub fn is_configured(&self) -> bool {
        !self.config.api_key.expose_secret().is_empty()
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.config.api_base_url.trim_end_matches('/'), path)
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.client
            .get(self.url(path))
            .bearer_auth(self.config.api_key.expose_secret())
    }

    fn post(&self, path: &str) -> RequestBuilder {
        self.client
            .post(self.url(path))
            .bearer_auth(self.config.api_key.expose_secret())
    }

    fn delete(&self, path: &str) -> RequestBuilder {
        self.client
            .delete(self.url(path))
            .bearer_auth(self.config.api_key.expose_secret())
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        request: RequestBuilder,
    ) -> Result<T, GatewayError> {
        if !self.is_configured() {
            return Err(GatewayError::NotConfigured);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                GatewayError::Timeout
            } else {
                GatewayError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        let retry_after_secs = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let body = response
            .text()
            .await
            .map_err(|e| GatewayError::Network(e.to_string()))?;

        tracing::debug!(operation, status = %status, "Stripe response");

        if status.is_success() {
            return serde_json::from_str(&body).map_err(|e| GatewayError::Decode(e.to_string()));
        }

        let detail = serde_json::from_str::<StripeErrorBody>(&body)
            .map(|b| b.error)
            .unwrap_or(StripeErrorDetail {
                code: None,
                message: Some(body.clone()),
            });
        let message = detail.message.unwrap_or_default();

        tracing::error!(
            operation,
            status = status.as_u16(),
            code = ?detail.code,
            message = %message,
            "Stripe request failed"
        );

        Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => GatewayError::Auth(message),
            StatusCode::NOT_FOUND => GatewayError::NotFound(message),
            StatusCode::TOO_MANY_REQUESTS => GatewayError::RateLimited { retry_after_secs },
            _ => GatewayError::Api {
                status: status.as_u16(),
                code: detail.code,
                message,
            },
        })
    }

    async fn fetch_invoice(&self, remote_invoice_id: &str) -> Result<StripeInvoice, GatewayError> {
        let path = format!("invoices/{}", remote_invoice_id);
        retry_call(&self.retry, "get_invoice", || {
            self.execute("get_invoice", self.get(&path))
        })
        .await
    }
}

#[async_trait]
impl PaymentGateway for StripeClient {
    async fn ensure_customer(&self, email: &str, full_name: &str) -> Result<String, GatewayError> {
        let customer: StripeObject = self
            .execute(
                "ensure_customer",
                self.post("customers")
                    .form(&[("email", email), ("name", full_name)]),
            )
            .await?;

        tracing::info!(customer_id = %customer.id, "Stripe customer created");
        Ok(customer.id)
    }

    async fn create_invoice(&self, request: &CreateInvoiceRequest) -> Result<String, GatewayError> {
        let due_date = request.due_date.timestamp().to_string();
        let mut form = vec![
            ("customer", request.customer_id.as_str()),
            ("collection_method", "send_invoice"),
            ("due_date", due_date.as_str()),
            ("description", request.description.as_str()),
            ("currency", self.config.currency.as_str()),
            ("pending_invoice_items_behavior", "exclude"),
        ];
        if let Some(footer) = self.config.invoice_footer.as_deref() {
            form.push(("footer", footer));
        }

        let invoice: StripeObject = retry_call(&self.retry, "create_invoice", || {
            self.execute(
                "create_invoice",
                self.post("invoices")
                    .header("Idempotency-Key", request.idempotency_key.as_str())
                    .form(&form),
            )
        })
        .await?;

        tracing::info!(
            remote_invoice_id = %invoice.id,
            customer_id = %request.customer_id,
            "Stripe invoice created"
        );
        Ok(invoice.id)
    }

    async fn attach_line_item(
        &self,
        customer_id: &str,
        remote_invoice_id: &str,
        amount_minor: i64,
        description: &str,
    ) -> Result<String, GatewayError> {
        let amount = amount_minor.to_string();
        let item: StripeObject = self
            .execute(
                "attach_line_item",
                self.post("invoiceitems").form(&[
                    ("customer", customer_id),
                    ("invoice", remote_invoice_id),
                    ("amount", amount.as_str()),
                    ("currency", self.config.currency.as_str()),
                    ("description", description),
                ]),
            )
            .await?;
        Ok(item.id)
    }

    async fn list_line_items(&self, remote_invoice_id: &str) -> Result<Vec<RemoteLineItem>, GatewayError> {
        let list: StripeList<StripeInvoiceItem> = retry_call(&self.retry, "list_line_items", || {
            self.execute(
                "list_line_items",
                self.get("invoiceitems")
                    .query(&[("invoice", remote_invoice_id), ("limit", "100")]),
            )
        })
        .await?;

        Ok(list
            .data
            .into_iter()
            .map(|item| RemoteLineItem {
                line_item_id: item.id,
                amount_minor: item.amount,
                description: item.description,
            })
            .collect())
    }

    async fn delete_line_item(&self, line_item_id: &str) -> Result<(), GatewayError> {
        let _: StripeObject = self
            .execute(
                "delete_line_item",
                self.delete(&format!("invoiceitems/{}", line_item_id)),
            )
            .await?;
        Ok(())
    }

    async fn update_due_date(
        &self,
        remote_invoice_id: &str,
        due_date: DateTime<Utc>,
    ) -> Result<(), GatewayError> {
        let due_date = due_date.timestamp().to_string();
        let _: StripeObject = self
            .execute(
                "update_due_date",
                self.post(&format!("invoices/{}", remote_invoice_id))
                    .form(&[("due_date", due_date.as_str())]),
            )
            .await?;
        Ok(())
    }

    async fn finalize_invoice(&self, remote_invoice_id: &str) -> Result<(), GatewayError> {
        let current = self.fetch_invoice(remote_invoice_id).await?;
        if current.status.as_deref() != Some("draft") {
            tracing::debug!(remote_invoice_id, status = ?current.status, "Invoice already finalized");
            return Ok(());
        }

        let _: StripeObject = self
            .execute(
                "finalize_invoice",
                self.post(&format!("invoices/{}/finalize", remote_invoice_id)),
            )
            .await?;
        Ok(())
    }

    async fn send_invoice(&self, remote_invoice_id: &str) -> Result<Option<String>, GatewayError> {
        let invoice: StripeInvoice = self
            .execute(
                "send_invoice",
                self.post(&format!("invoices/{}/send", remote_invoice_id)),
            )
            .await?;

        tracing::info!(remote_invoice_id, "Stripe invoice sent");
        Ok(invoice.hosted_invoice_url)
    }

    async fn get_invoice(&self, remote_invoice_id: &str) -> Result<RemoteInvoice, GatewayError> {
        self.fetch_invoice(remote_invoice_id).await?.into_remote()
    }

    async fn void_invoice(&self, remote_invoice_id: &str) -> Result<(), GatewayError> {
        let _: StripeObject = self
            .execute(
                "void_invoice",
                self.post(&format!("invoices/{}/void", remote_invoice_id)),
            )
            .await?;
        Ok(())
    }

    async fn mark_paid_out_of_band(&self, remote_invoice_id: &str) -> Result<(), GatewayError> {
        let _: StripeObject = self
            .execute(
                "mark_paid_out_of_band",
                self.post(&format!("invoices/{}/pay", remote_invoice_id))
                    .form(&[("paid_out_of_band", "true")]),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::Secret;

    fn config(api_key: &str) -> StripeConfig {
        StripeConfig {
            api_key: Secret::new(api_key.to_string()),
            ..StripeConfig::default()
        }
    }

    #[test]
    fn test_is_configured() {
        assert!(StripeClient::new(config("sk_test_123")).unwrap().is_configured());
        assert!(!StripeClient::new(config("")).unwrap().is_configured());
    }

    #[tokio::test]
    async fn test_unconfigured_client_makes_no_calls() {
        let client = StripeClient::new(config("")).unwrap();
        let err = client.ensure_customer("a@b.c", "A B").await.unwrap_err();
        assert!(matches!(err, GatewayError::NotConfigured));
    }

    #[test]
    fn test_invoice_payload_maps_to_remote() {
        let invoice: StripeInvoice = serde_json::from_str(
            r#"{
                "id": "in_1",
                "customer": "cus_1",
                "status": "paid",
                "due_date": 1717000000,
                "amount_due": 10000,
                "amount_paid": 10000,
                "hosted_invoice_url": "https://invoice.stripe.com/i/in_1",
                "status_transitions": {"paid_at": 1716000000}
            }"#,
        )
        .unwrap();

        let remote = invoice.into_remote().unwrap();
        assert!(remote.is_paid());
        assert_eq!(remote.amount_paid_minor, 10000);
        assert_eq!(remote.due_date.unwrap().timestamp(), 1717000000);
        assert_eq!(remote.paid_at.unwrap().timestamp(), 1716000000);
    }
}
