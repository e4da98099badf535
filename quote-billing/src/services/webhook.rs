//! Stripe webhook verification and payment event parsing.
//!
//! The `Stripe-Signature` header carries `t=<unix seconds>` and one or more
//! `v1=<hex hmac>` entries. The signed payload is `"{t}.{raw body}"`.

use chrono::{DateTime, Duration, TimeZone, Utc};
use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use service_core::error::AppError;
use service_core::utils::signature::verify_signature;
use thiserror::Error;

/// Event types that report a settled invoice.
const PAYMENT_EVENTS: [&str; 2] = ["invoice.payment_succeeded", "invoice.paid"];

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("Webhook secret not configured")]
    NotConfigured,

    #[error("Malformed signature header")]
    MalformedHeader,

    #[error("Signature timestamp outside tolerance")]
    StaleTimestamp,

    #[error("Signature mismatch")]
    InvalidSignature,

    #[error("Invalid event payload: {0}")]
    Payload(String),
}

impl From<WebhookError> for AppError {
    fn from(err: WebhookError) -> Self {
        match err {
            WebhookError::NotConfigured => AppError::ConfigError(anyhow::anyhow!(err.to_string())),
            _ => AppError::BadRequest(anyhow::anyhow!(err.to_string())),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub created: i64,
    pub data: WebhookEventData,
}

#[derive(Debug, Deserialize)]
pub struct WebhookEventData {
    pub object: serde_json::Value,
}

/// A settled invoice reported by the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentNotice {
    pub event_id: String,
    pub remote_invoice_id: String,
    pub paid_at: DateTime<Utc>,
    pub amount_paid_minor: i64,
}

impl WebhookEvent {
    /// The payment this event reports, if it is a payment event.
    pub fn payment_notice(&self) -> Option<PaymentNotice> {
        if !PAYMENT_EVENTS.contains(&self.event_type.as_str()) {
            return None;
        }

        let object = &self.data.object;
        let remote_invoice_id = object.get("id")?.as_str()?.to_string();
        let paid_at = object
            .get("status_transitions")
            .and_then(|t| t.get("paid_at"))
            .and_then(|v| v.as_i64())
            .unwrap_or(self.created);

        Some(PaymentNotice {
            event_id: self.id.clone(),
            remote_invoice_id,
            paid_at: Utc.timestamp_opt(paid_at, 0).single()?,
            amount_paid_minor: object
                .get("amount_paid")
                .and_then(|v| v.as_i64())
                .unwrap_or_default(),
        })
    }
}

#[derive(Clone)]
pub struct WebhookVerifier {
    secret: Secret<String>,
    tolerance: Duration,
}

impl WebhookVerifier {
    pub fn new(secret: Secret<String>, tolerance_secs: i64) -> Self {
        Self {
            secret,
            tolerance: Duration::seconds(tolerance_secs),
        }
    }

    /// Check the signature header against the raw request body.
    pub fn verify(&self, header: &str, body: &str, now: DateTime<Utc>) -> Result<(), WebhookError> {
        let secret = self.secret.expose_secret();
        if secret.is_empty() {
            return Err(WebhookError::NotConfigured);
        }

        let mut timestamp = None;
        let mut signatures = Vec::new();
        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => {
                    timestamp = Some(value.parse::<i64>().map_err(|_| WebhookError::MalformedHeader)?)
                }
                Some(("v1", value)) => signatures.push(value),
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or(WebhookError::MalformedHeader)?;
        if signatures.is_empty() {
            return Err(WebhookError::MalformedHeader);
        }

        let signed_at = Utc
            .timestamp_opt(timestamp, 0)
            .single()
            .ok_or(WebhookError::MalformedHeader)?;
        if (now - signed_at).abs() > self.tolerance {
            tracing::warn!(timestamp, "Webhook signature timestamp outside tolerance");
            return Err(WebhookError::StaleTimestamp);
        }

        let payload = format!("{}.{}", timestamp, body);
        for signature in signatures {
            let valid = verify_signature(secret, &payload, signature)
                .map_err(|e| WebhookError::Payload(e.to_string()))?;
            if valid {
                return Ok(());
            }
        }

        tracing::warn!("Webhook signature mismatch");
        Err(WebhookError::InvalidSignature)
    }

    /// Verify then decode the event.
    pub fn parse_event(&self, header: &str, body: &str, now: DateTime<Utc>) -> Result<WebhookEvent, WebhookError> {
        self.verify(header, body, now)?;
        serde_json::from_str(body).map_err(|e| WebhookError::Payload(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use service_core::utils::signature::generate_signature;

    const SECRET: &str = "whsec_test";

    fn body() -> String {
        r#"{"id":"evt_1","type":"invoice.payment_succeeded","created":1700000100,"data":{"object":{"id":"in_1","amount_paid":10000,"status_transitions":{"paid_at":1700000050}}}}"#.to_string()
    }

    fn header(timestamp: i64, body: &str, secret: &str) -> String {
        let signature = generate_signature(secret, &format!("{}.{}", timestamp, body)).unwrap();
        format!("t={},v1={}", timestamp, signature)
    }

    fn verifier() -> WebhookVerifier {
        WebhookVerifier::new(Secret::new(SECRET.to_string()), 300)
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn accepts_valid_signature() {
        let body = body();
        let event = verifier()
            .parse_event(&header(1700000100, &body, SECRET), &body, at(1700000120))
            .unwrap();

        let notice = event.payment_notice().unwrap();
        assert_eq!(notice.remote_invoice_id, "in_1");
        assert_eq!(notice.paid_at, at(1700000050));
        assert_eq!(notice.amount_paid_minor, 10000);
    }

    #[test]
    fn rejects_wrong_secret_and_tampered_body() {
        let body = body();
        let forged = header(1700000100, &body, "whsec_other");
        assert!(matches!(
            verifier().verify(&forged, &body, at(1700000100)),
            Err(WebhookError::InvalidSignature)
        ));

        let valid = header(1700000100, &body, SECRET);
        let tampered = body.replace("in_1", "in_2");
        assert!(matches!(
            verifier().verify(&valid, &tampered, at(1700000100)),
            Err(WebhookError::InvalidSignature)
        ));
    }

    #[test]
    fn rejects_stale_timestamp() {
        let body = body();
        let header = header(1700000100, &body, SECRET);
        assert!(matches!(
            verifier().verify(&header, &body, at(1700000100 + 301)),
            Err(WebhookError::StaleTimestamp)
        ));
    }

    #[test]
    fn rejects_malformed_header() {
        let body = body();
        for header in ["", "v1=abc", "t=notanumber,v1=abc", "t=1700000100"] {
            assert!(matches!(
                verifier().verify(header, &body, at(1700000100)),
                Err(WebhookError::MalformedHeader)
            ));
        }
    }

    #[test]
    fn non_payment_events_carry_no_notice() {
        let event: WebhookEvent = serde_json::from_str(
            r#"{"id":"evt_2","type":"invoice.finalized","created":1700000100,"data":{"object":{"id":"in_1"}}}"#,
        )
        .unwrap();
        assert!(event.payment_notice().is_none());
    }
}
