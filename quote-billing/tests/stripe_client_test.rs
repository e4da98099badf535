use chrono::{TimeZone, Utc};
use quote_billing::config::StripeConfig;
use quote_billing::services::gateway::{CreateInvoiceRequest, RemoteInvoiceStatus};
use quote_billing::services::{GatewayError, PaymentGateway, StripeClient};
use secrecy::Secret;
use serde_json::json;
use service_core::retry::RetryConfig;
use wiremock::matchers::{body_string_contains, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer, retry: RetryConfig) -> StripeClient {
    let config = StripeConfig {
        api_key: Secret::new("sk_test_123".to_string()),
        api_base_url: server.uri(),
        ..StripeConfig::default()
    };
    StripeClient::new(config).unwrap().with_retry(retry)
}

fn create_request() -> CreateInvoiceRequest {
    CreateInvoiceRequest {
        customer_id: "cus_1".to_string(),
        due_date: Utc.with_ymd_and_hms(2024, 5, 9, 12, 0, 0).unwrap(),
        description: "Remaining balance for your event.".to_string(),
        idempotency_key: "quote-2-30000-1715256000".to_string(),
    }
}

// ============================================================================
// Requests
// ============================================================================

mod request_tests {
    use super::*;

    #[tokio::test]
    async fn create_invoice_sends_idempotency_key_and_form() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/invoices"))
            .and(header("Idempotency-Key", "quote-2-30000-1715256000"))
            .and(header("Authorization", "Bearer sk_test_123"))
            .and(body_string_contains("collection_method=send_invoice"))
            .and(body_string_contains("due_date=1715256000"))
            .and(body_string_contains("pending_invoice_items_behavior=exclude"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "in_1"})))
            .expect(1)
            .mount(&server)
            .await;

        let id = client(&server, RetryConfig::no_retry())
            .create_invoice(&create_request())
            .await
            .unwrap();
        assert_eq!(id, "in_1");
    }

    #[tokio::test]
    async fn list_line_items_filters_by_invoice() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/invoiceitems"))
            .and(query_param("invoice", "in_1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"id": "ii_1", "amount": 13750, "description": "Bartending service."}]
            })))
            .mount(&server)
            .await;

        let items = client(&server, RetryConfig::no_retry())
            .list_line_items("in_1")
            .await
            .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].line_item_id, "ii_1");
        assert_eq!(items[0].amount_minor, 13_750);
    }

    #[tokio::test]
    async fn get_invoice_maps_status_and_payment_time() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/invoices/in_1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "in_1",
                "customer": "cus_1",
                "status": "paid",
                "due_date": 1715256000,
                "amount_due": 0,
                "amount_paid": 10000,
                "hosted_invoice_url": "https://invoice.stripe.com/i/in_1",
                "status_transitions": {"paid_at": 1714570000}
            })))
            .mount(&server)
            .await;

        let invoice = client(&server, RetryConfig::no_retry())
            .get_invoice("in_1")
            .await
            .unwrap();
        assert_eq!(invoice.status, RemoteInvoiceStatus::Paid);
        assert_eq!(invoice.amount_paid_minor, 10_000);
        assert_eq!(invoice.paid_at, Utc.timestamp_opt(1714570000, 0).single());
    }

    #[tokio::test]
    async fn finalize_skips_invoices_that_are_not_drafts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/invoices/in_1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "in_1",
                "customer": "cus_1",
                "status": "open"
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/invoices/in_1/finalize"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "in_1"})))
            .expect(0)
            .mount(&server)
            .await;

        client(&server, RetryConfig::no_retry())
            .finalize_invoice("in_1")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn finalize_finalizes_drafts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/invoices/in_1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "in_1",
                "customer": "cus_1",
                "status": "draft"
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/invoices/in_1/finalize"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "in_1"})))
            .expect(1)
            .mount(&server)
            .await;

        client(&server, RetryConfig::no_retry())
            .finalize_invoice("in_1")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn out_of_band_payment_posts_flag() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/invoices/in_1/pay"))
            .and(body_string_contains("paid_out_of_band=true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "in_1"})))
            .expect(1)
            .mount(&server)
            .await;

        client(&server, RetryConfig::no_retry())
            .mark_paid_out_of_band("in_1")
            .await
            .unwrap();
    }
}

// ============================================================================
// Error mapping
// ============================================================================

mod error_tests {
    use super::*;

    #[tokio::test]
    async fn unauthorized_maps_to_auth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/customers"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "error": {"message": "Invalid API Key provided"}
            })))
            .mount(&server)
            .await;

        let err = client(&server, RetryConfig::no_retry())
            .ensure_customer("host@example.com", "Pat Host")
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Auth(msg) if msg.contains("Invalid API Key")));
    }

    #[tokio::test]
    async fn too_many_requests_maps_to_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/invoices/in_1/void"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "2"))
            .mount(&server)
            .await;

        let err = client(&server, RetryConfig::no_retry())
            .void_invoice("in_1")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GatewayError::RateLimited {
                retry_after_secs: Some(2)
            }
        ));
    }

    #[tokio::test]
    async fn rejected_request_keeps_stripe_error_code() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/v1/invoiceitems/ii_1"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": {"code": "invoice_not_editable", "message": "Invoice is paid"}
            })))
            .mount(&server)
            .await;

        let err = client(&server, RetryConfig::no_retry())
            .delete_line_item("ii_1")
            .await
            .unwrap_err();
        match err {
            GatewayError::Api { status, code, .. } => {
                assert_eq!(status, 400);
                assert_eq!(code.as_deref(), Some("invoice_not_editable"));
            }
            other => panic!("expected api error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn server_error_on_create_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/invoices"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/invoices"))
            .and(header("Idempotency-Key", "quote-2-30000-1715256000"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "in_1"})))
            .expect(1)
            .mount(&server)
            .await;

        let id = client(&server, RetryConfig::quick())
            .create_invoice(&create_request())
            .await
            .unwrap();
        assert_eq!(id, "in_1");
    }

    #[tokio::test]
    async fn missing_api_key_fails_before_any_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let config = StripeConfig {
            api_base_url: server.uri(),
            ..StripeConfig::default()
        };
        let err = StripeClient::new(config)
            .unwrap()
            .ensure_customer("host@example.com", "Pat Host")
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NotConfigured));
    }
}
