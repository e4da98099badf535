//! Prometheus metrics for quote-billing.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, HistogramVec, TextEncoder,
};

/// Invoice transitions by resulting status.
pub static INVOICE_TRANSITIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "quote_billing_invoice_transitions_total",
        "Total number of invoice state transitions by resulting status",
        &["status"] // open, paid, void
    )
    .expect("Failed to register invoice_transitions_total")
});

/// Reconciliation runs by outcome.
pub static RECONCILIATIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "quote_billing_reconciliations_total",
        "Total number of quote reconciliations by outcome",
        &["outcome"] // updated, unchanged, failed
    )
    .expect("Failed to register reconciliations_total")
});

/// Gateway call duration by operation.
pub static GATEWAY_CALL_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "quote_billing_gateway_call_duration_seconds",
        "Payment gateway call duration in seconds",
        &["operation"],
        vec![0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .expect("Failed to register gateway_call_duration")
});

/// Ledger query duration by operation.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "quote_billing_db_query_duration_seconds",
        "Ledger query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .expect("Failed to register db_query_duration")
});

/// Error counter for alerting.
pub static ERRORS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "quote_billing_errors_total",
        "Total number of errors by type",
        &["error_type"]
    )
    .expect("Failed to register errors_total")
});

/// Sweep runs by task and outcome.
pub static SWEEP_RUNS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "quote_billing_sweep_runs_total",
        "Total number of background sweep runs",
        &["task", "outcome"]
    )
    .expect("Failed to register sweep_runs_total")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&INVOICE_TRANSITIONS_TOTAL);
    Lazy::force(&RECONCILIATIONS_TOTAL);
    Lazy::force(&GATEWAY_CALL_DURATION);
    Lazy::force(&DB_QUERY_DURATION);
    Lazy::force(&ERRORS_TOTAL);
    Lazy::force(&SWEEP_RUNS_TOTAL);
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}
