//! Prometheus metrics for share-service.

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, register_counter_vec, register_histogram_vec, CounterVec, HistogramVec,
    TextEncoder,
};
use std::time::Duration;

/// Media server API calls by operation and HTTP status (or error kind).
pub static API_REQUESTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "share_api_requests_total",
        "Total number of media server API requests",
        &["operation", "status"]
    )
    .expect("Failed to register share_api_requests_total")
});

/// Reconciliation actions by action and outcome.
pub static RECONCILE_ACTIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "share_reconcile_actions_total",
        "Total number of reconciliation actions by outcome",
        &["action", "outcome"] // create, update, revoke, noop
    )
    .expect("Failed to register share_reconcile_actions_total")
});

/// PIN sessions by terminal state.
pub static PIN_SESSIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "share_pin_sessions_total",
        "Total number of PIN sessions by terminal state",
        &["state"]
    )
    .expect("Failed to register share_pin_sessions_total")
});

/// Time a waiter spent on a PIN session, by terminal state.
pub static PIN_WAIT_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "share_pin_wait_duration_seconds",
            "Time spent waiting for a PIN to be claimed",
            vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 900.0]
        ),
        &["state"]
    )
    .expect("Failed to register share_pin_wait_duration_seconds")
});

/// Records dropped by the mapper.
pub static SCHEMA_MISMATCHES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "share_schema_mismatches_total",
        "Total number of records dropped for missing identity fields",
        &["record"]
    )
    .expect("Failed to register share_schema_mismatches_total")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&API_REQUESTS_TOTAL);
    Lazy::force(&RECONCILE_ACTIONS_TOTAL);
    Lazy::force(&PIN_SESSIONS_TOTAL);
    Lazy::force(&PIN_WAIT_DURATION);
    Lazy::force(&SCHEMA_MISMATCHES_TOTAL);
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}

pub fn record_api_request(operation: &str, status: &str) {
    API_REQUESTS_TOTAL
        .with_label_values(&[operation, status])
        .inc();
}

pub fn record_action(action: &str, outcome: &str) {
    RECONCILE_ACTIONS_TOTAL
        .with_label_values(&[action, outcome])
        .inc();
}

pub fn record_pin_terminal(state: &str) {
    PIN_SESSIONS_TOTAL.with_label_values(&[state]).inc();
}

pub fn record_pin_wait(state: &str, waited: Duration) {
    PIN_WAIT_DURATION
        .with_label_values(&[state])
        .observe(waited.as_secs_f64());
}

pub fn record_schema_mismatch(record: &str) {
    SCHEMA_MISMATCHES_TOTAL.with_label_values(&[record]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recorded_counters_show_up_in_text_output() {
        init_metrics();
        record_action("create", "applied");
        record_pin_terminal("expired");
        record_pin_wait("expired", Duration::from_secs(30));

        let output = get_metrics();
        assert!(output.contains("share_reconcile_actions_total"));
        assert!(output.contains("share_pin_sessions_total"));
        assert!(output.contains("share_pin_wait_duration_seconds"));
    }
}
