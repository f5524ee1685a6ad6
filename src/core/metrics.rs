// src/core/metrics.rs

//! Defines and registers Prometheus metrics for proxy monitoring.
//!
//! Metrics are grouped by subsystem and registered once, globally, via
//! `lazy_static`. The built-in `/metrics` servlet encodes them on request.

use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, TextEncoder, register_counter, register_counter_vec,
    register_gauge,
};

lazy_static! {
    // --- Connection lifecycle ---
    /// The number of clients currently connected to the proxy.
    pub static ref CONNECTED_CLIENTS: Gauge =
        register_gauge!("pmproxy_connected_clients", "Number of currently connected clients.").unwrap();
    /// The total number of connections accepted since startup.
    pub static ref CONNECTIONS_RECEIVED_TOTAL: Counter =
        register_counter!("pmproxy_connections_received_total", "Total number of connections received.").unwrap();
    /// Connection records whose last reference has been released.
    pub static ref CLIENTS_RELEASED_TOTAL: Counter =
        register_counter!("pmproxy_clients_released_total", "Total number of connection records torn down.").unwrap();

    // --- Classifier ---
    /// Connections tagged with each protocol, labeled by protocol name.
    pub static ref CLASSIFIED_TOTAL: CounterVec =
        register_counter_vec!("pmproxy_classified_total", "Connections classified, labeled by protocol.", &["protocol"]).unwrap();
    /// Connections dropped because their first byte matched no protocol.
    pub static ref UNKNOWN_PROTOCOL_TOTAL: Counter =
        register_counter!("pmproxy_unknown_protocol_total", "Connections closed for an unrecognized first byte.").unwrap();

    // --- Secure channel ---
    /// Connections currently holding undelivered ciphertext or deferred writes.
    pub static ref SECURE_PENDING: Gauge =
        register_gauge!("pmproxy_secure_pending", "Connections in the pending secure-write set.").unwrap();
    /// Plaintext buffers that had to wait for more inbound ciphertext.
    pub static ref SECURE_DEFERRED_WRITES_TOTAL: Counter =
        register_counter!("pmproxy_secure_deferred_writes_total", "Total number of deferred secure write buffers.").unwrap();
    /// Fatal TLS engine failures.
    pub static ref SECURE_ERRORS_TOTAL: Counter =
        register_counter!("pmproxy_secure_errors_total", "Total number of TLS engine failures.").unwrap();

    // --- Cross-thread callbacks ---
    /// Calls enqueued from any thread.
    pub static ref CALLS_FIRED_TOTAL: Counter =
        register_counter!("pmproxy_calls_fired_total", "Total number of callback calls fired.").unwrap();
    /// Calls executed on the reactor.
    pub static ref CALLS_DISPATCHED_TOTAL: Counter =
        register_counter!("pmproxy_calls_dispatched_total", "Total number of callback calls dispatched.").unwrap();

    // --- Relays ---
    /// Bytes moved through upstream relays, labeled by direction.
    pub static ref RELAY_BYTES_TOTAL: CounterVec =
        register_counter_vec!("pmproxy_relay_bytes_total", "Bytes relayed, labeled by direction.", &["direction"]).unwrap();
    /// Failed outbound dials.
    pub static ref UPSTREAM_FAILURES_TOTAL: Counter =
        register_counter!("pmproxy_upstream_failures_total", "Total number of upstream connection failures.").unwrap();

    // --- HTTP ---
    /// HTTP responses sent, labeled by status code.
    pub static ref HTTP_RESPONSES_TOTAL: CounterVec =
        register_counter_vec!("pmproxy_http_responses_total", "HTTP responses, labeled by status.", &["status"]).unwrap();
}

/// Gathers all registered metrics and encodes them in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}
