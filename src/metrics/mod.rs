//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Status events received per source
//! - Finalized transfers per outcome and their latency
//! - Conflicting terminal signals
//! - Source errors and open subscriptions

use crate::error::{TrackerError, TrackerResult};
use crate::events::SignalSource;
use crate::transfer::{Direction, Outcome};

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram_vec, CounterVec, Encoder, Gauge,
    HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    pub static ref EVENTS_RECEIVED: CounterVec = register_counter_vec!(
        "bridge_tracker_events_received_total",
        "Status events received by source and kind",
        &["source", "kind"]
    ).unwrap();

    pub static ref TRANSFERS_FINALIZED: CounterVec = register_counter_vec!(
        "bridge_tracker_transfers_finalized_total",
        "Transfers moved to completed",
        &["direction", "outcome"]
    ).unwrap();

    pub static ref TRANSFER_LATENCY: HistogramVec = register_histogram_vec!(
        "bridge_tracker_transfer_latency_seconds",
        "Time from submission to finalization",
        &["direction"],
        vec![30.0, 60.0, 120.0, 300.0, 600.0, 1800.0, 3600.0, 7200.0, 21600.0, 43200.0]
    ).unwrap();

    pub static ref CONFLICTING_SIGNALS: CounterVec = register_counter_vec!(
        "bridge_tracker_conflicting_terminal_signals_total",
        "Terminal signals discarded because the transfer was already finalized",
        &["source"]
    ).unwrap();

    pub static ref SOURCE_ERRORS: CounterVec = register_counter_vec!(
        "bridge_tracker_source_errors_total",
        "Errors raised by status sources",
        &["source", "kind"]
    ).unwrap();

    pub static ref CAPTURED_ERRORS: CounterVec = register_counter_vec!(
        "bridge_tracker_captured_errors_total",
        "Errors reported to the error capture sink",
        &["kind"]
    ).unwrap();

    pub static ref ACTIVE_SUBSCRIPTIONS: Gauge = register_gauge!(
        "bridge_tracker_active_subscriptions",
        "Open push subscriptions"
    ).unwrap();

    pub static ref ONGOING_TRANSFERS: Gauge = register_gauge!(
        "bridge_tracker_ongoing_transfers",
        "Transfers currently pending"
    ).unwrap();

    pub static ref STALE_TRANSFERS: CounterVec = register_counter_vec!(
        "bridge_tracker_stale_transfers_total",
        "Transfers force-finalized by the staleness sweeper",
        &["direction"]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> TrackerResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| TrackerError::Internal(format!("metrics bind {addr}: {e}")))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| TrackerError::Internal(format!("metrics server: {e}")))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

// Helper functions to record metrics

pub fn record_event(source: SignalSource, terminal: bool) {
    let kind = if terminal { "terminal" } else { "progress" };
    EVENTS_RECEIVED
        .with_label_values(&[source.as_str(), kind])
        .inc();
}

pub fn record_transfer_finalized(direction: Direction, outcome: Outcome, latency_secs: f64) {
    TRANSFERS_FINALIZED
        .with_label_values(&[direction.as_str(), outcome.as_str()])
        .inc();
    TRANSFER_LATENCY
        .with_label_values(&[direction.as_str()])
        .observe(latency_secs);
}

pub fn record_conflicting_signal(source: SignalSource) {
    CONFLICTING_SIGNALS
        .with_label_values(&[source.as_str()])
        .inc();
}

pub fn record_source_error(source: SignalSource, err: &TrackerError) {
    SOURCE_ERRORS
        .with_label_values(&[source.as_str(), err.kind()])
        .inc();
}

pub fn record_captured_error(kind: &str) {
    CAPTURED_ERRORS.with_label_values(&[kind]).inc();
}

pub fn record_stale_transfer(direction: Direction) {
    STALE_TRANSFERS
        .with_label_values(&[direction.as_str()])
        .inc();
}

pub fn set_active_subscriptions(count: usize) {
    ACTIVE_SUBSCRIPTIONS.set(count as f64);
}

pub fn set_ongoing_transfers(count: usize) {
    ONGOING_TRANSFERS.set(count as f64);
}
