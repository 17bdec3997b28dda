//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Transaction lifecycle counts per chain
//! - Time from creation to a final status
//! - Monitor lock ownership and loop health

use crate::state::ChainType;

use anyhow::{Context, Result};
use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tower_http::trace::TraceLayer;
use tracing::info;

lazy_static! {
    // Transaction metrics
    pub static ref TX_CREATED: CounterVec = register_counter_vec!(
        "wallet_engine_transactions_created_total",
        "Total transactions created",
        &["chain"]
    ).unwrap();

    pub static ref TX_SUBMITTED: CounterVec = register_counter_vec!(
        "wallet_engine_transactions_submitted_total",
        "Total transactions broadcast",
        &["chain"]
    ).unwrap();

    pub static ref TX_REPLACED: CounterVec = register_counter_vec!(
        "wallet_engine_transactions_replaced_total",
        "Total transactions replaced with a higher fee",
        &["chain"]
    ).unwrap();

    pub static ref TX_SUCCEEDED: CounterVec = register_counter_vec!(
        "wallet_engine_transactions_succeeded_total",
        "Total transactions confirmed",
        &["chain"]
    ).unwrap();

    pub static ref TX_FAILED: CounterVec = register_counter_vec!(
        "wallet_engine_transactions_failed_total",
        "Total transactions failed",
        &["chain"]
    ).unwrap();

    pub static ref TX_TIME_TO_FINAL: HistogramVec = register_histogram_vec!(
        "wallet_engine_transaction_time_to_final_seconds",
        "Time from creation to SUCCESS or FAILED",
        &["chain"],
        vec![5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0, 3600.0]
    ).unwrap();

    // Monitor metrics
    pub static ref MONITOR_ACTIVE: GaugeVec = register_gauge_vec!(
        "wallet_engine_monitor_active",
        "Monitor status (1=holds the lock, 0=standby)",
        &["chain"]
    ).unwrap();

    pub static ref LOCK_ACQUIRED: CounterVec = register_counter_vec!(
        "wallet_engine_lock_acquired_total",
        "Total monitoring lock acquisitions",
        &["chain"]
    ).unwrap();

    pub static ref LOCK_LOST: CounterVec = register_counter_vec!(
        "wallet_engine_lock_lost_total",
        "Total monitoring leases lost while running",
        &["chain"]
    ).unwrap();

    pub static ref LOOP_ITERATIONS: CounterVec = register_counter_vec!(
        "wallet_engine_monitor_iterations_total",
        "Total monitor loop iterations",
        &["chain"]
    ).unwrap();

    pub static ref NETWORK_DOWN: CounterVec = register_counter_vec!(
        "wallet_engine_network_down_total",
        "Iterations skipped because the node was unreachable",
        &["chain"]
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

    pub async fn run(&self) -> Result<()> {
        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .layer(TraceLayer::new_for_http());

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind metrics server to {}", addr))?;
        axum::serve(listener, app)
            .await
            .context("Metrics server stopped")?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, (StatusCode, String)> {
    render().map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

/// Text exposition of every registered metric
pub fn render() -> Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

// Helper functions to record metrics

pub fn record_tx_created(chain: ChainType) {
    TX_CREATED.with_label_values(&[chain.as_str()]).inc();
}

pub fn record_tx_submitted(chain: ChainType) {
    TX_SUBMITTED.with_label_values(&[chain.as_str()]).inc();
}

pub fn record_tx_replaced(chain: ChainType) {
    TX_REPLACED.with_label_values(&[chain.as_str()]).inc();
}

pub fn record_tx_succeeded(chain: ChainType) {
    TX_SUCCEEDED.with_label_values(&[chain.as_str()]).inc();
}

pub fn record_tx_failed(chain: ChainType) {
    TX_FAILED.with_label_values(&[chain.as_str()]).inc();
}

pub fn record_time_to_final(chain: ChainType, secs: f64) {
    TX_TIME_TO_FINAL
        .with_label_values(&[chain.as_str()])
        .observe(secs);
}

pub fn record_monitoring(chain: ChainType, active: bool) {
    MONITOR_ACTIVE
        .with_label_values(&[chain.as_str()])
        .set(if active { 1.0 } else { 0.0 });
}

pub fn record_lock_acquired(chain: ChainType) {
    LOCK_ACQUIRED.with_label_values(&[chain.as_str()]).inc();
}

pub fn record_lock_lost(chain: ChainType) {
    LOCK_LOST.with_label_values(&[chain.as_str()]).inc();
}

pub fn record_loop_iteration(chain: ChainType) {
    LOOP_ITERATIONS.with_label_values(&[chain.as_str()]).inc();
}

pub fn record_network_down(chain: ChainType) {
    NETWORK_DOWN.with_label_values(&[chain.as_str()]).inc();
}
