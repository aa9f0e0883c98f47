//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Nonce lock contention and stale takeovers
//! - Session lifecycle and reconciliation outcomes
//! - RPC failover and recovery
//! - Transaction submissions

use crate::chain::RpcStateChange;
use crate::error::{CoordinatorError, CoordinatorResult};

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, CounterVec, Encoder, GaugeVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Lock metrics
    pub static ref LOCKS_ACQUIRED: CounterVec = register_counter_vec!(
        "txcoord_nonce_locks_acquired_total",
        "Total nonce locks acquired",
        &["chain_id"]
    ).unwrap();

    pub static ref LOCK_CONTENTION: CounterVec = register_counter_vec!(
        "txcoord_nonce_lock_contention_total",
        "Total lock attempts that found the key held",
        &["chain_id"]
    ).unwrap();

    pub static ref LOCK_FAILURES: CounterVec = register_counter_vec!(
        "txcoord_nonce_lock_failures_total",
        "Total acquisitions abandoned after max retries",
        &["chain_id"]
    ).unwrap();

    pub static ref STALE_TAKEOVERS: CounterVec = register_counter_vec!(
        "txcoord_nonce_lock_stale_takeovers_total",
        "Total stale locks taken over",
        &["chain_id"]
    ).unwrap();

    // Session metrics
    pub static ref SESSIONS_ACTIVE: GaugeVec = register_gauge_vec!(
        "txcoord_nonce_sessions_active",
        "Nonce sessions currently held by this process",
        &["chain_id"]
    ).unwrap();

    pub static ref RECONCILED: CounterVec = register_counter_vec!(
        "txcoord_reconciled_transactions_total",
        "Pending transactions resolved at session start by outcome",
        &["chain_id", "outcome"]
    ).unwrap();

    // RPC metrics
    pub static ref RPC_FAILOVERS: CounterVec = register_counter_vec!(
        "txcoord_rpc_failovers_total",
        "Total switches from primary to fallback endpoint",
        &["primary_url"]
    ).unwrap();

    pub static ref RPC_RECOVERIES: CounterVec = register_counter_vec!(
        "txcoord_rpc_recoveries_total",
        "Total switches back to the primary endpoint",
        &["primary_url"]
    ).unwrap();

    pub static ref RPC_ON_FALLBACK: GaugeVec = register_gauge_vec!(
        "txcoord_rpc_on_fallback",
        "Endpoint pair currently served by its fallback (1) or primary (0)",
        &["primary_url"]
    ).unwrap();

    // Transaction metrics
    pub static ref TX_SUBMITTED: CounterVec = register_counter_vec!(
        "txcoord_transactions_submitted_total",
        "Total transactions broadcast",
        &["chain_id"]
    ).unwrap();

    pub static ref TX_CONFIRMED: CounterVec = register_counter_vec!(
        "txcoord_transactions_confirmed_total",
        "Total transactions included successfully",
        &["chain_id"]
    ).unwrap();

    pub static ref TX_FAILED: CounterVec = register_counter_vec!(
        "txcoord_transactions_failed_total",
        "Total transactions failed after broadcast",
        &["chain_id", "reason"]
    ).unwrap();

    // Health metrics
    pub static ref HEALTH_CHECK_SUCCESS: CounterVec = register_counter_vec!(
        "txcoord_health_check_success_total",
        "Total successful health checks",
        &[]
    ).unwrap();

    pub static ref HEALTH_CHECK_FAILURE: CounterVec = register_counter_vec!(
        "txcoord_health_check_failure_total",
        "Total failed health checks",
        &[]
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

    pub async fn run(&self) -> CoordinatorResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| CoordinatorError::Config(format!("Cannot bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| CoordinatorError::Internal(format!("Metrics server failed: {}", e)))
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    render().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

/// Text exposition of the default registry
pub fn render() -> CoordinatorResult<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| CoordinatorError::Internal(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| CoordinatorError::Internal(e.to_string()))
}

// Helper functions to record metrics

pub fn record_lock_acquired(chain_id: u64) {
    LOCKS_ACQUIRED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_lock_contention(chain_id: u64) {
    LOCK_CONTENTION
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_lock_failure(chain_id: u64) {
    LOCK_FAILURES
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_stale_takeover(chain_id: u64) {
    STALE_TAKEOVERS
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_session_started(chain_id: u64) {
    SESSIONS_ACTIVE
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_session_ended(chain_id: u64) {
    SESSIONS_ACTIVE
        .with_label_values(&[&chain_id.to_string()])
        .dec();
}

pub fn record_reconciliation(chain_id: u64, outcome: &str) {
    RECONCILED
        .with_label_values(&[&chain_id.to_string(), outcome])
        .inc();
}

/// Observer registered on every failover manager
pub fn record_rpc_state_change(change: &RpcStateChange) {
    match change {
        RpcStateChange::Failover { primary_url, .. } => {
            RPC_FAILOVERS.with_label_values(&[primary_url.as_str()]).inc();
            RPC_ON_FALLBACK.with_label_values(&[primary_url.as_str()]).set(1.0);
        }
        RpcStateChange::Recovery { primary_url, .. } => {
            RPC_RECOVERIES.with_label_values(&[primary_url.as_str()]).inc();
            RPC_ON_FALLBACK.with_label_values(&[primary_url.as_str()]).set(0.0);
        }
    }
}

pub fn record_tx_submitted(chain_id: u64) {
    TX_SUBMITTED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_tx_confirmed(chain_id: u64) {
    TX_CONFIRMED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_tx_failed(chain_id: u64, reason: &str) {
    TX_FAILED
        .with_label_values(&[&chain_id.to_string(), reason])
        .inc();
}

pub fn record_health_check() {
    HEALTH_CHECK_SUCCESS.with_label_values(&[]).inc();
}

pub fn record_health_check_failure() {
    HEALTH_CHECK_FAILURE.with_label_values(&[]).inc();
}
