//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Submission attempts and fee escalations
//! - Transfer outcomes per sender
//! - Sender balances
//! - Dispatch latency

use crate::error::{DispatchError, DispatchResult};

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge_vec, register_histogram_vec, Counter,
    CounterVec, Encoder, GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Submission metrics
    pub static ref SUBMISSION_ATTEMPTS: CounterVec = register_counter_vec!(
        "dispatcher_submission_attempts_total",
        "Total broadcast attempts",
        &["sender"]
    ).unwrap();

    pub static ref FEE_ESCALATIONS: Counter = register_counter!(
        "dispatcher_fee_escalations_total",
        "Total fee escalations between retry attempts"
    ).unwrap();

    // Outcome metrics
    pub static ref TRANSFERS_SENT: CounterVec = register_counter_vec!(
        "dispatcher_transfers_sent_total",
        "Total transfers accepted by the node",
        &["sender"]
    ).unwrap();

    pub static ref TRANSFERS_CONFIRMED: CounterVec = register_counter_vec!(
        "dispatcher_transfers_confirmed_total",
        "Total transfers observed in a block",
        &["sender"]
    ).unwrap();

    pub static ref TRANSFERS_FAILED: CounterVec = register_counter_vec!(
        "dispatcher_transfers_failed_total",
        "Total transfers that were never broadcast",
        &["sender"]
    ).unwrap();

    pub static ref CONFIRM_TIMEOUTS: Counter = register_counter!(
        "dispatcher_confirmation_timeouts_total",
        "Total confirmations not observed before the timeout"
    ).unwrap();

    pub static ref DISPATCH_LATENCY: HistogramVec = register_histogram_vec!(
        "dispatcher_dispatch_latency_seconds",
        "Time from nonce allocation to accepted broadcast",
        &["sender"],
        vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
    ).unwrap();

    // Wallet metrics
    pub static ref WALLET_BALANCE: GaugeVec = register_gauge_vec!(
        "dispatcher_wallet_balance_eth",
        "Sender balance in ETH",
        &["sender"]
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

    pub async fn run(&self) -> DispatchResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| DispatchError::Internal(format!("Metrics bind failed: {}", e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| DispatchError::Internal(format!("Metrics server failed: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    render().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

fn render() -> DispatchResult<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| DispatchError::Internal(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| DispatchError::Internal(e.to_string()))
}

// Helper functions to record metrics

pub fn record_submission_attempt(sender: &str) {
    SUBMISSION_ATTEMPTS.with_label_values(&[sender]).inc();
}

pub fn record_fee_escalation() {
    FEE_ESCALATIONS.inc();
}

pub fn record_transfer_sent(sender: &str) {
    TRANSFERS_SENT.with_label_values(&[sender]).inc();
}

pub fn record_transfer_confirmed(sender: &str) {
    TRANSFERS_CONFIRMED.with_label_values(&[sender]).inc();
}

pub fn record_transfer_failed(sender: &str) {
    TRANSFERS_FAILED.with_label_values(&[sender]).inc();
}

pub fn record_confirm_timeout() {
    CONFIRM_TIMEOUTS.inc();
}

pub fn record_dispatch_latency(sender: &str, latency_secs: f64) {
    DISPATCH_LATENCY
        .with_label_values(&[sender])
        .observe(latency_secs);
}

pub fn record_wallet_balance(sender: &str, balance_eth: f64) {
    WALLET_BALANCE
        .with_label_values(&[sender])
        .set(balance_eth);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorded_metrics_are_rendered() {
        record_submission_attempt("0xmetrics");
        record_wallet_balance("0xmetrics", 1.5);

        let text = render().unwrap();
        assert!(text.contains("dispatcher_submission_attempts_total"));
        assert!(text.contains("dispatcher_wallet_balance_eth{sender=\"0xmetrics\"} 1.5"));
    }
}
