//! Dispatch reports emitted for every finished intent
//!
//! The orchestrator hands each [`DispatchReport`] to a [`ReportSink`]. Presentation is the
//! sink's business; the dispatch engine only produces the structured event.

use crate::tx::{DispatchOutcome, DispatchStatus};

use chrono::{DateTime, Utc};
use ethers::types::{Address, H256, U256};
use ethers::utils::format_ether;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

/// Structured record of one intent and its terminal outcome
#[derive(Debug, Clone, Serialize)]
pub struct DispatchReport {
    pub run_id: Uuid,
    pub sender: Address,
    pub destination: Address,
    pub amount_wei: U256,
    pub amount_eth: String,
    /// Position of the intent within the run, starting at 1
    pub sequence: u64,
    pub outcome: DispatchOutcome,
    pub explorer_link: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl DispatchReport {
    pub fn new(
        run_id: Uuid,
        sequence: u64,
        sender: Address,
        destination: Address,
        amount_wei: U256,
        outcome: DispatchOutcome,
        explorer_url: Option<&str>,
    ) -> Self {
        let explorer_link = match (explorer_url, outcome.tx_hash) {
            (Some(template), Some(hash)) => Some(explorer_link(template, hash)),
            _ => None,
        };

        Self {
            run_id,
            sender,
            destination,
            amount_wei,
            amount_eth: format_ether(amount_wei),
            sequence,
            outcome,
            explorer_link,
            timestamp: Utc::now(),
        }
    }
}

/// Receives dispatch reports
pub trait ReportSink: Send + Sync {
    fn report(&self, report: &DispatchReport);
}

/// Writes reports to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ReportSink for TracingReporter {
    fn report(&self, report: &DispatchReport) {
        let outcome = &report.outcome;
        let link = report.explorer_link.as_deref().unwrap_or("-");

        match outcome.status {
            DispatchStatus::Confirmed | DispatchStatus::Sent => info!(
                run_id = %report.run_id,
                sequence = report.sequence,
                status = ?outcome.status,
                "{} ETH {:?} -> {:?} tx {:?} ({})",
                report.amount_eth,
                report.sender,
                report.destination,
                outcome.tx_hash,
                link
            ),
            DispatchStatus::ConfirmTimedOut | DispatchStatus::SendFailed => warn!(
                run_id = %report.run_id,
                sequence = report.sequence,
                status = ?outcome.status,
                "{} ETH {:?} -> {:?} tx {:?} ({}): {}",
                report.amount_eth,
                report.sender,
                report.destination,
                outcome.tx_hash,
                link,
                outcome.error.as_deref().unwrap_or("unknown error")
            ),
        }
    }
}

/// Fans reports out to in-process subscribers. Having no subscribers is not an error.
impl ReportSink for broadcast::Sender<DispatchReport> {
    fn report(&self, report: &DispatchReport) {
        let _ = self.send(report.clone());
    }
}

/// Render a block-explorer link. `template` either contains a `{hash}` placeholder or is a
/// prefix such as `https://etherscan.io/tx/` or a bare explorer base URL.
pub fn explorer_link(template: &str, tx_hash: H256) -> String {
    let hash = format!("0x{}", hex::encode(tx_hash.as_bytes()));

    if template.contains("{hash}") {
        return template.replace("{hash}", &hash);
    }

    let base = template.trim_end_matches('/');
    if base.ends_with("/tx") {
        format!("{}/{}", base, hash)
    } else {
        format!("{}/tx/{}", base, hash)
    }
}
