//! Best-effort confirmation tracking for submitted transfers
//!
//! Polls for a receipt at a fixed interval until one is observed, the poll budget
//! derived from the timeout is spent, or the timeout deadline passes (slow lookups
//! eat into the same budget). A timeout only means inclusion was not observed
//! in time; the transaction may still confirm later.

use super::{ChainClient, TxReceipt};

use ethers::types::H256;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

/// Result of waiting for a receipt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationStatus {
    Confirmed(TxReceipt),
    TimedOut,
}

/// Polls the chain client for receipts
pub struct ConfirmationTracker {
    client: Arc<dyn ChainClient>,
    timeout: Duration,
    poll_interval: Duration,
}

impl ConfirmationTracker {
    pub fn new(client: Arc<dyn ChainClient>, timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            client,
            timeout,
            poll_interval,
        }
    }

    /// Number of polls that fit in the timeout, at least one
    pub fn max_polls(&self) -> u32 {
        let interval = self.poll_interval.as_millis().max(1);
        let polls = (self.timeout.as_millis() + interval - 1) / interval;
        polls.clamp(1, u32::MAX as u128) as u32
    }

    /// Wait for the receipt of `tx_hash`. Never fails: RPC errors count as "not yet".
    pub async fn await_confirmation(&self, tx_hash: H256) -> ConfirmationStatus {
        let max_polls = self.max_polls();
        let deadline = Instant::now() + self.timeout;

        for poll in 1..=max_polls {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let budget = if remaining.is_zero() {
                self.poll_interval
            } else {
                self.poll_interval.min(remaining)
            };

            match timeout(budget, self.client.get_receipt(tx_hash)).await {
                Ok(Ok(Some(receipt))) => {
                    info!(
                        "Transaction {:?} confirmed in block {:?} (poll {}/{})",
                        tx_hash, receipt.block_number, poll, max_polls
                    );
                    return ConfirmationStatus::Confirmed(receipt);
                }
                Ok(Ok(None)) => {
                    debug!(
                        "Transaction {:?} pending (poll {}/{})",
                        tx_hash, poll, max_polls
                    );
                }
                Ok(Err(e)) => {
                    warn!("Error checking receipt for {:?}: {}", tx_hash, e);
                }
                Err(_) => {
                    warn!("Receipt lookup for {:?} timed out", tx_hash);
                }
            }

            if poll < max_polls {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                sleep(self.poll_interval.min(remaining)).await;
            }
        }

        warn!(
            "Confirmation of {:?} not observed within {:?}",
            tx_hash, self.timeout
        );
        crate::metrics::record_confirm_timeout();
        ConfirmationStatus::TimedOut
    }
}
