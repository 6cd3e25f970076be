//! Transaction dispatcher with bounded retry and fee escalation
//!
//! One call to [`TransactionDispatcher::dispatch`] drives a single transfer intent to a
//! terminal outcome. The nonce slot for the sender is held for the whole call, so
//! allocations for the same sender are serialized while other senders proceed freely.

use super::gas::{FeeEstimator, FeeQuote, GasPrice};
use super::nonce::{NonceSequencer, NonceSlot};
use super::signer::SenderAccount;
use crate::chain::{ChainClient, ConfirmationStatus};
use crate::config::DispatchConfig;
use crate::error::{DispatchError, DispatchResult};

use ethers::prelude::*;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::utils::format_ether;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

/// A single native-asset transfer to perform. Immutable once created.
#[derive(Debug, Clone)]
pub struct TransferIntent {
    pub sender: SenderAccount,
    pub destination: Address,
    pub amount_wei: U256,
    pub chain_id: u64,
}

/// Terminal status of an intent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DispatchStatus {
    Sent,
    Confirmed,
    SendFailed,
    ConfirmTimedOut,
}

/// What happened to an intent
#[derive(Debug, Clone, Serialize)]
pub struct DispatchOutcome {
    pub tx_hash: Option<H256>,
    pub status: DispatchStatus,
    pub error: Option<String>,
    pub nonce: Option<u64>,
    pub attempts: u32,
    /// Quote used by the last attempt
    pub quote: Option<FeeQuote>,
}

impl DispatchOutcome {
    fn failed(nonce: Option<u64>, attempts: u32, quote: Option<FeeQuote>, error: &DispatchError) -> Self {
        Self {
            tx_hash: None,
            status: DispatchStatus::SendFailed,
            error: Some(error.to_string()),
            nonce,
            attempts,
            quote,
        }
    }

    /// Fold a confirmation result into a `Sent` outcome
    pub fn with_confirmation(mut self, confirmation: ConfirmationStatus) -> Self {
        if self.status != DispatchStatus::Sent {
            return self;
        }
        match confirmation {
            ConfirmationStatus::Confirmed(receipt) => {
                self.status = DispatchStatus::Confirmed;
                if receipt.success == Some(false) {
                    self.error = Some("transaction reverted".to_string());
                }
            }
            ConfirmationStatus::TimedOut => {
                self.status = DispatchStatus::ConfirmTimedOut;
                self.error = Some("confirmation not observed before timeout".to_string());
            }
        }
        self
    }
}

/// Retry policy derived from the dispatch configuration
#[derive(Debug, Clone)]
pub struct DispatchPolicy {
    pub max_attempts: u32,
    pub retry_backoff: Duration,
    pub submit_timeout: Duration,
    pub preflight_balance_check: bool,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self::from(&DispatchConfig::default())
    }
}

impl From<&DispatchConfig> for DispatchPolicy {
    fn from(config: &DispatchConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            submit_timeout: Duration::from_secs(config.submit_timeout_secs.max(1)),
            preflight_balance_check: config.preflight_balance_check,
        }
    }
}

/// Builds, signs, submits and retries transfers
pub struct TransactionDispatcher {
    client: Arc<dyn ChainClient>,
    nonces: Arc<NonceSequencer>,
    estimator: FeeEstimator,
    policy: DispatchPolicy,
}

impl TransactionDispatcher {
    pub fn new(
        client: Arc<dyn ChainClient>,
        nonces: Arc<NonceSequencer>,
        estimator: FeeEstimator,
        policy: DispatchPolicy,
    ) -> Self {
        Self {
            client,
            nonces,
            estimator,
            policy,
        }
    }

    pub fn nonces(&self) -> &Arc<NonceSequencer> {
        &self.nonces
    }

    /// Drive one intent to a terminal outcome. Failures are reported in the outcome,
    /// never returned as errors.
    pub async fn dispatch(&self, intent: &TransferIntent) -> DispatchOutcome {
        let started = Instant::now();
        let sender = intent.sender.address();
        let label = format!("{:?}", sender);

        let mut slot = self.nonces.acquire(sender).await;
        let nonce = match slot.next(self.client.as_ref()).await {
            Ok(nonce) => nonce,
            Err(e) => {
                error!("Could not allocate nonce for {:?}: {}", sender, e);
                crate::metrics::record_transfer_failed(&label);
                return DispatchOutcome::failed(None, 0, None, &e);
            }
        };

        let mut quote = self
            .estimator
            .estimate(
                self.client.as_ref(),
                sender,
                intent.destination,
                intent.amount_wei,
            )
            .await;

        let balance = self.observe_balance(sender, &label).await;
        if let (true, Some(balance)) = (self.policy.preflight_balance_check, balance) {
            if let Err(e) = check_funds(intent, &quote, balance) {
                warn!("Skipping transfer to {:?}: {}", intent.destination, e);
                crate::metrics::record_transfer_failed(&label);
                return DispatchOutcome::failed(Some(nonce), 0, Some(quote), &e);
            }
        }

        let max_attempts = self.policy.max_attempts;
        let mut last_error = None;
        let mut nonce_ambiguous = false;

        for attempt in 1..=max_attempts {
            crate::metrics::record_submission_attempt(&label);
            let request = build_transfer_request(intent, nonce, &quote);

            match self.sign_and_submit(intent, &request).await {
                Ok(tx_hash) => {
                    self.record_broadcast(&mut slot);
                    info!(
                        "Transaction sent: {:?} nonce {} (attempt {}/{})",
                        tx_hash, nonce, attempt, max_attempts
                    );
                    crate::metrics::record_transfer_sent(&label);
                    crate::metrics::record_dispatch_latency(&label, started.elapsed().as_secs_f64());
                    return DispatchOutcome {
                        tx_hash: Some(tx_hash),
                        status: DispatchStatus::Sent,
                        error: None,
                        nonce: Some(nonce),
                        attempts: attempt,
                        quote: Some(quote),
                    };
                }
                Err(e) => {
                    warn!(
                        "Transfer to {:?} failed (attempt {}/{}): {}",
                        intent.destination, attempt, max_attempts, e
                    );
                    nonce_ambiguous |= e.leaves_nonce_ambiguous();
                    last_error = Some(e);

                    if attempt < max_attempts {
                        sleep(self.policy.retry_backoff).await;
                        quote = self.estimator.escalate(&quote);
                        debug!("Escalated fee to {:?}", quote.price);
                    }
                }
            }
        }

        let error = last_error
            .unwrap_or_else(|| DispatchError::Internal("no attempt was made".to_string()));
        if nonce_ambiguous {
            slot.invalidate();
        }

        error!(
            "Transfer to {:?} failed after {} attempts: {}",
            intent.destination, max_attempts, error
        );
        crate::metrics::record_transfer_failed(&label);
        DispatchOutcome::failed(Some(nonce), max_attempts, Some(quote), &error)
    }

    fn record_broadcast(&self, slot: &mut NonceSlot) {
        if let Err(e) = slot.advance() {
            error!("Nonce bookkeeping failed for {:?}: {}", slot.address(), e);
        }
    }

    async fn sign_and_submit(
        &self,
        intent: &TransferIntent,
        request: &TypedTransaction,
    ) -> DispatchResult<H256> {
        let signed = intent.sender.signer().sign(request).await?;

        let reported = timeout(self.policy.submit_timeout, self.client.submit(signed.raw))
            .await
            .map_err(|_| DispatchError::SubmitTimeout {
                secs: self.policy.submit_timeout.as_secs(),
            })??;

        if reported != signed.tx_hash {
            warn!(
                "Node reported hash {:?} for transaction signed as {:?}",
                reported, signed.tx_hash
            );
        }
        Ok(signed.tx_hash)
    }

    /// Read the sender's balance for the log and the balance gauge. A failed lookup
    /// yields `None`, which also skips the pre-flight check.
    async fn observe_balance(&self, sender: Address, label: &str) -> Option<U256> {
        match self.client.get_balance(sender).await {
            Ok(balance) => {
                let eth = format_ether(balance);
                debug!("Balance of {:?}: {} ETH", sender, eth);
                if let Ok(value) = eth.parse::<f64>() {
                    crate::metrics::record_wallet_balance(label, value);
                }
                Some(balance)
            }
            Err(e) => {
                warn!("Could not read balance of {:?}: {}", sender, e);
                None
            }
        }
    }
}

/// Fail when `balance` cannot cover the amount plus the worst-case fee
fn check_funds(intent: &TransferIntent, quote: &FeeQuote, balance: U256) -> DispatchResult<()> {
    let need = intent.amount_wei.saturating_add(quote.max_cost());
    if balance < need {
        return Err(DispatchError::InsufficientBalance {
            address: format!("{:?}", intent.sender.address()),
            have: balance.to_string(),
            need: need.to_string(),
        });
    }
    Ok(())
}

/// Build a fully populated transfer request for one attempt
pub fn build_transfer_request(
    intent: &TransferIntent,
    nonce: u64,
    quote: &FeeQuote,
) -> TypedTransaction {
    match quote.price {
        GasPrice::Legacy(price) => TransactionRequest::new()
            .from(intent.sender.address())
            .to(intent.destination)
            .value(intent.amount_wei)
            .nonce(nonce)
            .gas(quote.gas_limit)
            .gas_price(price)
            .chain_id(intent.chain_id)
            .into(),
        GasPrice::Eip1559 {
            max_fee_per_gas,
            max_priority_fee_per_gas,
        } => Eip1559TransactionRequest::new()
            .from(intent.sender.address())
            .to(intent.destination)
            .value(intent.amount_wei)
            .nonce(nonce)
            .gas(quote.gas_limit)
            .max_fee_per_gas(max_fee_per_gas)
            .max_priority_fee_per_gas(max_priority_fee_per_gas)
            .chain_id(intent.chain_id)
            .into(),
    }
}
