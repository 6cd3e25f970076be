//! Scriptable chain and signer fakes shared by the unit tests

use crate::chain::{ChainClient, Eip1559Fees, TxReceipt};
use crate::error::{DispatchError, DispatchResult};
use crate::tx::{SenderAccount, SignedTransaction, TransferSigner};

use async_trait::async_trait;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::keccak256;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// In-memory chain whose broadcast results follow a script
pub struct FakeChain {
    nonce_seed: u64,
    balance: U256,
    /// `true` accepts, `false` rejects; once drained, `accept_rest` decides
    script: Mutex<VecDeque<bool>>,
    accept_rest: bool,
    reject_message: String,
    receipts: bool,
    fail_nonce_query: bool,
    /// Time the node takes before answering a broadcast
    submit_delay: Duration,
    /// Time the node takes before answering a receipt lookup
    receipt_delay: Duration,
    submit_results: Mutex<Vec<bool>>,
    nonce_queries: AtomicU32,
    receipt_polls: AtomicU32,
    balance_queries: AtomicU32,
}

impl FakeChain {
    pub fn new(nonce_seed: u64) -> Self {
        Self {
            nonce_seed,
            balance: U256::exp10(24),
            script: Mutex::new(VecDeque::new()),
            accept_rest: true,
            reject_message: "transaction underpriced".to_string(),
            receipts: true,
            fail_nonce_query: false,
            submit_delay: Duration::ZERO,
            receipt_delay: Duration::ZERO,
            submit_results: Mutex::new(Vec::new()),
            nonce_queries: AtomicU32::new(0),
            receipt_polls: AtomicU32::new(0),
            balance_queries: AtomicU32::new(0),
        }
    }

    pub fn with_script(self, script: &[bool]) -> Self {
        *self.script.lock().unwrap() = script.iter().copied().collect();
        self
    }

    pub fn rejecting_all(mut self) -> Self {
        self.accept_rest = false;
        self
    }

    pub fn with_reject_message(mut self, message: &str) -> Self {
        self.reject_message = message.to_string();
        self
    }

    pub fn with_balance(mut self, balance: U256) -> Self {
        self.balance = balance;
        self
    }

    pub fn without_receipts(mut self) -> Self {
        self.receipts = false;
        self
    }

    pub fn failing_nonce_query(mut self) -> Self {
        self.fail_nonce_query = true;
        self
    }

    pub fn with_submit_delay(mut self, delay: Duration) -> Self {
        self.submit_delay = delay;
        self
    }

    pub fn with_receipt_delay(mut self, delay: Duration) -> Self {
        self.receipt_delay = delay;
        self
    }

    pub fn submissions(&self) -> usize {
        self.submit_results.lock().unwrap().len()
    }

    pub fn submit_results(&self) -> Vec<bool> {
        self.submit_results.lock().unwrap().clone()
    }

    pub fn nonce_queries(&self) -> u32 {
        self.nonce_queries.load(Ordering::SeqCst)
    }

    pub fn receipt_polls(&self) -> u32 {
        self.receipt_polls.load(Ordering::SeqCst)
    }

    pub fn balance_queries(&self) -> u32 {
        self.balance_queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChainClient for FakeChain {
    async fn get_chain_id(&self) -> DispatchResult<u64> {
        Ok(1)
    }

    async fn get_transaction_count(&self, _address: Address) -> DispatchResult<u64> {
        self.nonce_queries.fetch_add(1, Ordering::SeqCst);
        if self.fail_nonce_query {
            return Err(DispatchError::ChainConnection {
                message: "connection refused".to_string(),
            });
        }
        Ok(self.nonce_seed)
    }

    async fn get_balance(&self, _address: Address) -> DispatchResult<U256> {
        self.balance_queries.fetch_add(1, Ordering::SeqCst);
        Ok(self.balance)
    }

    async fn get_eip1559_fees(&self) -> DispatchResult<Eip1559Fees> {
        Err(DispatchError::GasEstimation("pre-London chain".to_string()))
    }

    async fn get_gas_price(&self) -> DispatchResult<U256> {
        Ok(U256::from(10_000_000_000u64))
    }

    async fn estimate_gas_limit(
        &self,
        _from: Address,
        _to: Address,
        _value: U256,
    ) -> DispatchResult<U256> {
        Ok(U256::from(21_000))
    }

    async fn submit(&self, raw: Bytes) -> DispatchResult<H256> {
        let accepted = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.accept_rest);
        self.submit_results.lock().unwrap().push(accepted);
        if !self.submit_delay.is_zero() {
            tokio::time::sleep(self.submit_delay).await;
        }

        if accepted {
            Ok(H256::from(keccak256(&raw)))
        } else {
            Err(DispatchError::Submission(self.reject_message.clone()))
        }
    }

    async fn get_receipt(&self, tx_hash: H256) -> DispatchResult<Option<TxReceipt>> {
        self.receipt_polls.fetch_add(1, Ordering::SeqCst);
        if !self.receipt_delay.is_zero() {
            tokio::time::sleep(self.receipt_delay).await;
        }
        Ok(self.receipts.then(|| TxReceipt {
            tx_hash,
            block_number: Some(1),
            success: Some(true),
            gas_used: Some(U256::from(21_000)),
        }))
    }
}

/// Signer that records every request it is asked to sign
pub struct FakeSigner {
    address: Address,
    requests: Mutex<Vec<TypedTransaction>>,
}

impl FakeSigner {
    pub fn new(address: Address) -> Arc<Self> {
        Arc::new(Self {
            address,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<TypedTransaction> {
        self.requests.lock().unwrap().clone()
    }

    pub fn nonces(&self) -> Vec<u64> {
        self.requests()
            .iter()
            .map(|r| r.nonce().map(|n| n.as_u64()).unwrap_or_default())
            .collect()
    }

    pub fn prices(&self) -> Vec<U256> {
        self.requests()
            .iter()
            .map(|r| r.gas_price().unwrap_or_default())
            .collect()
    }
}

#[async_trait]
impl TransferSigner for FakeSigner {
    fn address(&self) -> Address {
        self.address
    }

    async fn sign(&self, request: &TypedTransaction) -> DispatchResult<SignedTransaction> {
        self.requests.lock().unwrap().push(request.clone());
        let raw = request.rlp();
        let tx_hash = H256::from(keccak256(&raw));
        Ok(SignedTransaction { raw, tx_hash })
    }
}

pub fn account(signer: &Arc<FakeSigner>) -> SenderAccount {
    SenderAccount::new(signer.clone())
}
