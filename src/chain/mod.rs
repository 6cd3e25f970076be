//! Chain module - the narrow RPC surface the dispatcher depends on
//!
//! This module provides:
//! - The [`ChainClient`] capability consumed by the fee estimator, nonce sequencer,
//!   dispatcher and confirmation tracker
//! - An ethers-backed implementation with multi-RPC failover
//! - Receipt polling with a bounded budget

pub mod confirmation;
pub mod provider;

pub use confirmation::{ConfirmationStatus, ConfirmationTracker};
pub use provider::EthersChainClient;

use crate::error::DispatchResult;

use async_trait::async_trait;
use ethers::types::{Address, Bytes, H256, U256};

/// Current base fee and suggested priority fee
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Eip1559Fees {
    pub base_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
}

/// The parts of a receipt the dispatcher cares about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: H256,
    pub block_number: Option<u64>,
    /// `Some(false)` when the transaction was included but reverted
    pub success: Option<bool>,
    pub gas_used: Option<U256>,
}

/// RPC operations used by the dispatch engine. Implementations carry no business logic.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Chain ID reported by the node
    async fn get_chain_id(&self) -> DispatchResult<u64>;

    /// Transaction count including pending transactions
    async fn get_transaction_count(&self, address: Address) -> DispatchResult<u64>;

    async fn get_balance(&self, address: Address) -> DispatchResult<U256>;

    /// Base fee of the latest block plus the node's priority fee suggestion
    async fn get_eip1559_fees(&self) -> DispatchResult<Eip1559Fees>;

    /// Legacy single gas price
    async fn get_gas_price(&self) -> DispatchResult<U256>;

    async fn estimate_gas_limit(
        &self,
        from: Address,
        to: Address,
        value: U256,
    ) -> DispatchResult<U256>;

    /// Broadcast signed bytes, returning the hash the node reports
    async fn submit(&self, raw: Bytes) -> DispatchResult<H256>;

    async fn get_receipt(&self, tx_hash: H256) -> DispatchResult<Option<TxReceipt>>;
}
