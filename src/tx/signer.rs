//! Signing capability injected into the dispatcher
//!
//! Key material stays inside the signer; the rest of the crate only sees addresses and
//! signed bytes.

use crate::error::{DispatchError, DispatchResult};

use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, H256};
use ethers::utils::keccak256;
use std::fmt;
use std::sync::Arc;

/// Signed, ready-to-broadcast transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    pub raw: Bytes,
    pub tx_hash: H256,
}

/// Opaque signer for one sender account
#[async_trait]
pub trait TransferSigner: Send + Sync {
    fn address(&self) -> Address;

    async fn sign(&self, request: &TypedTransaction) -> DispatchResult<SignedTransaction>;
}

/// Signer backed by a local private key
pub struct WalletSigner {
    wallet: LocalWallet,
}

impl WalletSigner {
    pub fn new(wallet: LocalWallet, chain_id: u64) -> Self {
        Self {
            wallet: wallet.with_chain_id(chain_id),
        }
    }

    /// Parse a hex private key
    pub fn from_key(key: &str, chain_id: u64) -> DispatchResult<Self> {
        let wallet = key
            .trim()
            .parse::<LocalWallet>()
            .map_err(|e| DispatchError::Wallet(format!("Invalid private key: {}", e)))?;
        Ok(Self::new(wallet, chain_id))
    }
}

#[async_trait]
impl TransferSigner for WalletSigner {
    fn address(&self) -> Address {
        self.wallet.address()
    }

    async fn sign(&self, request: &TypedTransaction) -> DispatchResult<SignedTransaction> {
        let signature = self
            .wallet
            .sign_transaction(request)
            .await
            .map_err(|e| DispatchError::Wallet(e.to_string()))?;

        let raw = request.rlp_signed(&signature);
        let tx_hash = H256::from(keccak256(&raw));
        Ok(SignedTransaction { raw, tx_hash })
    }
}

/// An operator-controlled sender: its address plus the capability to sign for it
#[derive(Clone)]
pub struct SenderAccount {
    address: Address,
    signer: Arc<dyn TransferSigner>,
}

impl SenderAccount {
    pub fn new(signer: Arc<dyn TransferSigner>) -> Self {
        Self {
            address: signer.address(),
            signer,
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn signer(&self) -> &dyn TransferSigner {
        self.signer.as_ref()
    }
}

impl fmt::Debug for SenderAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SenderAccount")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}
