//! Transaction dispatch: fee estimation, nonce sequencing, signing and submission

mod gas;
mod nonce;
mod sender;
mod signer;

pub use gas::{FeeEstimator, FeePolicy};
pub use nonce::NonceSequencer;
pub use sender::{
    DispatchOutcome, DispatchPolicy, DispatchStatus, TransactionDispatcher, TransferIntent,
};
pub use signer::{SenderAccount, TransferSigner, WalletSigner};

#[cfg(test)]
pub use signer::SignedTransaction;
