//! Error types for the transfer dispatcher

use thiserror::Error;

/// Main error type for the dispatcher
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Chain connection error: {message}")]
    ChainConnection { message: String },

    #[error("Chain ID mismatch: configured {expected}, network reports {actual}")]
    ChainIdMismatch { expected: u64, actual: u64 },

    #[error("Nonce error for {address}: {message}")]
    Nonce { address: String, message: String },

    #[error("Gas estimation error: {0}")]
    GasEstimation(String),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Submission rejected: {0}")]
    Submission(String),

    /// The node did not answer a broadcast in time; it may still have accepted it
    #[error("No answer to transaction broadcast within {secs}s")]
    SubmitTimeout { secs: u64 },

    #[error("Insufficient balance for {address}: have {have} wei, need {need} wei")]
    InsufficientBalance {
        address: String,
        have: String,
        need: String,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    /// Broadcast rejections that mean the cached nonce no longer matches the chain
    pub fn is_nonce_conflict(&self) -> bool {
        match self {
            DispatchError::Submission(message) => {
                let message = message.to_lowercase();
                message.contains("nonce too low")
                    || message.contains("already known")
                    || message.contains("replacement transaction underpriced")
            }
            DispatchError::Nonce { .. } => true,
            _ => false,
        }
    }

    /// Whether a transaction for the cached nonce may have reached the mempool anyway,
    /// so the counter must be re-read from the chain before it is used again
    pub fn leaves_nonce_ambiguous(&self) -> bool {
        self.is_nonce_conflict() || matches!(self, DispatchError::SubmitTimeout { .. })
    }
}

/// Result type for dispatcher operations
pub type DispatchResult<T> = Result<T, DispatchError>;
