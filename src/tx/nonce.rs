//! Nonce sequencing per sender
//!
//! Handles:
//! - Lazy seeding from the on-chain transaction count
//! - Advancing only after a successful broadcast
//! - Serialized allocation per sender (one slot holder at a time)
//! - Re-seeding after a nonce conflict

use crate::chain::ChainClient;
use crate::error::{DispatchError, DispatchResult};

use dashmap::DashMap;
use ethers::types::Address;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

/// Per-sender nonce state
#[derive(Debug, Default)]
struct SenderNonce {
    /// Next nonce to use; `None` until seeded from the chain
    current: Option<u64>,
    /// Successful broadcasts recorded for this sender
    advances: u64,
    /// Times the counter was (re)seeded from the chain
    seeds: u64,
}

/// Snapshot of a sender's nonce state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NonceStats {
    pub next: Option<u64>,
    pub advances: u64,
    pub seeds: u64,
}

/// Manages nonces across sender accounts
#[derive(Default)]
pub struct NonceSequencer {
    senders: DashMap<Address, Arc<Mutex<SenderNonce>>>,
}

impl NonceSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, address: Address) -> Arc<Mutex<SenderNonce>> {
        self.senders
            .entry(address)
            .or_insert_with(|| Arc::new(Mutex::new(SenderNonce::default())))
            .clone()
    }

    /// Take exclusive ownership of a sender's nonce until the slot is dropped.
    /// Slots for different senders never block each other.
    pub async fn acquire(&self, address: Address) -> NonceSlot {
        let state = self.entry(address).lock_owned().await;
        NonceSlot { address, state }
    }

    /// Current state for a sender, if it was ever touched
    pub async fn stats(&self, address: Address) -> Option<NonceStats> {
        let entry = self.senders.get(&address).map(|e| e.value().clone())?;
        let state = entry.lock().await;
        Some(NonceStats {
            next: state.current,
            advances: state.advances,
            seeds: state.seeds,
        })
    }
}

/// Exclusive handle on one sender's nonce counter
pub struct NonceSlot {
    address: Address,
    state: OwnedMutexGuard<SenderNonce>,
}

impl NonceSlot {
    pub fn address(&self) -> Address {
        self.address
    }

    /// Nonce for the next transaction; seeds from the chain on first use. Does not mutate
    /// the counter once seeded.
    pub async fn next(&mut self, client: &dyn ChainClient) -> DispatchResult<u64> {
        if let Some(nonce) = self.state.current {
            return Ok(nonce);
        }

        let seeded = client
            .get_transaction_count(self.address)
            .await
            .map_err(|e| DispatchError::Nonce {
                address: format!("{:?}", self.address),
                message: e.to_string(),
            })?;

        self.state.current = Some(seeded);
        self.state.seeds += 1;
        debug!("Seeded nonce for {:?}: {}", self.address, seeded);
        Ok(seeded)
    }

    /// Record one successful broadcast
    pub fn advance(&mut self) -> DispatchResult<u64> {
        let current = self.state.current.ok_or_else(|| DispatchError::Nonce {
            address: format!("{:?}", self.address),
            message: "advance before seeding".to_string(),
        })?;

        let next = current + 1;
        self.state.current = Some(next);
        self.state.advances += 1;
        debug!("Advanced nonce for {:?} to {}", self.address, next);
        Ok(next)
    }

    /// Drop the cached counter so the next allocation re-reads the chain
    pub fn invalidate(&mut self) {
        if self.state.current.take().is_some() {
            warn!("Invalidated cached nonce for {:?}", self.address);
        }
    }
}
