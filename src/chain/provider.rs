//! Chain provider with multi-RPC support and automatic failover

use super::{ChainClient, Eip1559Fees, TxReceipt};
use crate::config::NetworkConfig;
use crate::error::{DispatchError, DispatchResult};

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

const CONNECT_ATTEMPTS: u32 = 3;
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Multi-provider wrapper with automatic failover
pub struct EthersChainClient {
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
}

impl EthersChainClient {
    /// Create providers for every configured URL
    pub fn new(config: &NetworkConfig) -> DispatchResult<Self> {
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(500));
                    http_providers.push(provider);
                    debug!("Added HTTP provider: {}", url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(DispatchError::ChainConnection {
                message: "No valid RPC providers".to_string(),
            });
        }

        Ok(Self {
            http_providers,
            current_provider: AtomicUsize::new(0),
        })
    }

    /// Create the client and verify the node answers, retrying a few times
    pub async fn connect(config: &NetworkConfig) -> DispatchResult<Self> {
        let client = Self::new(config)?;

        let mut last_error = None;
        for attempt in 1..=CONNECT_ATTEMPTS {
            match client.get_block_number().await {
                Ok(block) => {
                    info!("Connected to network at block {}", block);
                    return Ok(client);
                }
                Err(e) => {
                    warn!(
                        "Connection attempt {}/{} failed: {}",
                        attempt, CONNECT_ATTEMPTS, e
                    );
                    last_error = Some(e);
                    if attempt < CONNECT_ATTEMPTS {
                        tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or(DispatchError::ChainConnection {
            message: "Failed to connect to the network".to_string(),
        }))
    }

    /// Get the active HTTP provider
    fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    fn failover(&self) {
        if self.http_providers.len() < 2 {
            return;
        }
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Failover to provider {}", next);
    }

    /// Get current block number with failover
    pub async fn get_block_number(&self) -> DispatchResult<u64> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_block_number().await {
                Ok(block) => return Ok(block.as_u64()),
                Err(e) => {
                    warn!("Failed to get block number: {}", e);
                    self.failover();
                }
            }
        }

        Err(DispatchError::ChainConnection {
            message: "All providers failed".to_string(),
        })
    }

    fn connection_error(&self, e: ProviderError) -> DispatchError {
        self.failover();
        DispatchError::ChainConnection {
            message: e.to_string(),
        }
    }
}

#[async_trait]
impl ChainClient for EthersChainClient {
    async fn get_chain_id(&self) -> DispatchResult<u64> {
        self.http()
            .get_chainid()
            .await
            .map(|id| id.as_u64())
            .map_err(|e| self.connection_error(e))
    }

    async fn get_transaction_count(&self, address: Address) -> DispatchResult<u64> {
        self.http()
            .get_transaction_count(address, Some(BlockNumber::Pending.into()))
            .await
            .map(|count| count.as_u64())
            .map_err(|e| self.connection_error(e))
    }

    async fn get_balance(&self, address: Address) -> DispatchResult<U256> {
        self.http()
            .get_balance(address, None)
            .await
            .map_err(|e| self.connection_error(e))
    }

    async fn get_eip1559_fees(&self) -> DispatchResult<Eip1559Fees> {
        let block = self
            .http()
            .get_block(BlockNumber::Latest)
            .await
            .map_err(|e| DispatchError::GasEstimation(e.to_string()))?
            .ok_or_else(|| DispatchError::GasEstimation("No latest block".to_string()))?;

        let base_fee_per_gas = block
            .base_fee_per_gas
            .ok_or_else(|| DispatchError::GasEstimation("No base fee in block".to_string()))?;

        let max_priority_fee_per_gas: U256 = self
            .http()
            .request("eth_maxPriorityFeePerGas", ())
            .await
            .map_err(|e| DispatchError::GasEstimation(e.to_string()))?;

        Ok(Eip1559Fees {
            base_fee_per_gas,
            max_priority_fee_per_gas,
        })
    }

    async fn get_gas_price(&self) -> DispatchResult<U256> {
        self.http()
            .get_gas_price()
            .await
            .map_err(|e| DispatchError::GasEstimation(e.to_string()))
    }

    async fn estimate_gas_limit(
        &self,
        from: Address,
        to: Address,
        value: U256,
    ) -> DispatchResult<U256> {
        let tx: TypedTransaction = TransactionRequest::new()
            .from(from)
            .to(to)
            .value(value)
            .into();

        self.http()
            .estimate_gas(&tx, None)
            .await
            .map_err(|e| DispatchError::GasEstimation(e.to_string()))
    }

    async fn submit(&self, raw: Bytes) -> DispatchResult<H256> {
        // Rejections are reported by the node, not the transport; no failover here
        let pending = self
            .http()
            .send_raw_transaction(raw)
            .await
            .map_err(|e| DispatchError::Submission(e.to_string()))?;

        Ok(pending.tx_hash())
    }

    async fn get_receipt(&self, tx_hash: H256) -> DispatchResult<Option<TxReceipt>> {
        let receipt = self
            .http()
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|e| self.connection_error(e))?;

        Ok(receipt.map(|r| TxReceipt {
            tx_hash: r.transaction_hash,
            block_number: r.block_number.map(|b| b.as_u64()),
            success: r.status.map(|s| s.as_u64() == 1),
            gas_used: r.gas_used,
        }))
    }
}
