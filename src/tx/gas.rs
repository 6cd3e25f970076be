//! Fee estimation and escalation for native transfers

use crate::chain::ChainClient;
use crate::config::{DispatchConfig, FeeMode};

use ethers::types::{Address, U256};
use ethers::utils::parse_units;
use serde::Serialize;
use tracing::{debug, warn};

/// Minimum gas a plain value transfer consumes
pub const MIN_TRANSFER_GAS: u64 = 21_000;

/// Legacy price used when the network gives no fee data at all (30 gwei)
pub const DEFAULT_GAS_PRICE_WEI: u64 = 30_000_000_000;

/// Gas price types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GasPrice {
    Legacy(U256),
    Eip1559 {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
}

impl GasPrice {
    /// Highest per-gas price the transaction may pay
    pub fn ceiling(&self) -> U256 {
        match self {
            GasPrice::Legacy(price) => *price,
            GasPrice::Eip1559 {
                max_fee_per_gas, ..
            } => *max_fee_per_gas,
        }
    }

    fn scaled(&self, percent: u64) -> GasPrice {
        match self {
            GasPrice::Legacy(price) => GasPrice::Legacy(bump(*price, percent)),
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => GasPrice::Eip1559 {
                max_fee_per_gas: bump(*max_fee_per_gas, percent),
                max_priority_fee_per_gas: bump(*max_priority_fee_per_gas, percent),
            },
        }
    }
}

/// Multiply by `percent / 100`; when `percent > 100` the result is always strictly larger
fn bump(value: U256, percent: u64) -> U256 {
    let scaled = value.saturating_mul(U256::from(percent)) / 100;
    if percent > 100 && scaled <= value {
        value.saturating_add(U256::one())
    } else {
        scaled
    }
}

/// Priced gas settings for one dispatch attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FeeQuote {
    pub price: GasPrice,
    pub gas_limit: U256,
    /// Multiplier (in percent) applied to the network price
    pub margin_percent: u64,
}

impl FeeQuote {
    /// Worst-case fee in wei
    pub fn max_cost(&self) -> U256 {
        self.gas_limit.saturating_mul(self.price.ceiling())
    }
}

/// Fee policy derived from the dispatch configuration
#[derive(Debug, Clone)]
pub struct FeePolicy {
    pub mode: FeeMode,
    pub legacy_transactions: bool,
    pub price_multiplier_percent: u64,
    pub limit_margin_percent: u64,
    pub escalation_percent: u64,
    pub fixed_gas_price: Option<U256>,
    pub fixed_gas_limit: u64,
}

impl Default for FeePolicy {
    fn default() -> Self {
        Self::from(&DispatchConfig::default())
    }
}

impl From<&DispatchConfig> for FeePolicy {
    fn from(config: &DispatchConfig) -> Self {
        let fixed_gas_price = config
            .fixed_gas_price_gwei
            .and_then(|gwei| parse_units(format!("{gwei:.9}"), "gwei").ok())
            .map(U256::from);

        Self {
            mode: config.fee_mode,
            legacy_transactions: config.legacy_transactions,
            price_multiplier_percent: config.price_multiplier_percent,
            limit_margin_percent: config.limit_margin_percent,
            escalation_percent: config.escalation_percent,
            fixed_gas_price,
            fixed_gas_limit: config.fixed_gas_limit.max(MIN_TRANSFER_GAS),
        }
    }
}

/// Gas estimator for transfers
#[derive(Debug, Clone, Default)]
pub struct FeeEstimator {
    policy: FeePolicy,
}

impl FeeEstimator {
    pub fn new(policy: FeePolicy) -> Self {
        Self { policy }
    }

    /// Quote gas price and limit for a transfer. Sub-query failures fall back to defaults.
    pub async fn estimate(
        &self,
        client: &dyn ChainClient,
        sender: Address,
        destination: Address,
        amount_wei: U256,
    ) -> FeeQuote {
        let quote = match self.policy.mode {
            FeeMode::Dynamic => FeeQuote {
                price: self.dynamic_price(client).await,
                gas_limit: self.estimate_limit(client, sender, destination, amount_wei).await,
                margin_percent: self.policy.price_multiplier_percent,
            },
            FeeMode::Fixed => FeeQuote {
                price: self.fixed_price(client).await,
                gas_limit: U256::from(self.policy.fixed_gas_limit),
                margin_percent: 100,
            },
        };

        debug!("Fee quote for {:?} -> {:?}: {:?}", sender, destination, quote);
        quote
    }

    /// Derive a strictly more expensive quote for the next attempt; limit unchanged
    pub fn escalate(&self, previous: &FeeQuote) -> FeeQuote {
        crate::metrics::record_fee_escalation();
        FeeQuote {
            price: previous.price.scaled(self.policy.escalation_percent),
            gas_limit: previous.gas_limit,
            margin_percent: previous.margin_percent,
        }
    }

    async fn dynamic_price(&self, client: &dyn ChainClient) -> GasPrice {
        let multiplier = self.policy.price_multiplier_percent;

        match client.get_eip1559_fees().await {
            Ok(fees) => {
                let total = fees
                    .base_fee_per_gas
                    .saturating_add(fees.max_priority_fee_per_gas);
                if self.policy.legacy_transactions {
                    return GasPrice::Legacy(bump(total, multiplier));
                }
                return GasPrice::Eip1559 {
                    max_fee_per_gas: bump(total, multiplier),
                    max_priority_fee_per_gas: bump(fees.max_priority_fee_per_gas, multiplier),
                };
            }
            Err(e) => {
                debug!("EIP-1559 fee data unavailable, using legacy price: {}", e);
            }
        }

        match client.get_gas_price().await {
            Ok(price) => GasPrice::Legacy(bump(price, multiplier)),
            Err(e) => {
                warn!("Gas price lookup failed, using default: {}", e);
                GasPrice::Legacy(U256::from(DEFAULT_GAS_PRICE_WEI))
            }
        }
    }

    async fn fixed_price(&self, client: &dyn ChainClient) -> GasPrice {
        if let Some(price) = self.policy.fixed_gas_price {
            return GasPrice::Legacy(price);
        }

        match client.get_gas_price().await {
            Ok(price) => GasPrice::Legacy(price),
            Err(e) => {
                warn!("Could not fetch gas price, using default: {}", e);
                GasPrice::Legacy(U256::from(DEFAULT_GAS_PRICE_WEI))
            }
        }
    }

    async fn estimate_limit(
        &self,
        client: &dyn ChainClient,
        sender: Address,
        destination: Address,
        amount_wei: U256,
    ) -> U256 {
        let floor = U256::from(MIN_TRANSFER_GAS);
        match client
            .estimate_gas_limit(sender, destination, amount_wei)
            .await
        {
            Ok(estimated) => {
                let buffered =
                    estimated.saturating_mul(U256::from(self.policy.limit_margin_percent)) / 100;
                buffered.max(floor)
            }
            Err(e) => {
                debug!("Gas estimation failed, using transfer minimum: {}", e);
                floor
            }
        }
    }
}
