//! Configuration management for the transfer dispatcher
//!
//! Loads configuration from TOML files with environment variable substitution.
//! The loaded [`Settings`] are validated once and then handed to the components as
//! immutable values.

use anyhow::{Context, Result};
use ethers::types::Address;
use ethers::utils::parse_ether;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub network: NetworkConfig,
    pub wallet: WalletConfig,
    pub run: RunConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    pub rpc_urls: Vec<String>,
    pub chain_id: u64,
    /// Either a prefix the hash is appended to, or a template containing `{hash}`
    #[serde(default)]
    pub explorer_url: Option<String>,
    /// Continue even when the node reports a different chain ID
    #[serde(default)]
    pub allow_chain_id_mismatch: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    /// Environment variable holding comma-separated sender keys
    pub private_keys_env: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    pub wallets_per_batch: usize,
    pub repetitions: u32,
    #[serde(default)]
    pub loop_forever: bool,
    pub amount_min_eth: String,
    pub amount_max_eth: String,
    pub delay_min_minutes: f64,
    pub delay_max_minutes: f64,
    #[serde(default)]
    pub concurrent_senders: bool,
    /// Fixed destinations; when empty, fresh addresses are generated per batch
    #[serde(default)]
    pub destinations: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
    pub submit_timeout_secs: u64,
    pub fee_mode: FeeMode,
    pub legacy_transactions: bool,
    pub price_multiplier_percent: u64,
    pub limit_margin_percent: u64,
    pub escalation_percent: u64,
    pub fixed_gas_price_gwei: Option<f64>,
    pub fixed_gas_limit: u64,
    pub preflight_balance_check: bool,
    pub confirmation_timeout_secs: u64,
    pub confirmation_poll_interval_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_backoff_ms: 2_000,
            submit_timeout_secs: 30,
            fee_mode: FeeMode::Dynamic,
            legacy_transactions: false,
            price_multiplier_percent: 110,
            limit_margin_percent: 120,
            escalation_percent: 120,
            fixed_gas_price_gwei: None,
            fixed_gas_limit: 21_000,
            preflight_balance_check: true,
            confirmation_timeout_secs: 60,
            confirmation_poll_interval_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FeeMode {
    /// Query fee data and estimate the gas limit for every intent
    Dynamic,
    /// Use configured (or network legacy) gas settings unchanged
    Fixed,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9100,
        }
    }
}

impl Settings {
    /// Load settings from the file named by `DISPATCHER_CONFIG`
    pub fn load() -> Result<Self> {
        let config_path = env::var("DISPATCHER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from a specific file
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::from_toml(&config_str)
    }

    /// Parse and validate settings from TOML text
    pub fn from_toml(config_str: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.network.rpc_urls.is_empty() {
            anyhow::bail!("At least one RPC URL must be configured");
        }

        let dispatch = &self.dispatch;
        if dispatch.max_attempts == 0 {
            anyhow::bail!("dispatch.max_attempts must be at least 1");
        }
        if dispatch.price_multiplier_percent < 100 {
            anyhow::bail!("dispatch.price_multiplier_percent must be at least 100");
        }
        if dispatch.limit_margin_percent < 100 {
            anyhow::bail!("dispatch.limit_margin_percent must be at least 100");
        }
        if dispatch.escalation_percent <= 100 {
            anyhow::bail!("dispatch.escalation_percent must be greater than 100");
        }
        if dispatch.confirmation_poll_interval_ms == 0 {
            anyhow::bail!("dispatch.confirmation_poll_interval_ms must be positive");
        }
        if let Some(gwei) = dispatch.fixed_gas_price_gwei {
            if !gwei.is_finite() || gwei <= 0.0 {
                anyhow::bail!("dispatch.fixed_gas_price_gwei must be a positive number");
            }
        }

        let run = &self.run;
        let min = parse_ether(&run.amount_min_eth)
            .with_context(|| format!("Invalid run.amount_min_eth: {}", run.amount_min_eth))?;
        let max = parse_ether(&run.amount_max_eth)
            .with_context(|| format!("Invalid run.amount_max_eth: {}", run.amount_max_eth))?;
        if min > max {
            anyhow::bail!("run.amount_min_eth must not exceed run.amount_max_eth");
        }

        let (dmin, dmax) = (run.delay_min_minutes, run.delay_max_minutes);
        if !dmin.is_finite() || !dmax.is_finite() || dmin < 0.0 || dmin > dmax {
            anyhow::bail!("run delay range must satisfy 0 <= delay_min_minutes <= delay_max_minutes");
        }

        for destination in &run.destinations {
            destination
                .parse::<Address>()
                .with_context(|| format!("Invalid destination address: {}", destination))?;
        }

        if run.wallets_per_batch == 0 {
            tracing::warn!("run.wallets_per_batch is 0 - batches will be empty");
        }

        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    lazy_static::lazy_static! {
        static ref ENV_VAR: regex::Regex =
            regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("static regex");
    }

    let mut result = input.to_string();
    for cap in ENV_VAR.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
        [network]
        rpc_urls = ["http://localhost:8545"]
        chain_id = 1868
        explorer_url = "https://explorer.example/tx/"

        [wallet]
        private_keys_env = "DISPATCH_PRIVATE_KEYS"

        [run]
        wallets_per_batch = 5
        repetitions = 2
        amount_min_eth = "0.001"
        amount_max_eth = "0.01"
        delay_min_minutes = 0.5
        delay_max_minutes = 2.0
    "#;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("DISPATCH_TEST_VAR", "test_value");
        let input = "url = \"https://rpc.example.com/${DISPATCH_TEST_VAR}/endpoint\"";
        let result = substitute_env_vars(input);
        assert_eq!(result, "url = \"https://rpc.example.com/test_value/endpoint\"");
    }

    #[test]
    fn test_defaults_fill_dispatch_section() {
        let settings = Settings::from_toml(SAMPLE).unwrap();
        assert_eq!(settings.dispatch.max_attempts, 3);
        assert_eq!(settings.dispatch.retry_backoff_ms, 2_000);
        assert_eq!(settings.dispatch.fee_mode, FeeMode::Dynamic);
        assert_eq!(settings.dispatch.confirmation_timeout_secs, 60);
        assert!(!settings.run.loop_forever);
        assert!(!settings.metrics.enabled);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", SAMPLE).unwrap();
        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.network.chain_id, 1868);
        assert_eq!(settings.run.wallets_per_batch, 5);
    }

    #[test]
    fn test_rejects_inverted_amount_range() {
        let input = SAMPLE.replace("\"0.001\"", "\"0.5\"");
        assert!(Settings::from_toml(&input).is_err());
    }

    #[test]
    fn test_rejects_non_escalating_retry() {
        let input = format!("{}\n[dispatch]\nescalation_percent = 100\n", SAMPLE);
        assert!(Settings::from_toml(&input).is_err());
    }
}
