//! Randomized pacing: transfer amounts and inter-transfer delays
//!
//! Amounts and delays are drawn independently per intent, uniformly from inclusive
//! ranges. The delay is a plain scheduling gap; the only thing that may cut it short is
//! run cancellation, since no work is in flight while it elapses.

use crate::config::RunConfig;
use crate::error::{DispatchError, DispatchResult};

use ethers::types::U256;
use ethers::utils::parse_ether;
use rand::Rng;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Draws per-intent amount and delay
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PacingScheduler {
    min_amount_wei: u128,
    max_amount_wei: u128,
    min_delay_secs: f64,
    max_delay_secs: f64,
}

impl PacingScheduler {
    pub fn new(
        min_amount_wei: U256,
        max_amount_wei: U256,
        min_delay: Duration,
        max_delay: Duration,
    ) -> DispatchResult<Self> {
        let limit = U256::from(u128::MAX);
        if min_amount_wei > max_amount_wei {
            return Err(DispatchError::Config(
                "minimum amount exceeds maximum amount".to_string(),
            ));
        }
        if max_amount_wei > limit {
            return Err(DispatchError::Config("maximum amount too large".to_string()));
        }
        if min_delay > max_delay {
            return Err(DispatchError::Config(
                "minimum delay exceeds maximum delay".to_string(),
            ));
        }

        Ok(Self {
            min_amount_wei: min_amount_wei.as_u128(),
            max_amount_wei: max_amount_wei.as_u128(),
            min_delay_secs: min_delay.as_secs_f64(),
            max_delay_secs: max_delay.as_secs_f64(),
        })
    }

    /// Build from the run section (amounts in ether, delays in minutes)
    pub fn from_run_config(run: &RunConfig) -> DispatchResult<Self> {
        let min = parse_ether(&run.amount_min_eth)
            .map_err(|e| DispatchError::Config(format!("Invalid minimum amount: {}", e)))?;
        let max = parse_ether(&run.amount_max_eth)
            .map_err(|e| DispatchError::Config(format!("Invalid maximum amount: {}", e)))?;

        Self::new(
            min,
            max,
            minutes(run.delay_min_minutes)?,
            minutes(run.delay_max_minutes)?,
        )
    }

    pub fn draw_amount<R: Rng + ?Sized>(&self, rng: &mut R) -> U256 {
        U256::from(rng.gen_range(self.min_amount_wei..=self.max_amount_wei))
    }

    pub fn draw_delay<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        if self.max_delay_secs <= self.min_delay_secs {
            return Duration::from_secs_f64(self.min_delay_secs);
        }
        Duration::from_secs_f64(rng.gen_range(self.min_delay_secs..=self.max_delay_secs))
    }

    /// Wait out `delay` unless the run is cancelled first. Returns `false` on cancellation.
    pub async fn pause(&self, delay: Duration, cancel: &CancellationToken) -> bool {
        debug!(
            "Next transfer in approximately {:.2} minutes",
            delay.as_secs_f64() / 60.0
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = cancel.cancelled() => false,
        }
    }
}

fn minutes(value: f64) -> DispatchResult<Duration> {
    if !value.is_finite() || value < 0.0 {
        return Err(DispatchError::Config(format!("Invalid delay: {} minutes", value)));
    }
    Ok(Duration::from_secs_f64(value * 60.0))
}
