//! Transfer Dispatcher - paced native-asset transfers from operator accounts
//!
//! Sends randomized amounts from each configured sender to batches of destination
//! addresses, with per-sender nonce sequencing, adaptive fees, bounded retries and
//! best-effort confirmation tracking.

use anyhow::{bail, Context, Result};
use ethers::types::Address;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod addresses;
mod chain;
mod config;
mod error;
mod events;
mod metrics;
mod orchestrator;
mod pacing;
mod tx;

#[cfg(test)]
mod testing;

use addresses::{AddressSource, RandomAddressSource, StaticAddressSource};
use chain::{ChainClient, ConfirmationTracker, EthersChainClient};
use config::Settings;
use events::TracingReporter;
use metrics::MetricsServer;
use orchestrator::{RunOrchestrator, RunPlan};
use pacing::PacingScheduler;
use tx::{
    DispatchPolicy, FeeEstimator, FeePolicy, NonceSequencer, SenderAccount, TransactionDispatcher,
    TransferSigner, WalletSigner,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting Transfer Dispatcher v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration: {} RPC endpoints, chain {}",
        settings.network.rpc_urls.len(),
        settings.network.chain_id
    );

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Connect to the network
    let client = Arc::new(
        EthersChainClient::connect(&settings.network)
            .await
            .context("RPC endpoint unreachable")?,
    );
    let chain_id = verify_chain_id(client.as_ref(), &settings).await?;

    let senders = load_senders(&settings.wallet.private_keys_env, chain_id)?;
    info!("Loaded {} sender accounts", senders.len());

    // Assemble the dispatch engine
    let client: Arc<dyn ChainClient> = client;
    let dispatcher = Arc::new(TransactionDispatcher::new(
        client.clone(),
        Arc::new(NonceSequencer::new()),
        FeeEstimator::new(FeePolicy::from(&settings.dispatch)),
        DispatchPolicy::from(&settings.dispatch),
    ));
    let tracker = Arc::new(ConfirmationTracker::new(
        client,
        Duration::from_secs(settings.dispatch.confirmation_timeout_secs),
        Duration::from_millis(settings.dispatch.confirmation_poll_interval_ms),
    ));
    let pacing = PacingScheduler::from_run_config(&settings.run)?;
    let addresses = address_source(&settings)?;

    let mut plan = RunPlan::from_settings(&settings);
    plan.chain_id = chain_id;

    let orchestrator = RunOrchestrator::new(
        dispatcher,
        tracker,
        pacing,
        addresses,
        Arc::new(TracingReporter),
        plan,
    );

    // Stop between intents on interrupt
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            info!("Shutdown signal received, finishing current transfer...");
            cancel.cancel();
        }
    });

    info!("Transfer Dispatcher is running (run {})", orchestrator.run_id());
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    let summary = orchestrator.run(&senders, &cancel).await;

    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!(
        "Transfer Dispatcher stopped: {} of {} transfers broadcast",
        summary.broadcast(),
        summary.intents
    );
    Ok(())
}

/// Compare the node's chain ID with the configured one. Returns the ID to sign with.
async fn verify_chain_id(client: &dyn ChainClient, settings: &Settings) -> Result<u64> {
    let expected = settings.network.chain_id;
    let actual = client.get_chain_id().await?;

    if actual == expected {
        info!("Connected to chain {}", actual);
        return Ok(actual);
    }

    if !settings.network.allow_chain_id_mismatch {
        bail!(error::DispatchError::ChainIdMismatch { expected, actual });
    }

    warn!(
        "Node reports chain ID {} but {} is configured; continuing with {}",
        actual, expected, actual
    );
    Ok(actual)
}

/// Build sender accounts from the comma-separated keys in `env_var`
fn load_senders(env_var: &str, chain_id: u64) -> Result<Vec<SenderAccount>> {
    let keys = std::env::var(env_var)
        .with_context(|| format!("Sender keys not found in ${}", env_var))?;

    let senders = keys
        .split(',')
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(|key| -> Result<SenderAccount> {
            let signer: Arc<dyn TransferSigner> =
                Arc::new(WalletSigner::from_key(key, chain_id)?);
            Ok(SenderAccount::new(signer))
        })
        .collect::<Result<Vec<_>>>()?;

    if senders.is_empty() {
        bail!("No sender keys in ${}", env_var);
    }
    Ok(senders)
}

fn address_source(settings: &Settings) -> Result<Arc<dyn AddressSource>> {
    if settings.run.destinations.is_empty() {
        return Ok(Arc::new(RandomAddressSource));
    }

    let destinations = settings
        .run
        .destinations
        .iter()
        .map(|d| d.parse::<Address>().with_context(|| format!("Invalid destination: {}", d)))
        .collect::<Result<Vec<_>>>()?;
    Ok(Arc::new(StaticAddressSource::new(destinations)))
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,transfer_dispatcher=debug,hyper=warn"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
