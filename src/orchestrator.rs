//! Run orchestration across senders, repetitions and destination batches

use crate::addresses::AddressSource;
use crate::chain::ConfirmationTracker;
use crate::config::Settings;
use crate::events::{DispatchReport, ReportSink};
use crate::pacing::PacingScheduler;
use crate::tx::{DispatchOutcome, DispatchStatus, SenderAccount, TransactionDispatcher, TransferIntent};

use ethers::types::Address;
use ethers::utils::format_ether;
use futures::future::join_all;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Shape of a run, fixed before it starts
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub wallets_per_batch: usize,
    pub repetitions: u32,
    pub loop_forever: bool,
    pub concurrent_senders: bool,
    pub chain_id: u64,
    pub explorer_url: Option<String>,
}

impl RunPlan {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            wallets_per_batch: settings.run.wallets_per_batch,
            repetitions: settings.run.repetitions,
            loop_forever: settings.run.loop_forever,
            concurrent_senders: settings.run.concurrent_senders,
            chain_id: settings.network.chain_id,
            explorer_url: settings.network.explorer_url.clone(),
        }
    }
}

/// Outcome counts for a run (or one sender's share of it)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub intents: u64,
    pub sent: u64,
    pub confirmed: u64,
    pub send_failed: u64,
    pub confirm_timed_out: u64,
    pub cancelled: bool,
}

impl RunSummary {
    fn record(&mut self, status: DispatchStatus) {
        self.intents += 1;
        match status {
            DispatchStatus::Sent => self.sent += 1,
            DispatchStatus::Confirmed => self.confirmed += 1,
            DispatchStatus::SendFailed => self.send_failed += 1,
            DispatchStatus::ConfirmTimedOut => self.confirm_timed_out += 1,
        }
    }

    fn merge(&mut self, other: RunSummary) {
        self.intents += other.intents;
        self.sent += other.sent;
        self.confirmed += other.confirmed;
        self.send_failed += other.send_failed;
        self.confirm_timed_out += other.confirm_timed_out;
        self.cancelled |= other.cancelled;
    }

    /// Intents whose transfer reached the network
    pub fn broadcast(&self) -> u64 {
        self.sent + self.confirmed + self.confirm_timed_out
    }
}

/// Drives senders through their batches, one intent at a time per sender
pub struct RunOrchestrator {
    dispatcher: Arc<TransactionDispatcher>,
    tracker: Arc<ConfirmationTracker>,
    pacing: PacingScheduler,
    addresses: Arc<dyn AddressSource>,
    sink: Arc<dyn ReportSink>,
    plan: RunPlan,
    run_id: Uuid,
    sequence: AtomicU64,
}

impl RunOrchestrator {
    pub fn new(
        dispatcher: Arc<TransactionDispatcher>,
        tracker: Arc<ConfirmationTracker>,
        pacing: PacingScheduler,
        addresses: Arc<dyn AddressSource>,
        sink: Arc<dyn ReportSink>,
        plan: RunPlan,
    ) -> Self {
        Self {
            dispatcher,
            tracker,
            pacing,
            addresses,
            sink,
            plan,
            run_id: Uuid::new_v4(),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Run every sender's stream to completion or until `cancel` fires. Cancellation is
    /// honored between intents only.
    pub async fn run(&self, senders: &[SenderAccount], cancel: &CancellationToken) -> RunSummary {
        info!(
            run_id = %self.run_id,
            "Starting run: {} senders, {} repetitions of {} destinations{}",
            senders.len(),
            self.plan.repetitions,
            self.plan.wallets_per_batch,
            if self.plan.loop_forever { ", looping until interrupted" } else { "" }
        );

        let mut summary = RunSummary::default();

        if self.plan.concurrent_senders {
            let streams = senders.iter().map(|sender| self.run_sender(sender, cancel));
            for partial in join_all(streams).await {
                summary.merge(partial);
            }
        } else {
            for sender in senders {
                summary.merge(self.run_sender(sender, cancel).await);
                if cancel.is_cancelled() {
                    summary.cancelled = true;
                    break;
                }
            }
        }

        for sender in senders {
            if let Some(stats) = self.dispatcher.nonces().stats(sender.address()).await {
                debug!(
                    "Nonce state for {:?}: next {:?}, {} advances, {} seeds",
                    sender.address(),
                    stats.next,
                    stats.advances,
                    stats.seeds
                );
            }
        }

        info!(
            run_id = %self.run_id,
            "Run finished: {} intents, {} confirmed, {} sent, {} confirmation timeouts, {} failed{}",
            summary.intents,
            summary.confirmed,
            summary.sent,
            summary.confirm_timed_out,
            summary.send_failed,
            if summary.cancelled { " (cancelled)" } else { "" }
        );
        summary
    }

    async fn run_sender(&self, sender: &SenderAccount, cancel: &CancellationToken) -> RunSummary {
        let mut rng = StdRng::from_entropy();
        let mut summary = RunSummary::default();
        let mut pending_delay: Option<Duration> = None;
        let mut cycle = 0u64;

        'run: loop {
            cycle += 1;
            let before = summary.intents;

            for repetition in 1..=self.plan.repetitions {
                let batch = self.addresses.generate(self.plan.wallets_per_batch);
                info!(
                    "Sender {:?}: repetition {}/{} with {} destinations",
                    sender.address(),
                    repetition,
                    self.plan.repetitions,
                    batch.len()
                );
                for (i, destination) in batch.iter().enumerate() {
                    debug!("  destination {}: {:?}", i + 1, destination);
                }

                for destination in batch {
                    if let Some(delay) = pending_delay.take() {
                        if !self.pacing.pause(delay, cancel).await {
                            summary.cancelled = true;
                            break 'run;
                        }
                    }
                    if cancel.is_cancelled() {
                        summary.cancelled = true;
                        break 'run;
                    }

                    let outcome = self.process_intent(sender, destination, &mut rng).await;
                    summary.record(outcome.status);
                    pending_delay = Some(self.pacing.draw_delay(&mut rng));
                }
            }

            if !self.plan.loop_forever {
                break;
            }
            if summary.intents == before {
                warn!(
                    "Sender {:?} has nothing to dispatch per cycle; not looping",
                    sender.address()
                );
                break;
            }
            debug!("Sender {:?} completed cycle {}", sender.address(), cycle);
        }

        summary
    }

    async fn process_intent(
        &self,
        sender: &SenderAccount,
        destination: Address,
        rng: &mut StdRng,
    ) -> DispatchOutcome {
        let intent = TransferIntent {
            sender: sender.clone(),
            destination,
            amount_wei: self.pacing.draw_amount(rng),
            chain_id: self.plan.chain_id,
        };
        info!(
            "Sending {} ETH from {:?} to {:?}",
            format_ether(intent.amount_wei),
            sender.address(),
            destination
        );

        let mut outcome = self.dispatcher.dispatch(&intent).await;
        if let (DispatchStatus::Sent, Some(tx_hash)) = (outcome.status, outcome.tx_hash) {
            let confirmation = self.tracker.await_confirmation(tx_hash).await;
            outcome = outcome.with_confirmation(confirmation);
            if outcome.status == DispatchStatus::Confirmed {
                crate::metrics::record_transfer_confirmed(&format!("{:?}", sender.address()));
            }
        }

        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let report = DispatchReport::new(
            self.run_id,
            sequence,
            sender.address(),
            destination,
            intent.amount_wei,
            outcome.clone(),
            self.plan.explorer_url.as_deref(),
        );
        self.sink.report(&report);

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addresses::{RandomAddressSource, StaticAddressSource};
    use crate::testing::{account, FakeChain, FakeSigner};
    use crate::tx::{DispatchPolicy, FeeEstimator, FeePolicy, NonceSequencer};
    use ethers::types::U256;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::broadcast;

    struct CancelAfter {
        token: CancellationToken,
        after: usize,
        seen: AtomicUsize,
    }

    impl ReportSink for CancelAfter {
        fn report(&self, _report: &DispatchReport) {
            if self.seen.fetch_add(1, Ordering::SeqCst) + 1 >= self.after {
                self.token.cancel();
            }
        }
    }

    fn plan(wallets_per_batch: usize, repetitions: u32) -> RunPlan {
        RunPlan {
            wallets_per_batch,
            repetitions,
            loop_forever: false,
            concurrent_senders: false,
            chain_id: 1,
            explorer_url: Some("https://scan.example/tx/".to_string()),
        }
    }

    fn orchestrator(
        chain: Arc<FakeChain>,
        addresses: Arc<dyn AddressSource>,
        sink: Arc<dyn ReportSink>,
        plan: RunPlan,
    ) -> RunOrchestrator {
        let dispatcher = Arc::new(TransactionDispatcher::new(
            chain.clone(),
            Arc::new(NonceSequencer::new()),
            FeeEstimator::new(FeePolicy::default()),
            DispatchPolicy::default(),
        ));
        let tracker = Arc::new(ConfirmationTracker::new(
            chain.clone(),
            Duration::from_secs(6),
            Duration::from_secs(2),
        ));
        let pacing = PacingScheduler::new(
            U256::exp10(15),
            U256::exp10(16),
            Duration::from_secs(1),
            Duration::from_secs(3),
        )
        .unwrap();

        RunOrchestrator::new(dispatcher, tracker, pacing, addresses, sink, plan)
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_batches_allocate_nothing() {
        let chain = Arc::new(FakeChain::new(0));
        let (tx, _rx) = broadcast::channel(16);
        let run = orchestrator(chain.clone(), Arc::new(RandomAddressSource), Arc::new(tx), plan(0, 3));
        let signer = FakeSigner::new(Address::repeat_byte(1));

        let summary = run.run(&[account(&signer)], &CancellationToken::new()).await;

        assert_eq!(summary.intents, 0);
        assert_eq!(chain.submissions(), 0);
        assert_eq!(chain.nonce_queries(), 0);
        assert!(signer.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_intent_is_reported() {
        let chain = Arc::new(FakeChain::new(5));
        let (tx, mut rx) = broadcast::channel(64);
        let run = orchestrator(chain.clone(), Arc::new(RandomAddressSource), Arc::new(tx), plan(3, 2));
        let alice = FakeSigner::new(Address::repeat_byte(1));
        let bob = FakeSigner::new(Address::repeat_byte(2));

        let summary = run
            .run(&[account(&alice), account(&bob)], &CancellationToken::new())
            .await;

        assert_eq!(summary.intents, 12);
        assert_eq!(summary.confirmed, 12);
        assert!(!summary.cancelled);

        let mut sequences = HashSet::new();
        for _ in 0..12 {
            let report = rx.try_recv().unwrap();
            assert_eq!(report.run_id, run.run_id());
            assert_eq!(report.outcome.status, DispatchStatus::Confirmed);
            assert!(report.explorer_link.is_some());
            sequences.insert(report.sequence);
        }
        assert_eq!(sequences, (1..=12).collect::<HashSet<u64>>());
        assert_eq!(alice.nonces(), vec![5, 6, 7, 8, 9, 10]);
        assert_eq!(bob.nonces(), vec![5, 6, 7, 8, 9, 10]);
        assert_eq!(chain.balance_queries(), 12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_advances_match_broadcast_outcomes() {
        let chain = Arc::new(FakeChain::new(0).with_script(&[false, false, false, true]));
        let (tx, _rx) = broadcast::channel(16);
        let run = orchestrator(chain.clone(), Arc::new(RandomAddressSource), Arc::new(tx), plan(3, 1));
        let signer = FakeSigner::new(Address::repeat_byte(1));

        let summary = run.run(&[account(&signer)], &CancellationToken::new()).await;

        assert_eq!(summary.send_failed, 1);
        assert_eq!(summary.confirmed, 2);
        let stats = run
            .dispatcher
            .nonces()
            .stats(Address::repeat_byte(1))
            .await
            .unwrap();
        assert_eq!(stats.advances, summary.broadcast());
        assert_eq!(stats.next, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_sends_skip_confirmation_and_run_continues() {
        let chain = Arc::new(FakeChain::new(0).rejecting_all());
        let (tx, _rx) = broadcast::channel(16);
        let run = orchestrator(chain.clone(), Arc::new(RandomAddressSource), Arc::new(tx), plan(2, 1));
        let signer = FakeSigner::new(Address::repeat_byte(1));

        let summary = run.run(&[account(&signer)], &CancellationToken::new()).await;

        assert_eq!(summary.send_failed, 2);
        assert_eq!(chain.submissions(), 6);
        assert_eq!(chain.receipt_polls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfirmed_transfers_time_out() {
        let chain = Arc::new(FakeChain::new(0).without_receipts());
        let (tx, _rx) = broadcast::channel(16);
        let run = orchestrator(chain.clone(), Arc::new(RandomAddressSource), Arc::new(tx), plan(1, 1));
        let signer = FakeSigner::new(Address::repeat_byte(1));

        let summary = run.run(&[account(&signer)], &CancellationToken::new()).await;

        assert_eq!(summary.confirm_timed_out, 1);
        assert_eq!(chain.receipt_polls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_between_intents() {
        let chain = Arc::new(FakeChain::new(0));
        let token = CancellationToken::new();
        let sink = Arc::new(CancelAfter {
            token: token.clone(),
            after: 2,
            seen: AtomicUsize::new(0),
        });
        let run = orchestrator(chain.clone(), Arc::new(RandomAddressSource), sink, plan(5, 2));
        let alice = FakeSigner::new(Address::repeat_byte(1));
        let bob = FakeSigner::new(Address::repeat_byte(2));

        let summary = run.run(&[account(&alice), account(&bob)], &token).await;

        assert!(summary.cancelled);
        assert_eq!(summary.intents, 2);
        assert_eq!(chain.submissions(), 2);
        assert!(bob.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_forever_runs_until_cancelled() {
        let chain = Arc::new(FakeChain::new(0));
        let token = CancellationToken::new();
        let sink = Arc::new(CancelAfter {
            token: token.clone(),
            after: 7,
            seen: AtomicUsize::new(0),
        });
        let destinations = vec![Address::repeat_byte(0xaa), Address::repeat_byte(0xbb)];
        let mut looping = plan(2, 1);
        looping.loop_forever = true;
        let run = orchestrator(
            chain.clone(),
            Arc::new(StaticAddressSource::new(destinations)),
            sink,
            looping,
        );
        let signer = FakeSigner::new(Address::repeat_byte(1));

        let summary = run.run(&[account(&signer)], &token).await;

        assert!(summary.cancelled);
        assert_eq!(summary.intents, 7);
        assert_eq!(signer.nonces(), (0..7).collect::<Vec<u64>>());
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_forever_without_work_terminates() {
        let chain = Arc::new(FakeChain::new(0));
        let (tx, _rx) = broadcast::channel(16);
        let mut looping = plan(0, 1);
        looping.loop_forever = true;
        let run = orchestrator(chain, Arc::new(RandomAddressSource), Arc::new(tx), looping);
        let signer = FakeSigner::new(Address::repeat_byte(1));

        let summary = run.run(&[account(&signer)], &CancellationToken::new()).await;
        assert_eq!(summary, RunSummary::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_senders_keep_their_own_sequences() {
        let chain = Arc::new(FakeChain::new(100));
        let (tx, _rx) = broadcast::channel(64);
        let mut concurrent = plan(4, 1);
        concurrent.concurrent_senders = true;
        let run = orchestrator(chain.clone(), Arc::new(RandomAddressSource), Arc::new(tx), concurrent);
        let alice = FakeSigner::new(Address::repeat_byte(1));
        let bob = FakeSigner::new(Address::repeat_byte(2));

        let summary = run
            .run(&[account(&alice), account(&bob)], &CancellationToken::new())
            .await;

        assert_eq!(summary.confirmed, 8);
        assert_eq!(alice.nonces(), vec![100, 101, 102, 103]);
        assert_eq!(bob.nonces(), vec![100, 101, 102, 103]);
    }
}
