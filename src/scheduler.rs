//! Slot Ingestion Scheduler
//!
//! Turns observed slots into fetched and processed blocks and advances the
//! durable checkpoint.
//!
//! ```text
//!   observe(slot) ──► fetch ──► process queue ──► workers (≤ N) ──► detector
//!                       │                               │
//!                       └─ skipped/pruned ──┐           │
//!                                           ▼           ▼
//!                                  processed set ──► contiguous checkpoint advance
//! ```
//!
//! Fetches and processing complete out of order. The checkpoint only moves
//! across an unbroken run of finished slots, so it never passes a slot that
//! has not been handled. A slot stays in the in-flight set from the moment it
//! is claimed until it is marked finished, which keeps it to one fetch at a
//! time even while a fetch is waiting to be retried.
//!
//! Observing a slot far ahead of the checkpoint records the whole range as
//! backlog, but only up to `max_in_flight_slots` of it is claimed at once.
//! The rest is claimed in order as earlier slots finish.
//!
//! All mutable state sits behind one mutex that is never held across an
//! await point.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{Notify, Semaphore};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::detector::OutflowDetector;
use crate::ledger::{Commitment, LedgerClient, LedgerError};
use crate::types::{Block, Slot};

/// Delay before a failed block fetch is retried
pub const FETCH_RETRY_DELAY_MS: u64 = 500;

/// Delay before a block whose processing failed is queued again
pub const PROCESS_RETRY_DELAY_MS: u64 = 1000;

/// Default bound on concurrently processed blocks
pub const DEFAULT_PROCESS_CONCURRENCY: usize = 8;

/// Default bound on outstanding block fetches
pub const DEFAULT_FETCH_CONCURRENCY: usize = 16;

/// Default bound on slots claimed but not yet finished
pub const DEFAULT_MAX_IN_FLIGHT_SLOTS: usize = 1024;

/// Default catch-up window; 0 keeps every slot after the checkpoint
pub const DEFAULT_MAX_CATCHUP_SLOTS: u64 = 0;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub process_concurrency: usize,
    pub fetch_concurrency: usize,
    pub max_in_flight_slots: usize,
    /// How far the checkpoint may trail an observed slot before the range
    /// in between is given up. 0 disables the window.
    pub max_catchup_slots: u64,
    pub fetch_retry_delay: Duration,
    pub process_retry_delay: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            process_concurrency: DEFAULT_PROCESS_CONCURRENCY,
            fetch_concurrency: DEFAULT_FETCH_CONCURRENCY,
            max_in_flight_slots: DEFAULT_MAX_IN_FLIGHT_SLOTS,
            max_catchup_slots: DEFAULT_MAX_CATCHUP_SLOTS,
            fetch_retry_delay: Duration::from_millis(FETCH_RETRY_DELAY_MS),
            process_retry_delay: Duration::from_millis(PROCESS_RETRY_DELAY_MS),
        }
    }
}

/// How a slot finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotOutcome {
    Processed,
    /// No block exists for the slot
    Skipped,
}

#[derive(Debug, Clone)]
struct PendingBlock {
    slot: Slot,
    block: Arc<Block>,
}

/// Result of claiming slots for fetching
#[derive(Debug, Default, PartialEq)]
pub struct Claim {
    /// Slots to fetch, ascending
    pub slots: Vec<Slot>,
    /// Range given up because it fell outside the catch-up window
    pub abandoned: Option<(Slot, Slot)>,
}

/// A move of the checkpoint across finished slots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Advance {
    pub checkpoint: Slot,
    pub processed: u64,
    pub skipped: u64,
}

/// Bookkeeping shared by fetches and workers
#[derive(Debug, Default)]
pub struct SchedulerState {
    checkpoint: Slot,
    /// Highest slot observed so far
    target: Slot,
    /// Lowest backlog slot not yet claimed
    next_unclaimed: Slot,
    in_flight: HashSet<Slot>,
    finished: BTreeMap<Slot, SlotOutcome>,
    queue: VecDeque<PendingBlock>,
    active_workers: usize,
}

impl SchedulerState {
    pub fn new(checkpoint: Slot) -> Self {
        Self {
            checkpoint,
            target: checkpoint,
            next_unclaimed: checkpoint.saturating_add(1),
            ..Default::default()
        }
    }

    pub fn checkpoint(&self) -> Slot {
        self.checkpoint
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Observed slots not yet claimed
    pub fn backlog(&self) -> u64 {
        self.target.saturating_add(1).saturating_sub(self.next_unclaimed)
    }

    pub fn is_finished(&self, slot: Slot) -> bool {
        self.finished.contains_key(&slot)
    }

    fn eligible(&self, slot: Slot) -> bool {
        slot > self.checkpoint
            && !self.in_flight.contains(&slot)
            && !self.finished.contains_key(&slot)
    }

    /// Record `slot`, and every unobserved slot below it, as backlog and
    /// claim from the backlog while fewer than `max_in_flight` are in flight
    pub fn claim(&mut self, slot: Slot, max_catchup: Slot, max_in_flight: usize) -> Claim {
        let mut claim = Claim::default();

        if max_catchup > 0 && slot.saturating_sub(self.checkpoint) > max_catchup {
            let skip_to = slot - max_catchup;
            claim.abandoned = Some((self.checkpoint + 1, skip_to));
            self.checkpoint = skip_to;
            self.finished.retain(|s, _| *s > skip_to);
            self.next_unclaimed = self.next_unclaimed.max(skip_to + 1);
        }

        if slot < self.next_unclaimed {
            if self.eligible(slot) {
                self.in_flight.insert(slot);
                claim.slots.push(slot);
            }
        } else {
            self.target = self.target.max(slot);
        }
        claim.slots.extend(self.refill(max_in_flight));
        claim
    }

    /// Claim backlog slots, in order, up to `max_in_flight` in flight
    pub fn refill(&mut self, max_in_flight: usize) -> Vec<Slot> {
        let mut slots = Vec::new();
        while self.next_unclaimed <= self.target && self.in_flight.len() < max_in_flight.max(1) {
            let slot = self.next_unclaimed;
            self.next_unclaimed += 1;
            if self.eligible(slot) {
                self.in_flight.insert(slot);
                slots.push(slot);
            }
        }
        slots
    }

    /// Forget the unclaimed backlog
    ///
    /// # Returns
    /// The number of slots dropped
    pub fn drop_backlog(&mut self) -> u64 {
        let dropped = self.backlog();
        self.target = self.next_unclaimed.saturating_sub(1);
        dropped
    }

    /// Record that `slot` finished
    ///
    /// # Returns
    /// `false` if the slot was already behind the checkpoint or already marked
    pub fn mark(&mut self, slot: Slot, outcome: SlotOutcome) -> bool {
        self.in_flight.remove(&slot);
        if slot <= self.checkpoint || self.finished.contains_key(&slot) {
            return false;
        }
        self.finished.insert(slot, outcome);
        true
    }

    /// Move the checkpoint across the contiguous run of finished slots
    ///
    /// # Returns
    /// The new checkpoint, with how the slots it passed finished, if it moved
    pub fn advance_checkpoint(&mut self) -> Option<Advance> {
        let mut advance = Advance {
            checkpoint: self.checkpoint,
            processed: 0,
            skipped: 0,
        };
        while let Some(outcome) = self.finished.remove(&(advance.checkpoint + 1)) {
            advance.checkpoint += 1;
            match outcome {
                SlotOutcome::Processed => advance.processed += 1,
                SlotOutcome::Skipped => advance.skipped += 1,
            }
        }
        if advance.checkpoint == self.checkpoint {
            return None;
        }
        self.checkpoint = advance.checkpoint;
        Some(advance)
    }

    /// Nothing observed but unclaimed, claimed, queued or processing
    pub fn is_idle(&self) -> bool {
        self.in_flight.is_empty()
            && self.queue.is_empty()
            && self.active_workers == 0
            && self.backlog() == 0
    }
}

struct Inner {
    ledger: Arc<dyn LedgerClient>,
    detector: Arc<OutflowDetector>,
    checkpoints: Arc<CheckpointStore>,
    labels: Vec<String>,
    config: SchedulerConfig,
    state: Mutex<SchedulerState>,
    fetch_permits: Semaphore,
    shutdown: AtomicBool,
    idle: Notify,
}

/// Block-mode ingestion pipeline
#[derive(Clone)]
pub struct SlotScheduler {
    inner: Arc<Inner>,
}

impl SlotScheduler {
    /// Create a scheduler whose checkpoint starts at `checkpoint`
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        detector: Arc<OutflowDetector>,
        checkpoints: Arc<CheckpointStore>,
        config: SchedulerConfig,
        checkpoint: Slot,
    ) -> Self {
        let labels = detector.labels();
        let fetch_permits = Semaphore::new(config.fetch_concurrency.max(1));
        Self {
            inner: Arc::new(Inner {
                ledger,
                detector,
                checkpoints,
                labels,
                config,
                state: Mutex::new(SchedulerState::new(checkpoint)),
                fetch_permits,
                shutdown: AtomicBool::new(false),
                idle: Notify::new(),
            }),
        }
    }

    /// Create a scheduler resuming from the stored checkpoint
    ///
    /// Resumes from the lowest checkpoint of all watched labels when every
    /// label has one, otherwise from the current finalized tip.
    pub async fn resume(
        ledger: Arc<dyn LedgerClient>,
        detector: Arc<OutflowDetector>,
        checkpoints: Arc<CheckpointStore>,
        config: SchedulerConfig,
    ) -> Result<Self, LedgerError> {
        let labels = detector.labels();
        let checkpoint = match checkpoints.resume_point(&labels) {
            Some(slot) => {
                info!(slot, "resuming from checkpoint");
                slot
            }
            None => {
                let tip = ledger.current_slot(Commitment::Finalized).await?;
                info!(tip, "no checkpoint for every label, starting from tip");
                tip.saturating_sub(1)
            }
        };
        Ok(Self::new(ledger, detector, checkpoints, config, checkpoint))
    }

    fn state(&self) -> MutexGuard<'_, SchedulerState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn checkpoint(&self) -> Slot {
        self.state().checkpoint()
    }

    pub fn in_flight(&self) -> usize {
        self.state().in_flight()
    }

    pub fn is_idle(&self) -> bool {
        self.state().is_idle()
    }

    /// Stop accepting new slots; claimed work runs to completion
    ///
    /// Backlog that was observed but not yet claimed is dropped.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        let idle = {
            let mut state = self.state();
            let dropped = state.drop_backlog();
            if dropped > 0 {
                info!(dropped, checkpoint = state.checkpoint(), "dropping unclaimed backlog");
            }
            state.is_idle()
        };
        if idle {
            self.inner.idle.notify_waiters();
        }
    }

    /// Resolves once no slot is waiting in the backlog, claimed, queued or processing
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Schedule `slot`, and any unobserved slots before it, for fetching
    ///
    /// Slots at or behind the checkpoint, in flight, or already finished are
    /// ignored, so repeated calls are harmless.
    pub fn observe(&self, slot: Slot) {
        let claimed = {
            let mut state = self.state();
            if self.inner.shutdown.load(Ordering::SeqCst) {
                return;
            }
            let config = &self.inner.config;
            let claim = state.claim(slot, config.max_catchup_slots, config.max_in_flight_slots);
            if let Some((from, to)) = claim.abandoned {
                warn!(from, to, observed = slot, "too far behind, skipping slot range");
                let checkpoint = state
                    .advance_checkpoint()
                    .map_or(state.checkpoint(), |advance| advance.checkpoint);
                self.persist(checkpoint);
            }
            claim.slots
        };

        self.spawn_fetches(claimed);
    }

    fn spawn_fetches(&self, slots: Vec<Slot>) {
        for slot in slots {
            debug!(slot, "fetch scheduled");
            tokio::spawn(self.clone().fetch(slot));
        }
    }

    async fn fetch(self, slot: Slot) {
        loop {
            let result = {
                let Ok(_permit) = self.inner.fetch_permits.acquire().await else {
                    return;
                };
                self.inner.ledger.get_block(slot).await
            };

            match result {
                Ok(Some(block)) => {
                    debug!(slot, transactions = block.transactions.len(), "block fetched");
                    self.enqueue(PendingBlock {
                        slot,
                        block: Arc::new(block),
                    });
                    return;
                }
                Ok(None) => {
                    debug!(slot, "slot skipped or pruned");
                    self.finish(slot, SlotOutcome::Skipped);
                    return;
                }
                Err(e) => {
                    warn!(slot, error = %e, transient = e.is_transient(), "block fetch failed, retrying");
                    sleep(self.inner.config.fetch_retry_delay).await;
                }
            }
        }
    }

    fn enqueue(&self, item: PendingBlock) {
        self.state().queue.push_back(item);
        self.start_workers();
    }

    fn start_workers(&self) {
        let mut state = self.state();
        while state.active_workers < self.inner.config.process_concurrency.max(1) {
            let Some(item) = state.queue.pop_front() else {
                break;
            };
            state.active_workers += 1;
            tokio::spawn(self.clone().process(item));
        }
    }

    async fn process(self, item: PendingBlock) {
        let detector = self.inner.detector.clone();
        let block = item.block.clone();
        let result = tokio::spawn(async move { detector.process_block(&block).await }).await;

        self.state().active_workers -= 1;

        match result {
            Ok(alerts) => {
                debug!(slot = item.slot, alerts, "slot processed");
                self.finish(item.slot, SlotOutcome::Processed);
            }
            Err(e) => {
                error!(slot = item.slot, error = %e, "slot processing failed, requeueing");
                let this = self.clone();
                tokio::spawn(async move {
                    sleep(this.inner.config.process_retry_delay).await;
                    this.enqueue(item);
                });
            }
        }
        self.start_workers();
    }

    fn finish(&self, slot: Slot, outcome: SlotOutcome) {
        let (claimed, idle) = {
            let mut state = self.state();
            if !state.mark(slot, outcome) {
                debug!(slot, "slot already finished");
            }
            if let Some(advance) = state.advance_checkpoint() {
                debug!(
                    checkpoint = advance.checkpoint,
                    processed = advance.processed,
                    skipped = advance.skipped,
                    "checkpoint advanced"
                );
                self.persist(advance.checkpoint);
            }
            let claimed = state.refill(self.inner.config.max_in_flight_slots);
            (claimed, state.is_idle())
        };
        self.spawn_fetches(claimed);
        if idle {
            self.inner.idle.notify_waiters();
        }
    }

    /// Raise every label to the checkpoint; called with the state lock held
    ///
    /// A label already stored past it, e.g. by log mode, keeps its value.
    fn persist(&self, checkpoint: Slot) {
        if let Err(e) = self.inner.checkpoints.advance_all(&self.inner.labels, checkpoint) {
            warn!(checkpoint, error = %e, "failed to persist checkpoint");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::parse_ranges;
    use crate::ledger::MockLedgerClient;
    use crate::publisher::{AlertDispatcher, LogSink};
    use crate::types::WatchedAddress;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    // ==================== SchedulerState tests ====================

    const UNBOUNDED: usize = usize::MAX;

    #[test]
    fn test_advance_stops_at_gap() {
        let mut state = SchedulerState::new(4);
        state.in_flight.extend([5, 6, 7]);
        assert!(state.mark(5, SlotOutcome::Processed));
        assert!(state.mark(7, SlotOutcome::Processed));

        assert_eq!(state.advance_checkpoint().map(|a| a.checkpoint), Some(5));
        assert_eq!(state.checkpoint(), 5);
        assert!(state.is_finished(7));

        assert!(state.mark(6, SlotOutcome::Skipped));
        assert_eq!(
            state.advance_checkpoint(),
            Some(Advance {
                checkpoint: 7,
                processed: 1,
                skipped: 1,
            })
        );
        assert!(!state.is_finished(7));
        assert_eq!(state.advance_checkpoint(), None);
    }

    #[test]
    fn test_mark_at_most_once() {
        let mut state = SchedulerState::new(0);
        assert!(state.mark(3, SlotOutcome::Processed));
        assert!(!state.mark(3, SlotOutcome::Processed));
        assert!(!SchedulerState::new(10).mark(10, SlotOutcome::Processed));
    }

    #[test]
    fn test_claim_fills_gaps_from_highest_observed() {
        let mut state = SchedulerState::new(100);
        assert_eq!(state.claim(103, 0, UNBOUNDED).slots, vec![101, 102, 103]);
        assert_eq!(state.claim(105, 0, UNBOUNDED).slots, vec![104, 105]);
        assert_eq!(state.in_flight(), 5);
    }

    #[test]
    fn test_claim_is_idempotent() {
        let mut state = SchedulerState::new(100);
        assert_eq!(state.claim(101, 0, UNBOUNDED).slots, vec![101]);
        assert!(state.claim(101, 0, UNBOUNDED).slots.is_empty());
        assert!(state.claim(100, 0, UNBOUNDED).slots.is_empty());
        assert!(state.claim(50, 0, UNBOUNDED).slots.is_empty());
    }

    #[test]
    fn test_claim_reclaims_nothing_already_finished() {
        let mut state = SchedulerState::new(100);
        state.claim(102, 0, UNBOUNDED);
        state.mark(102, SlotOutcome::Processed);
        assert!(state.claim(102, 0, UNBOUNDED).slots.is_empty());
    }

    #[test]
    fn test_claim_beyond_catchup_window_abandons_range() {
        let mut state = SchedulerState::new(100);
        let claim = state.claim(1_000, 10, UNBOUNDED);
        assert_eq!(claim.abandoned, Some((101, 990)));
        assert_eq!(claim.slots, (991..=1_000).collect::<Vec<_>>());
        assert_eq!(state.checkpoint(), 990);
    }

    #[test]
    fn test_claim_without_window_keeps_every_slot() {
        let mut state = SchedulerState::new(100);
        let claim = state.claim(1_000_000, DEFAULT_MAX_CATCHUP_SLOTS, 4);
        assert_eq!(claim.abandoned, None);
        assert_eq!(claim.slots, vec![101, 102, 103, 104]);
        assert_eq!(state.checkpoint(), 100);
        assert_eq!(state.backlog(), 1_000_000 - 104);
    }

    #[test]
    fn test_backlog_is_claimed_as_slots_finish() {
        let mut state = SchedulerState::new(0);
        assert_eq!(state.claim(10, 0, 3).slots, vec![1, 2, 3]);
        assert!(state.claim(12, 0, 3).slots.is_empty());
        assert!(state.refill(3).is_empty());

        state.mark(2, SlotOutcome::Processed);
        assert_eq!(state.refill(3), vec![4]);
        state.mark(1, SlotOutcome::Skipped);
        state.mark(3, SlotOutcome::Processed);
        assert_eq!(state.refill(3), vec![5, 6]);
        assert_eq!(state.advance_checkpoint().map(|a| a.checkpoint), Some(3));
        assert_eq!(state.backlog(), 6);
    }

    #[test]
    fn test_drop_backlog() {
        let mut state = SchedulerState::new(0);
        assert_eq!(state.claim(10, 0, 2).slots, vec![1, 2]);
        assert_eq!(state.drop_backlog(), 8);
        assert!(!state.is_idle());

        state.mark(1, SlotOutcome::Processed);
        state.mark(2, SlotOutcome::Processed);
        assert!(state.refill(2).is_empty());
        assert!(state.is_idle());
    }

    #[test]
    fn test_idle_tracking() {
        let mut state = SchedulerState::new(0);
        assert!(state.is_idle());
        state.claim(1, 0, UNBOUNDED);
        assert!(!state.is_idle());
        state.mark(1, SlotOutcome::Skipped);
        assert!(state.is_idle());
    }

    // ==================== SlotScheduler tests ====================

    const HOT: &str = "9WzDXwBbmkg8ZTbNMqUxvQRAyrZzDsGYdLVL9zYtAWWM";

    fn detector() -> Arc<OutflowDetector> {
        let dispatcher = Arc::new(AlertDispatcher::new(vec![Arc::new(LogSink)]));
        Arc::new(OutflowDetector::new(
            vec![WatchedAddress {
                label: "hot".to_string(),
                address: HOT.to_string(),
                ranges: parse_ranges("1-5"),
            }],
            dispatcher,
            false,
        ))
    }

    fn test_config() -> SchedulerConfig {
        SchedulerConfig {
            fetch_retry_delay: Duration::from_millis(5),
            process_retry_delay: Duration::from_millis(5),
            ..Default::default()
        }
    }

    fn scheduler_with_store(
        ledger: MockLedgerClient,
        store: CheckpointStore,
        checkpoint: Slot,
    ) -> SlotScheduler {
        SlotScheduler::new(
            Arc::new(ledger),
            detector(),
            Arc::new(store),
            test_config(),
            checkpoint,
        )
    }

    fn scheduler(ledger: MockLedgerClient, checkpoint: Slot) -> (SlotScheduler, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(dir.path().join("cp.json").to_str().unwrap());
        (scheduler_with_store(ledger, store, checkpoint), dir)
    }

    fn empty_block(slot: Slot) -> Block {
        Block {
            slot,
            transactions: vec![],
        }
    }

    #[tokio::test]
    async fn test_concurrent_observe_fetches_once() {
        let mut ledger = MockLedgerClient::new();
        ledger
            .expect_get_block()
            .withf(|slot| *slot == 11)
            .times(1)
            .returning(|slot| Ok(Some(empty_block(slot))));

        let (scheduler, _dir) = scheduler(ledger, 10);
        scheduler.observe(11);
        scheduler.observe(11);
        scheduler.wait_idle().await;
        assert_eq!(scheduler.checkpoint(), 11);
    }

    #[tokio::test]
    async fn test_skipped_slots_advance_checkpoint() {
        let mut ledger = MockLedgerClient::new();
        ledger
            .expect_get_block()
            .times(3)
            .returning(|slot| if slot == 22 { Ok(None) } else { Ok(Some(empty_block(slot))) });

        let (scheduler, dir) = scheduler(ledger, 20);
        scheduler.observe(23);
        scheduler.wait_idle().await;
        assert_eq!(scheduler.checkpoint(), 23);

        let reopened = CheckpointStore::open(dir.path().join("cp.json").to_str().unwrap());
        assert_eq!(reopened.get("hot"), Some(23));
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let failures = Arc::new(AtomicUsize::new(0));
        let counter = failures.clone();
        let mut ledger = MockLedgerClient::new();
        ledger.expect_get_block().returning(move |slot| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(LedgerError::RateLimited)
            } else {
                Ok(Some(empty_block(slot)))
            }
        });

        let (scheduler, _dir) = scheduler(ledger, 0);
        scheduler.observe(1);
        scheduler.wait_idle().await;
        assert_eq!(failures.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.checkpoint(), 1);
    }

    #[tokio::test]
    async fn test_observe_after_shutdown_is_ignored() {
        let mut ledger = MockLedgerClient::new();
        ledger.expect_get_block().never();

        let (scheduler, _dir) = scheduler(ledger, 0);
        scheduler.shutdown();
        scheduler.observe(5);
        assert!(scheduler.is_idle());
        assert_eq!(scheduler.checkpoint(), 0);
    }

    #[tokio::test]
    async fn test_resume_from_tip_without_checkpoint() {
        let mut ledger = MockLedgerClient::new();
        ledger
            .expect_current_slot()
            .withf(|c| *c == Commitment::Finalized)
            .returning(|_| Ok(500));

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CheckpointStore::open(dir.path().join("cp.json").to_str().unwrap()));
        let scheduler = SlotScheduler::resume(
            Arc::new(ledger),
            detector(),
            store,
            SchedulerConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(scheduler.checkpoint(), 499);
    }

    #[tokio::test]
    async fn test_resume_from_stored_checkpoint() {
        let mut ledger = MockLedgerClient::new();
        ledger.expect_current_slot().never();

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CheckpointStore::open(dir.path().join("cp.json").to_str().unwrap()));
        store.save("hot", 1234).unwrap();

        let scheduler = SlotScheduler::resume(
            Arc::new(ledger),
            detector(),
            store,
            SchedulerConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(scheduler.checkpoint(), 1234);
    }

    #[tokio::test]
    async fn test_default_config_fetches_every_slot_from_checkpoint() {
        let fetched = Arc::new(Mutex::new(HashSet::new()));
        let calls = Arc::new(AtomicUsize::new(0));
        let (seen, counter) = (fetched.clone(), calls.clone());
        let mut ledger = MockLedgerClient::new();
        ledger.expect_current_slot().never();
        ledger.expect_get_block().returning(move |slot| {
            counter.fetch_add(1, Ordering::SeqCst);
            seen.lock().unwrap().insert(slot);
            Ok(Some(empty_block(slot)))
        });

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CheckpointStore::open(dir.path().join("cp.json").to_str().unwrap()));
        store.save("hot", 100).unwrap();
        let scheduler = SlotScheduler::resume(
            Arc::new(ledger),
            detector(),
            store.clone(),
            SchedulerConfig::default(),
        )
        .await
        .unwrap();

        scheduler.observe(5_100);
        assert_eq!(scheduler.in_flight(), DEFAULT_MAX_IN_FLIGHT_SLOTS);
        scheduler.wait_idle().await;

        assert_eq!(calls.load(Ordering::SeqCst), 5_000);
        let fetched = fetched.lock().unwrap();
        assert!((101..=5_100).all(|slot| fetched.contains(&slot)));
        assert_eq!(scheduler.checkpoint(), 5_100);
        assert_eq!(store.get("hot"), Some(5_100));
    }

    #[tokio::test]
    async fn test_shutdown_drops_unclaimed_backlog() {
        let mut ledger = MockLedgerClient::new();
        ledger
            .expect_get_block()
            .returning(|slot| Ok(Some(empty_block(slot))));

        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(dir.path().join("cp.json").to_str().unwrap());
        let scheduler = SlotScheduler::new(
            Arc::new(ledger),
            detector(),
            Arc::new(store),
            SchedulerConfig {
                max_in_flight_slots: 2,
                ..test_config()
            },
            0,
        );

        scheduler.observe(100);
        assert_eq!(scheduler.in_flight(), 2);
        scheduler.shutdown();
        scheduler.wait_idle().await;
        assert_eq!(scheduler.checkpoint(), 2);
    }

    #[tokio::test]
    async fn test_checkpoint_write_failure_keeps_ingesting() {
        let mut ledger = MockLedgerClient::new();
        ledger
            .expect_get_block()
            .times(5)
            .returning(|slot| Ok(Some(empty_block(slot))));

        let dir = tempfile::tempdir().unwrap();
        // A directory where the file should be makes every write fail
        let path = dir.path().join("cp.json");
        std::fs::create_dir_all(path.join("occupied")).unwrap();
        let scheduler = scheduler_with_store(ledger, CheckpointStore::open(path.to_str().unwrap()), 0);

        scheduler.observe(3);
        scheduler.wait_idle().await;
        assert_eq!(scheduler.checkpoint(), 3);

        scheduler.observe(5);
        scheduler.wait_idle().await;
        assert_eq!(scheduler.checkpoint(), 5);
        assert!(path.is_dir());
        assert_eq!(CheckpointStore::open(path.to_str().unwrap()).get("hot"), None);
    }

    #[tokio::test]
    async fn test_persist_never_lowers_a_label() {
        let mut ledger = MockLedgerClient::new();
        ledger
            .expect_get_block()
            .times(1)
            .returning(|slot| Ok(Some(empty_block(slot))));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cp.json");
        let store = CheckpointStore::open(path.to_str().unwrap());
        store.save("hot", 500).unwrap();
        let scheduler = scheduler_with_store(ledger, store, 10);

        scheduler.observe(11);
        scheduler.wait_idle().await;
        assert_eq!(scheduler.checkpoint(), 11);
        assert_eq!(CheckpointStore::open(path.to_str().unwrap()).get("hot"), Some(500));
    }
}
