//! Subscription Resilience Layer
//!
//! Keeps a push feed alive against an unreliable provider and hands each
//! event to the ingestion path.
//!
//! ```text
//!   Disconnected ──subscribe──► Subscribing ──ok──► Active
//!        ▲                          │                 │
//!        └──── error (backoff) ─────┘                 │
//!        └────────────── feed ended (backoff) ────────┘
//! ```
//!
//! Block mode feeds slot numbers to the [`SlotScheduler`](crate::scheduler::SlotScheduler).
//! Log mode feeds signatures to a [`LogIngestor`], which fetches each
//! transaction once and runs it through the detector.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::dedup::{RecentSet, DEFAULT_RECENT_CAPACITY};
use crate::detector::OutflowDetector;
use crate::ledger::{
    Commitment, LedgerClient, LedgerError, LogFeed, LogNotification, SlotFeed, SubscriptionId,
};
use crate::types::{Slot, Transaction};

/// Initial backoff delay for resubscription
pub const INITIAL_BACKOFF_MS: u64 = 500;

/// Maximum backoff delay for resubscription
pub const MAX_BACKOFF_MS: u64 = 60_000;

/// Attempts made to fetch a transaction announced by a log event
pub const TRANSACTION_FETCH_ATTEMPTS: u32 = 3;

/// Delay between transaction fetch attempts
pub const TRANSACTION_RETRY_DELAY_MS: u64 = 500;

/// Configuration for resubscription backoff
#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    /// Initial backoff delay in milliseconds
    pub initial_backoff_ms: u64,
    /// Maximum backoff delay in milliseconds
    pub max_backoff_ms: u64,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: INITIAL_BACKOFF_MS,
            max_backoff_ms: MAX_BACKOFF_MS,
        }
    }
}

impl SubscriptionConfig {
    /// Calculate backoff delay for a given attempt number
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let delay_ms = self.initial_backoff_ms * 2u64.pow(attempt.min(10));
        Duration::from_millis(delay_ms.min(self.max_backoff_ms))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Disconnected,
    Subscribing,
    Active,
}

/// Which feed to keep alive
#[derive(Debug, Clone, PartialEq)]
pub enum FeedSpec {
    Slots,
    Logs {
        address: String,
        commitment: Commitment,
    },
}

/// One event from a live feed
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Slot(Slot),
    Log(LogNotification),
}

enum Feed {
    Slots(SlotFeed),
    Logs(LogFeed),
}

impl Feed {
    async fn recv(&mut self) -> Option<FeedEvent> {
        match self {
            Feed::Slots(rx) => rx.recv().await.map(FeedEvent::Slot),
            Feed::Logs(rx) => rx.recv().await.map(FeedEvent::Log),
        }
    }
}

/// Resolves once shutdown is signalled or the signal sender is gone
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Keeps one feed subscribed until shutdown
pub struct SubscriptionManager {
    ledger: Arc<dyn LedgerClient>,
    spec: FeedSpec,
    config: SubscriptionConfig,
    state: SubscriptionState,
    attempts: u32,
}

impl SubscriptionManager {
    pub fn new(ledger: Arc<dyn LedgerClient>, spec: FeedSpec, config: SubscriptionConfig) -> Self {
        Self {
            ledger,
            spec,
            config,
            state: SubscriptionState::Disconnected,
            attempts: 0,
        }
    }

    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    /// Failed subscribes and ended feeds since a feed last delivered an event
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Get the delay before the next subscribe attempt
    pub fn next_backoff_delay(&self) -> Duration {
        self.config.backoff_delay(self.attempts)
    }

    async fn subscribe(&self) -> Result<(SubscriptionId, Feed), LedgerError> {
        match &self.spec {
            FeedSpec::Slots => {
                let (id, rx) = self.ledger.subscribe_slots().await?;
                Ok((id, Feed::Slots(rx)))
            }
            FeedSpec::Logs { address, commitment } => {
                let (id, rx) = self.ledger.subscribe_logs(address, *commitment).await?;
                Ok((id, Feed::Logs(rx)))
            }
        }
    }

    /// Wait out the next backoff delay
    ///
    /// # Returns
    /// `true` if shutdown arrived first
    async fn back_off(&mut self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let delay = self.next_backoff_delay();
        self.attempts = self.attempts.saturating_add(1);
        tokio::select! {
            _ = sleep(delay) => false,
            _ = stopped(shutdown) => true,
        }
    }

    /// Deliver feed events to `handler` until `shutdown` turns true
    ///
    /// Subscribe failures and feeds that end both back off exponentially.
    /// The backoff resets once a feed delivers an event. On shutdown the
    /// live subscription, if any, is unsubscribed on a best-effort basis.
    pub async fn run<F>(&mut self, mut handler: F, mut shutdown: watch::Receiver<bool>)
    where
        F: FnMut(FeedEvent),
    {
        loop {
            if *shutdown.borrow() {
                break;
            }

            self.state = SubscriptionState::Subscribing;
            let (id, mut feed) = match self.subscribe().await {
                Ok(subscribed) => {
                    self.state = SubscriptionState::Active;
                    info!(feed = ?self.spec, id = subscribed.0, "subscription active");
                    subscribed
                }
                Err(e) => {
                    self.state = SubscriptionState::Disconnected;
                    warn!(
                        feed = ?self.spec,
                        error = %e,
                        attempt = self.attempts + 1,
                        delay_ms = self.next_backoff_delay().as_millis() as u64,
                        "subscribe failed, backing off"
                    );
                    if self.back_off(&mut shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            let shutting_down = loop {
                tokio::select! {
                    event = feed.recv() => match event {
                        Some(event) => {
                            self.attempts = 0;
                            handler(event);
                        }
                        None => break false,
                    },
                    _ = stopped(&mut shutdown) => break true,
                }
            };
            self.state = SubscriptionState::Disconnected;

            if shutting_down {
                if let Err(e) = self.ledger.unsubscribe(id).await {
                    debug!(id, error = %e, "unsubscribe failed");
                }
                break;
            }
            warn!(
                feed = ?self.spec,
                id,
                attempt = self.attempts + 1,
                delay_ms = self.next_backoff_delay().as_millis() as u64,
                "feed ended, resubscribing after backoff"
            );
            if self.back_off(&mut shutdown).await {
                break;
            }
        }
        info!(feed = ?self.spec, "subscription stopped");
    }
}

/// Settings for log-mode transaction ingestion
#[derive(Debug, Clone)]
pub struct LogIngestorConfig {
    pub fetch_attempts: u32,
    pub retry_delay: Duration,
    pub recent_capacity: usize,
    /// Keep events whose transaction failed on chain
    pub include_failed: bool,
}

impl Default for LogIngestorConfig {
    fn default() -> Self {
        Self {
            fetch_attempts: TRANSACTION_FETCH_ATTEMPTS,
            retry_delay: Duration::from_millis(TRANSACTION_RETRY_DELAY_MS),
            recent_capacity: DEFAULT_RECENT_CAPACITY,
            include_failed: false,
        }
    }
}

struct IngestInner {
    ledger: Arc<dyn LedgerClient>,
    detector: Arc<OutflowDetector>,
    checkpoints: Arc<CheckpointStore>,
    config: LogIngestorConfig,
    recent: Mutex<RecentSet>,
    pending: AtomicUsize,
    idle: Notify,
}

/// Turns log events into processed transactions
#[derive(Clone)]
pub struct LogIngestor {
    inner: Arc<IngestInner>,
}

impl LogIngestor {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        detector: Arc<OutflowDetector>,
        checkpoints: Arc<CheckpointStore>,
        config: LogIngestorConfig,
    ) -> Self {
        let recent = Mutex::new(RecentSet::new(config.recent_capacity));
        Self {
            inner: Arc::new(IngestInner {
                ledger,
                detector,
                checkpoints,
                config,
                recent,
                pending: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    /// Number of events still being ingested
    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::SeqCst)
    }

    /// Accept a log event for `label` and ingest it in the background
    ///
    /// Signatures seen recently are dropped.
    pub fn handle(&self, label: &str, event: LogNotification) {
        if event.failed && !self.inner.config.include_failed {
            debug!(label, signature = %event.signature, "skipping failed transaction");
            return;
        }

        let fresh = self
            .inner
            .recent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(&event.signature);
        if !fresh {
            debug!(label, signature = %event.signature, "duplicate log event");
            return;
        }

        self.inner.pending.fetch_add(1, Ordering::SeqCst);
        let this = self.clone();
        let label = label.to_string();
        tokio::spawn(async move {
            this.ingest(&label, &event).await;
            if this.inner.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
                this.inner.idle.notify_waiters();
            }
        });
    }

    /// Fetch, detect and checkpoint one announced transaction
    ///
    /// # Returns
    /// The number of alerts dispatched, or `None` if the transaction could
    /// not be fetched
    pub async fn ingest(&self, label: &str, event: &LogNotification) -> Option<usize> {
        let tx = self.fetch_transaction(&event.signature).await?;
        let alerts = self.inner.detector.process_transaction(event.slot, &tx).await;

        match self.inner.checkpoints.advance(label, event.slot) {
            Ok(true) => debug!(label, slot = event.slot, "checkpoint advanced"),
            Ok(false) => {}
            Err(e) => warn!(label, slot = event.slot, error = %e, "failed to persist checkpoint"),
        }
        Some(alerts)
    }

    async fn fetch_transaction(&self, signature: &str) -> Option<Transaction> {
        let attempts = self.inner.config.fetch_attempts.max(1);
        for attempt in 1..=attempts {
            match self.inner.ledger.get_transaction(signature).await {
                Ok(Some(tx)) => return Some(tx),
                Ok(None) => debug!(signature, attempt, "transaction not available yet"),
                Err(e) => warn!(signature, attempt, error = %e, "transaction fetch failed"),
            }
            if attempt < attempts {
                sleep(self.inner.config.retry_delay).await;
            }
        }
        error!(signature, attempts, "giving up on transaction");
        None
    }

    /// Resolves once every accepted event has been ingested
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }
}
