//! Mock Pipeline Integration Tests
//!
//! Drives the full ingestion pipeline against an in-memory ledger and a
//! capturing alert sink (no external dependencies).
//! Verifies subscribe → fetch → detect → alert → checkpoint works correctly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::{mpsc, watch};

use outflow_watcher::checkpoint::CheckpointStore;
use outflow_watcher::ledger::{LogFeed, LogNotification, SlotFeed, SubscriptionId};
use outflow_watcher::publisher::PublishError;
use outflow_watcher::scheduler::SchedulerConfig;
use outflow_watcher::subscription::{
    FeedEvent, FeedSpec, LogIngestor, LogIngestorConfig, SubscriptionConfig, SubscriptionManager,
};
use outflow_watcher::types::{
    RawInstruction, StructuredInstruction, TransactionMessage, SYSTEM_PROGRAM_ID,
};
use outflow_watcher::{
    parse_ranges, AlertDispatcher, AlertMessage, AlertSink, Block, Commitment, LedgerClient,
    LedgerError, OutflowDetector, Slot, SlotScheduler, Transaction, WatchedAddress,
};

const HOT: &str = "9WzDXwBbmkg8ZTbNMqUxvQRAyrZzDsGYdLVL9zYtAWWM";
const RECEIVER: &str = "5Q544fKrFoe6tsEbD7S8EmxGTJYAKtTVhAW5Q5pge4j1";
const OTHER: &str = "4Nd1mBQtrMJVYVfKf2PJy9NZUZdTAsp7D4xWLs4gDB4T";

/// What the mock ledger answers for one slot
#[derive(Clone)]
enum SlotEntry {
    Block(Block),
    Skipped,
    /// Fail this many times, then serve the block
    Flaky(usize, Block),
}

/// In-memory ledger with scripted blocks and a pushable slot feed
#[derive(Default)]
struct MockLedger {
    slots: Mutex<HashMap<Slot, SlotEntry>>,
    transactions: Mutex<HashMap<String, Transaction>>,
    block_calls: Mutex<HashMap<Slot, usize>>,
    slot_feeds: Mutex<Vec<mpsc::UnboundedSender<Slot>>>,
    tip: Slot,
}

impl MockLedger {
    fn with_tip(tip: Slot) -> Self {
        Self {
            tip,
            ..Default::default()
        }
    }

    fn insert(&self, slot: Slot, entry: SlotEntry) {
        self.slots.lock().unwrap().insert(slot, entry);
    }

    fn insert_transaction(&self, tx: Transaction) {
        self.transactions.lock().unwrap().insert(tx.signature.clone(), tx);
    }

    fn block_calls(&self, slot: Slot) -> usize {
        self.block_calls.lock().unwrap().get(&slot).copied().unwrap_or(0)
    }

    fn push_slot(&self, slot: Slot) {
        self.slot_feeds
            .lock()
            .unwrap()
            .retain(|feed| feed.send(slot).is_ok());
    }
}

#[async_trait]
impl LedgerClient for MockLedger {
    async fn current_slot(&self, _commitment: Commitment) -> Result<Slot, LedgerError> {
        Ok(self.tip)
    }

    async fn get_block(&self, slot: Slot) -> Result<Option<Block>, LedgerError> {
        *self.block_calls.lock().unwrap().entry(slot).or_default() += 1;
        let mut slots = self.slots.lock().unwrap();
        match slots.get_mut(&slot) {
            Some(SlotEntry::Block(block)) => Ok(Some(block.clone())),
            Some(SlotEntry::Skipped) => Ok(None),
            Some(SlotEntry::Flaky(remaining, block)) => {
                if *remaining > 0 {
                    *remaining -= 1;
                    Err(LedgerError::NotAvailable(slot))
                } else {
                    Ok(Some(block.clone()))
                }
            }
            None => Ok(Some(Block {
                slot,
                transactions: vec![],
            })),
        }
    }

    async fn get_transaction(&self, signature: &str) -> Result<Option<Transaction>, LedgerError> {
        Ok(self.transactions.lock().unwrap().get(signature).cloned())
    }

    async fn subscribe_slots(&self) -> Result<(SubscriptionId, SlotFeed), LedgerError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut feeds = self.slot_feeds.lock().unwrap();
        feeds.push(tx);
        Ok((feeds.len() as SubscriptionId, rx))
    }

    async fn subscribe_logs(
        &self,
        _address: &str,
        _commitment: Commitment,
    ) -> Result<(SubscriptionId, LogFeed), LedgerError> {
        Err(LedgerError::SubscriptionFailed("not scripted".into()))
    }

    async fn unsubscribe(&self, _id: SubscriptionId) -> Result<(), LedgerError> {
        Ok(())
    }
}

/// Alert sink that records every delivered message
#[derive(Default)]
struct CapturingSink {
    messages: Mutex<Vec<AlertMessage>>,
    /// Panic on the first delivery attempt of this signature
    panic_once_on: Option<String>,
    panicked: AtomicUsize,
}

impl CapturingSink {
    fn panicking_on(signature: &str) -> Self {
        Self {
            panic_once_on: Some(signature.to_string()),
            ..Default::default()
        }
    }

    fn messages(&self) -> Vec<AlertMessage> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl AlertSink for CapturingSink {
    fn name(&self) -> &str {
        "capture"
    }

    async fn send(&self, message: &AlertMessage) -> Result<(), PublishError> {
        if self.panic_once_on.as_deref() == Some(message.signature.as_str())
            && self.panicked.fetch_add(1, Ordering::SeqCst) == 0
        {
            panic!("sink blew up on {}", message.signature);
        }
        self.messages.lock().unwrap().push(message.clone());
        Ok(())
    }
}

fn transfer_tx(signature: &str, from: &str, lamports: u64) -> Transaction {
    let mut data = vec![2, 0, 0, 0];
    data.extend_from_slice(&lamports.to_le_bytes());
    Transaction {
        signature: signature.to_string(),
        meta: None,
        message: TransactionMessage::Raw {
            account_keys: vec![from.to_string(), RECEIVER.to_string(), SYSTEM_PROGRAM_ID.to_string()],
            instructions: vec![RawInstruction::from_bytes(2, vec![0, 1], &data)],
        },
    }
}

fn block(slot: Slot, transactions: Vec<Transaction>) -> Block {
    Block { slot, transactions }
}

struct Harness {
    ledger: Arc<MockLedger>,
    sink: Arc<CapturingSink>,
    checkpoints: Arc<CheckpointStore>,
    detector: Arc<OutflowDetector>,
    dir: TempDir,
}

impl Harness {
    fn new(ledger: MockLedger, sink: CapturingSink) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let checkpoints = Arc::new(CheckpointStore::open(
            dir.path().join("checkpoint.json").to_str().unwrap(),
        ));
        let sink = Arc::new(sink);
        let dispatcher = Arc::new(AlertDispatcher::new(vec![sink.clone() as Arc<dyn AlertSink>]));
        let detector = Arc::new(OutflowDetector::new(
            vec![WatchedAddress {
                label: "hot".to_string(),
                address: HOT.to_string(),
                ranges: parse_ranges("1-5, 100"),
            }],
            dispatcher,
            false,
        ));
        Self {
            ledger: Arc::new(ledger),
            sink,
            checkpoints,
            detector,
            dir,
        }
    }

    fn scheduler(&self, checkpoint: Slot) -> SlotScheduler {
        let config = SchedulerConfig {
            fetch_retry_delay: Duration::from_millis(10),
            process_retry_delay: Duration::from_millis(10),
            ..Default::default()
        };
        SlotScheduler::new(
            self.ledger.clone(),
            self.detector.clone(),
            self.checkpoints.clone(),
            config,
            checkpoint,
        )
    }

    fn stored_checkpoint(&self) -> Option<Slot> {
        CheckpointStore::open(self.dir.path().join("checkpoint.json").to_str().unwrap()).get("hot")
    }
}

#[tokio::test]
async fn test_matching_outflow_alerts_and_checkpoints() {
    let ledger = MockLedger::default();
    ledger.insert(101, SlotEntry::Block(block(101, vec![transfer_tx("small", HOT, 500_000_000)])));
    ledger.insert(102, SlotEntry::Skipped);
    ledger.insert(
        103,
        SlotEntry::Block(block(
            103,
            vec![
                transfer_tx("match", HOT, 2_500_000_000),
                transfer_tx("stranger", OTHER, 2_500_000_000),
                transfer_tx("exact", HOT, 100_000_000_000),
            ],
        )),
    );

    let harness = Harness::new(ledger, CapturingSink::default());
    let scheduler = harness.scheduler(100);
    scheduler.observe(103);
    scheduler.wait_idle().await;

    let messages = harness.sink.messages();
    let signatures: Vec<_> = messages.iter().map(|m| m.signature.as_str()).collect();
    assert_eq!(signatures.len(), 2);
    assert!(signatures.contains(&"match"));
    assert!(signatures.contains(&"exact"));
    assert!(messages.iter().all(|m| m.label == "hot" && m.receiver == RECEIVER && m.slot == 103));

    assert_eq!(scheduler.checkpoint(), 103);
    assert_eq!(harness.stored_checkpoint(), Some(103));
}

#[tokio::test]
async fn test_out_of_order_completion_keeps_checkpoint_gap_free() {
    let ledger = MockLedger::default();
    ledger.insert(11, SlotEntry::Flaky(3, block(11, vec![])));

    let harness = Harness::new(ledger, CapturingSink::default());
    let scheduler = harness.scheduler(10);
    scheduler.observe(15);

    // 12..=15 finish while 11 is still failing
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(scheduler.checkpoint(), 10);

    scheduler.wait_idle().await;
    assert_eq!(scheduler.checkpoint(), 15);
    assert_eq!(harness.ledger.block_calls(11), 4);
    assert_eq!(harness.stored_checkpoint(), Some(15));
}

#[tokio::test]
async fn test_each_slot_fetched_once() {
    let harness = Harness::new(MockLedger::default(), CapturingSink::default());
    let scheduler = harness.scheduler(0);
    for slot in [3, 1, 3, 2, 3, 1] {
        scheduler.observe(slot);
    }
    scheduler.wait_idle().await;

    for slot in 1..=3 {
        assert_eq!(harness.ledger.block_calls(slot), 1, "slot {slot}");
    }
    scheduler.observe(2);
    scheduler.wait_idle().await;
    assert_eq!(harness.ledger.block_calls(2), 1);
}

#[tokio::test]
async fn test_processing_panic_requeues_without_duplicate_alerts() {
    let ledger = MockLedger::default();
    ledger.insert(
        1,
        SlotEntry::Block(block(
            1,
            vec![transfer_tx("first", HOT, 2_000_000_000), transfer_tx("second", HOT, 3_000_000_000)],
        )),
    );

    let harness = Harness::new(ledger, CapturingSink::panicking_on("second"));
    let scheduler = harness.scheduler(0);
    scheduler.observe(1);
    scheduler.wait_idle().await;

    let signatures: Vec<_> = harness.sink.messages().into_iter().map(|m| m.signature).collect();
    assert_eq!(signatures, vec!["first".to_string(), "second".to_string()]);
    assert_eq!(harness.ledger.block_calls(1), 1);
    assert_eq!(scheduler.checkpoint(), 1);
}

#[tokio::test]
async fn test_backlog_drains_through_worker_pool() {
    let ledger = MockLedger::default();
    for slot in 1..=40 {
        ledger.insert(slot, SlotEntry::Block(block(slot, vec![transfer_tx(&format!("s{slot}"), HOT, 2_000_000_000)])));
    }

    let harness = Harness::new(ledger, CapturingSink::default());
    let scheduler = harness.scheduler(0);
    scheduler.observe(40);
    scheduler.wait_idle().await;

    assert_eq!(harness.sink.messages().len(), 40);
    assert_eq!(scheduler.checkpoint(), 40);
}

#[tokio::test]
async fn test_resume_starts_below_finalized_tip() {
    let harness = Harness::new(MockLedger::with_tip(5_000), CapturingSink::default());
    let scheduler = SlotScheduler::resume(
        harness.ledger.clone(),
        harness.detector.clone(),
        harness.checkpoints.clone(),
        SchedulerConfig::default(),
    )
    .await
    .unwrap();
    assert_eq!(scheduler.checkpoint(), 4_999);

    scheduler.observe(5_001);
    scheduler.wait_idle().await;
    assert_eq!(harness.ledger.block_calls(5_000), 1);
    assert_eq!(harness.stored_checkpoint(), Some(5_001));
}

#[tokio::test]
async fn test_slot_feed_drives_scheduler() {
    let ledger = MockLedger::default();
    ledger.insert(3, SlotEntry::Block(block(3, vec![transfer_tx("fed", HOT, 4_000_000_000)])));
    let harness = Harness::new(ledger, CapturingSink::default());
    let scheduler = harness.scheduler(0);

    let (stop_tx, stop_rx) = watch::channel(false);
    let observer = scheduler.clone();
    let mut manager = SubscriptionManager::new(
        harness.ledger.clone(),
        FeedSpec::Slots,
        SubscriptionConfig::default(),
    );
    let feed = tokio::spawn(async move {
        manager
            .run(
                |event| {
                    if let FeedEvent::Slot(slot) = event {
                        observer.observe(slot);
                    }
                },
                stop_rx,
            )
            .await;
    });

    while harness.ledger.slot_feeds.lock().unwrap().is_empty() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    harness.ledger.push_slot(2);
    harness.ledger.push_slot(4);

    tokio::time::timeout(Duration::from_secs(5), async {
        while scheduler.checkpoint() < 4 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();

    stop_tx.send(true).unwrap();
    feed.await.unwrap();
    scheduler.shutdown();
    scheduler.wait_idle().await;

    let signatures: Vec<_> = harness.sink.messages().into_iter().map(|m| m.signature).collect();
    assert_eq!(signatures, vec!["fed".to_string()]);
}

#[tokio::test]
async fn test_log_mode_ingestion() {
    let ledger = MockLedger::default();
    ledger.insert_transaction(Transaction {
        signature: "logged".to_string(),
        meta: None,
        message: TransactionMessage::Structured(vec![StructuredInstruction {
            program: Some("system".to_string()),
            program_id: SYSTEM_PROGRAM_ID.to_string(),
            parsed: Some(json!({
                "type": "transfer",
                "info": { "source": HOT, "destination": RECEIVER, "lamports": 1_000_000_000u64 }
            })),
        }]),
    });

    let harness = Harness::new(ledger, CapturingSink::default());
    let ingestor = LogIngestor::new(
        harness.ledger.clone(),
        harness.detector.clone(),
        harness.checkpoints.clone(),
        LogIngestorConfig::default(),
    );

    for _ in 0..3 {
        ingestor.handle(
            "hot",
            LogNotification {
                signature: "logged".to_string(),
                slot: 900,
                failed: false,
            },
        );
    }
    ingestor.wait_idle().await;

    let messages = harness.sink.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].amount, 1.0);
    assert_eq!(messages[0].slot, 900);
    assert_eq!(harness.stored_checkpoint(), Some(900));
}
