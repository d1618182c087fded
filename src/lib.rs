//! Outflow Watcher Library
//!
//! This crate follows a Solana-style ledger, finds native transfers leaving
//! watched addresses whose amounts fall inside configured ranges, and
//! publishes an alert for each one.
//!
//! Two ingestion modes share one detection path:
//! - blocks: slot updates drive [`scheduler::SlotScheduler`], which fetches
//!   every block and advances a gap-free checkpoint
//! - logs: per-address log notifications drive [`subscription::LogIngestor`]

pub mod checkpoint;
pub mod config;
pub mod decoder;
pub mod dedup;
pub mod detector;
pub mod error;
pub mod filter;
pub mod ledger;
pub mod publisher;
pub mod rpc;
pub mod scheduler;
pub mod subscription;
pub mod types;

// Re-export commonly used types
pub use checkpoint::CheckpointStore;
pub use config::{Config, IngestMode};
pub use decoder::extract_outflows;
pub use detector::OutflowDetector;
pub use error::{Error, Result};
pub use filter::{matches, parse_ranges, AmountRange};
pub use ledger::{Commitment, LedgerClient, LedgerError};
pub use publisher::{AlertDispatcher, AlertMessage, AlertSink};
pub use rpc::RpcClient;
pub use scheduler::{SchedulerConfig, SlotScheduler};
pub use subscription::{LogIngestor, SubscriptionManager};
pub use types::{Block, Outflow, Slot, Transaction, WatchedAddress};
