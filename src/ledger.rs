//! Ledger Client Interface
//!
//! The operations the pipeline needs from a ledger node. `RpcClient` in
//! [`crate::rpc`] talks to a real node; tests substitute mocks.
//!
//! Push feeds are returned as channel receivers. A feed has ended when its
//! receiver yields `None`.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::types::{Block, Slot, Transaction};

/// Local identifier of a live subscription
pub type SubscriptionId = u64;

/// Feed of slot numbers
pub type SlotFeed = mpsc::UnboundedReceiver<Slot>;

/// Feed of log notifications for one address
pub type LogFeed = mpsc::UnboundedReceiver<LogNotification>;

/// Confirmation level requested from the node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Commitment {
    Processed,
    #[default]
    Confirmed,
    Finalized,
}

impl Commitment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Commitment::Processed => "processed",
            Commitment::Confirmed => "confirmed",
            Commitment::Finalized => "finalized",
        }
    }
}

impl fmt::Display for Commitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Commitment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "processed" => Ok(Commitment::Processed),
            "confirmed" => Ok(Commitment::Confirmed),
            "finalized" => Ok(Commitment::Finalized),
            other => Err(format!("unknown commitment '{other}'")),
        }
    }
}

/// A transaction mentioning a subscribed address
#[derive(Debug, Clone, PartialEq)]
pub struct LogNotification {
    pub signature: String,
    pub slot: Slot,
    /// The node reported an execution error
    pub failed: bool,
}

/// Errors reported by a ledger client
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Rate limited by provider")]
    RateLimited,

    #[error("Block for slot {0} not available yet")]
    NotAvailable(Slot),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Unexpected response: {0}")]
    InvalidResponse(String),

    #[error("Subscription failed: {0}")]
    SubscriptionFailed(String),
}

impl LedgerError {
    /// Errors expected to clear up on their own
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LedgerError::RateLimited | LedgerError::NotAvailable(_) | LedgerError::Transport(_)
        )
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Most recent slot at `commitment`
    async fn current_slot(&self, commitment: Commitment) -> Result<Slot, LedgerError>;

    /// Block at `slot` with raw-encoded transactions
    ///
    /// `Ok(None)` means the slot was skipped or pruned and will never have a
    /// block. A block that is not produced yet is an error.
    async fn get_block(&self, slot: Slot) -> Result<Option<Block>, LedgerError>;

    /// Transaction with structured-encoded instructions, `Ok(None)` if unknown
    async fn get_transaction(&self, signature: &str) -> Result<Option<Transaction>, LedgerError>;

    /// Open a feed of new slots
    async fn subscribe_slots(&self) -> Result<(SubscriptionId, SlotFeed), LedgerError>;

    /// Open a feed of transactions mentioning `address`
    async fn subscribe_logs(
        &self,
        address: &str,
        commitment: Commitment,
    ) -> Result<(SubscriptionId, LogFeed), LedgerError>;

    /// Close a feed opened by this client
    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), LedgerError>;
}
