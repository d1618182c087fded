//! Outflow Detection
//!
//! Runs every transaction past every watched address: decode outflows, keep
//! the ones inside the address's ranges, dispatch an alert for each.

use std::sync::Arc;

use tracing::{debug, info};

use crate::decoder::extract_outflows;
use crate::filter::matches;
use crate::publisher::{AlertDispatcher, AlertMessage};
use crate::types::{Block, Outflow, Slot, Transaction, WatchedAddress};

pub struct OutflowDetector {
    watched: Vec<WatchedAddress>,
    dispatcher: Arc<AlertDispatcher>,
    include_failed: bool,
}

impl OutflowDetector {
    /// # Arguments
    /// * `watched` - Addresses to watch, in configuration order
    /// * `dispatcher` - Where alerts go
    /// * `include_failed` - Also alert on transactions that failed on chain
    pub fn new(
        watched: Vec<WatchedAddress>,
        dispatcher: Arc<AlertDispatcher>,
        include_failed: bool,
    ) -> Self {
        Self {
            watched,
            dispatcher,
            include_failed,
        }
    }

    pub fn watched(&self) -> &[WatchedAddress] {
        &self.watched
    }

    pub fn labels(&self) -> Vec<String> {
        self.watched.iter().map(|w| w.label.clone()).collect()
    }

    /// Outflows in `tx` that fall inside their watched address's ranges
    pub fn matching_outflows(&self, slot: Slot, tx: &Transaction) -> Vec<(&WatchedAddress, Outflow)> {
        if tx.failed() && !self.include_failed {
            return Vec::new();
        }

        let mut matched = Vec::new();
        for watched in &self.watched {
            for outflow in extract_outflows(tx, slot, watched) {
                if matches(outflow.amount, &watched.ranges) {
                    matched.push((watched, outflow));
                } else {
                    debug!(
                        label = %watched.label,
                        amount = outflow.amount,
                        signature = %outflow.signature,
                        "outflow outside ranges"
                    );
                }
            }
        }
        matched
    }

    /// Detect and alert on one transaction
    ///
    /// # Returns
    /// The number of alerts dispatched
    pub async fn process_transaction(&self, slot: Slot, tx: &Transaction) -> usize {
        let mut sent = 0;
        for (watched, outflow) in self.matching_outflows(slot, tx) {
            info!(
                label = %watched.label,
                amount = outflow.amount,
                receiver = %outflow.receiver,
                slot,
                signature = %outflow.signature,
                "matched outflow"
            );
            if self.dispatcher.dispatch(&AlertMessage::new(watched, &outflow)).await {
                sent += 1;
            }
        }
        sent
    }

    /// Detect and alert on every transaction of a block
    pub async fn process_block(&self, block: &Block) -> usize {
        let mut sent = 0;
        for tx in &block.transactions {
            sent += self.process_transaction(block.slot, tx).await;
        }
        sent
    }
}
