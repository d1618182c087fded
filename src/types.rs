//! Ledger Data Model
//!
//! Slots, blocks and transactions as the pipeline sees them, independent of
//! the RPC wire format. Transactions arrive either structured (the provider
//! already decoded each instruction) or raw (account table plus opaque
//! instruction payloads).

use serde_json::Value;

use crate::filter::AmountRange;

/// Ledger position
pub type Slot = u64;

/// Address of the native-transfer (system) program
pub const SYSTEM_PROGRAM_ID: &str = "11111111111111111111111111111111";

/// Base units per display unit of the native currency
pub const LAMPORTS_PER_SOL: f64 = 1_000_000_000.0;

/// All transactions finalized at one slot
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Block {
    pub slot: Slot,
    pub transactions: Vec<Transaction>,
}

/// A signed transaction in one of the two supported encodings
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    /// First signature, base58
    pub signature: String,
    /// Execution metadata, when the provider returned it
    pub meta: Option<TransactionMeta>,
    pub message: TransactionMessage,
}

impl Transaction {
    /// True if the provider reported an execution error for this transaction
    pub fn failed(&self) -> bool {
        self.meta.as_ref().is_some_and(|meta| meta.failed)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionMeta {
    pub failed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransactionMessage {
    /// Instructions annotated with the decoding done by the provider
    Structured(Vec<StructuredInstruction>),
    /// Account table plus compiled instructions
    Raw {
        account_keys: Vec<String>,
        instructions: Vec<RawInstruction>,
    },
}

/// An instruction the provider has (possibly) decoded
#[derive(Debug, Clone, PartialEq)]
pub struct StructuredInstruction {
    /// Decoded program name, e.g. "system"
    pub program: Option<String>,
    pub program_id: String,
    /// `{ "type": ..., "info": { ... } }` for decoded instructions
    pub parsed: Option<Value>,
}

/// A compiled instruction referencing the transaction's account table
#[derive(Debug, Clone, PartialEq)]
pub struct RawInstruction {
    pub program_id_index: usize,
    pub accounts: Vec<usize>,
    /// Instruction payload, base58 as delivered by the provider
    pub data: String,
}

impl RawInstruction {
    /// Build an instruction from an already-decoded payload
    pub fn from_bytes(program_id_index: usize, accounts: Vec<usize>, data: &[u8]) -> Self {
        Self {
            program_id_index,
            accounts,
            data: bs58::encode(data).into_string(),
        }
    }
}

/// An address under watch, loaded once at startup
#[derive(Debug, Clone, PartialEq)]
pub struct WatchedAddress {
    /// Unique human-readable name
    pub label: String,
    /// Base58 account id
    pub address: String,
    /// Amount intervals (display units) that raise an alert
    pub ranges: Vec<AmountRange>,
}

/// A native-currency transfer out of a watched address
#[derive(Debug, Clone, PartialEq)]
pub struct Outflow {
    /// Amount in display units
    pub amount: f64,
    /// Amount in base units
    pub lamports: u64,
    pub receiver: String,
    pub signature: String,
    pub slot: Slot,
}
