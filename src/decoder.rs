//! Transfer Decoder
//!
//! Extracts native-currency transfers from transactions in either encoding and
//! turns the ones sent by a watched address into outflows.
//!
//! Structured instructions are accepted when the provider decoded them as a
//! system-program `transfer`. Raw instructions are decoded here: the payload is
//! a 4-byte little-endian variant tag (`2` for transfer) followed by the amount
//! as a little-endian u64, and the first two account indices are the source
//! and destination.
//!
//! Decoding is per instruction: a malformed instruction contributes nothing
//! and never stops the scan of the rest of the transaction.

use serde_json::Value;
use thiserror::Error;
use tracing::trace;

use crate::types::{
    Outflow, RawInstruction, Slot, StructuredInstruction, Transaction, TransactionMessage,
    WatchedAddress, LAMPORTS_PER_SOL, SYSTEM_PROGRAM_ID,
};

/// Variant tag of the system program's transfer instruction
pub const TRANSFER_DISCRIMINATOR: [u8; 4] = [2, 0, 0, 0];

/// Discriminator plus u64 amount
pub const TRANSFER_DATA_LEN: usize = 12;

/// Program name the provider uses for the system program
pub const SYSTEM_PROGRAM_NAME: &str = "system";

/// Parsed instruction type of a plain transfer
pub const TRANSFER_TYPE: &str = "transfer";

/// Reasons an instruction is not a usable transfer
#[derive(Error, Debug, PartialEq)]
pub enum DecodeError {
    #[error("Instruction is not addressed to the system program")]
    NotSystemProgram,

    #[error("Instruction is not a transfer: {0}")]
    NotTransfer(String),

    #[error("Instruction is not decoded")]
    NotParsed,

    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Transfer amount is zero")]
    ZeroAmount,

    #[error("Account index {0} out of range")]
    AccountIndexOutOfRange(usize),

    #[error("Instruction has {0} accounts, expected at least 2")]
    TooFewAccounts(usize),

    #[error("Instruction data too short: {0} bytes")]
    DataTooShort(usize),

    #[error("Invalid base58 data: {0}")]
    InvalidData(String),
}

/// A decoded native transfer, before filtering by source
#[derive(Debug, Clone, PartialEq)]
pub struct Transfer {
    pub source: String,
    pub destination: String,
    pub lamports: u64,
}

/// Convert base units to display units
pub fn lamports_to_sol(lamports: u64) -> f64 {
    lamports as f64 / LAMPORTS_PER_SOL
}

/// Extract the 4-byte variant tag from an instruction payload
///
/// # Returns
/// `Some([u8; 4])` if the payload has at least 4 bytes, `None` otherwise
pub fn read_discriminator(data: &[u8]) -> Option<[u8; 4]> {
    if data.len() < 4 {
        return None;
    }
    let mut discriminator = [0u8; 4];
    discriminator.copy_from_slice(&data[..4]);
    Some(discriminator)
}

/// Read the transfer amount from a raw transfer payload
pub fn read_lamports(data: &[u8]) -> Result<u64, DecodeError> {
    if data.len() < TRANSFER_DATA_LEN {
        return Err(DecodeError::DataTooShort(data.len()));
    }
    let mut amount = [0u8; 8];
    amount.copy_from_slice(&data[4..TRANSFER_DATA_LEN]);
    Ok(u64::from_le_bytes(amount))
}

/// Decode a structured (provider-parsed) instruction as a transfer
pub fn decode_structured_transfer(ix: &StructuredInstruction) -> Result<Transfer, DecodeError> {
    let is_system = ix.program.as_deref() == Some(SYSTEM_PROGRAM_NAME)
        || ix.program_id == SYSTEM_PROGRAM_ID;
    if !is_system {
        return Err(DecodeError::NotSystemProgram);
    }

    let parsed = ix.parsed.as_ref().ok_or(DecodeError::NotParsed)?;
    let kind = parsed
        .get("type")
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingField("type"))?;
    if kind != TRANSFER_TYPE {
        return Err(DecodeError::NotTransfer(kind.to_string()));
    }

    let info = parsed.get("info").ok_or(DecodeError::MissingField("info"))?;
    let source = info
        .get("source")
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingField("source"))?;
    let destination = info
        .get("destination")
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingField("destination"))?;
    let lamports = info
        .get("lamports")
        .ok_or(DecodeError::MissingField("lamports"))?;
    let lamports = lamports
        .as_u64()
        .ok_or_else(|| DecodeError::InvalidAmount(lamports.to_string()))?;
    if lamports == 0 {
        return Err(DecodeError::ZeroAmount);
    }

    Ok(Transfer {
        source: source.to_string(),
        destination: destination.to_string(),
        lamports,
    })
}

/// Decode a raw instruction as a transfer, resolving indices through `account_keys`
pub fn decode_raw_transfer(
    ix: &RawInstruction,
    account_keys: &[String],
) -> Result<Transfer, DecodeError> {
    let program = resolve_account(account_keys, ix.program_id_index)?;
    if program != SYSTEM_PROGRAM_ID {
        return Err(DecodeError::NotSystemProgram);
    }

    let data = bs58::decode(&ix.data)
        .into_vec()
        .map_err(|e| DecodeError::InvalidData(e.to_string()))?;
    if data.len() < TRANSFER_DATA_LEN {
        return Err(DecodeError::DataTooShort(data.len()));
    }
    if read_discriminator(&data) != Some(TRANSFER_DISCRIMINATOR) {
        return Err(DecodeError::NotTransfer(format!("{:?}", &data[..4])));
    }
    let lamports = read_lamports(&data)?;
    if lamports == 0 {
        return Err(DecodeError::ZeroAmount);
    }

    if ix.accounts.len() < 2 {
        return Err(DecodeError::TooFewAccounts(ix.accounts.len()));
    }
    let source = resolve_account(account_keys, ix.accounts[0])?;
    let destination = resolve_account(account_keys, ix.accounts[1])?;

    Ok(Transfer {
        source: source.to_string(),
        destination: destination.to_string(),
        lamports,
    })
}

fn resolve_account(account_keys: &[String], index: usize) -> Result<&str, DecodeError> {
    account_keys
        .get(index)
        .map(String::as_str)
        .ok_or(DecodeError::AccountIndexOutOfRange(index))
}

/// Decode every transfer in a transaction, skipping instructions that don't decode
pub fn decode_transfers(tx: &Transaction) -> Vec<Transfer> {
    match &tx.message {
        TransactionMessage::Structured(instructions) => instructions
            .iter()
            .enumerate()
            .filter_map(|(index, ix)| keep(tx, index, decode_structured_transfer(ix)))
            .collect(),
        TransactionMessage::Raw {
            account_keys,
            instructions,
        } => instructions
            .iter()
            .enumerate()
            .filter_map(|(index, ix)| keep(tx, index, decode_raw_transfer(ix, account_keys)))
            .collect(),
    }
}

fn keep(tx: &Transaction, index: usize, result: Result<Transfer, DecodeError>) -> Option<Transfer> {
    match result {
        Ok(transfer) => Some(transfer),
        Err(e) => {
            trace!(signature = %tx.signature, index, reason = %e, "instruction skipped");
            None
        }
    }
}

/// Extract the outflows a transaction sends from `watched`
///
/// Pure function of its inputs: the same transaction always yields the same
/// outflows, in instruction order.
pub fn extract_outflows(tx: &Transaction, slot: Slot, watched: &WatchedAddress) -> Vec<Outflow> {
    decode_transfers(tx)
        .into_iter()
        .filter(|transfer| transfer.source == watched.address)
        .map(|transfer| Outflow {
            amount: lamports_to_sol(transfer.lamports),
            lamports: transfer.lamports,
            receiver: transfer.destination,
            signature: tx.signature.clone(),
            slot,
        })
        .collect()
}
