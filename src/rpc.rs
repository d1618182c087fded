//! JSON-RPC ledger client
//!
//! Request/response calls go over HTTP with reqwest. Slot and log feeds each
//! get their own WebSocket connection; a forwarding task pushes notifications
//! into the feed channel until the feed is unsubscribed or the socket drops.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::ledger::{
    Commitment, LedgerClient, LedgerError, LogFeed, LogNotification, SlotFeed, SubscriptionId,
};
use crate::types::{
    Block, RawInstruction, Slot, StructuredInstruction, Transaction, TransactionMessage,
    TransactionMeta,
};

/// HTTP request timeout
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Slot was skipped by the leader
pub const SLOT_SKIPPED: i64 = -32007;

/// Block has been pruned from ledger storage
pub const LONG_TERM_STORAGE_SLOT_SKIPPED: i64 = -32009;

/// Block cleaned up, no longer held by a non-archival node
pub const BLOCK_CLEANED_UP: i64 = -32001;

/// Block status not yet available
pub const BLOCK_NOT_AVAILABLE: i64 = -32004;

/// Block not yet confirmed at the requested commitment
pub const BLOCK_STATUS_NOT_AVAILABLE_YET: i64 = -32014;

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct UiBlock {
    #[serde(default)]
    transactions: Vec<UiTransactionWithMeta<UiRawMessage>>,
}

#[derive(Debug, Deserialize)]
struct UiTransactionWithMeta<M> {
    transaction: UiTransaction<M>,
    meta: Option<UiMeta>,
}

#[derive(Debug, Deserialize)]
struct UiTransaction<M> {
    signatures: Vec<String>,
    message: M,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UiMeta {
    err: Option<Value>,
    loaded_addresses: Option<UiLoadedAddresses>,
}

#[derive(Debug, Default, Deserialize)]
struct UiLoadedAddresses {
    #[serde(default)]
    writable: Vec<String>,
    #[serde(default)]
    readonly: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UiRawMessage {
    account_keys: Vec<String>,
    instructions: Vec<UiRawInstruction>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UiRawInstruction {
    program_id_index: usize,
    accounts: Vec<usize>,
    data: String,
}

#[derive(Debug, Deserialize)]
struct UiParsedMessage {
    instructions: Vec<UiParsedInstruction>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UiParsedInstruction {
    program: Option<String>,
    program_id: String,
    parsed: Option<Value>,
}

impl UiTransactionWithMeta<UiRawMessage> {
    fn into_transaction(self) -> Transaction {
        let meta = self.meta;
        let failed = meta.as_ref().is_some_and(|m| m.err.is_some());

        // Instruction indices address the static keys followed by any keys
        // loaded from lookup tables, writable before readonly.
        let mut account_keys = self.transaction.message.account_keys;
        if let Some(loaded) = meta.and_then(|m| m.loaded_addresses) {
            account_keys.extend(loaded.writable);
            account_keys.extend(loaded.readonly);
        }

        let instructions = self
            .transaction
            .message
            .instructions
            .into_iter()
            .map(|ix| RawInstruction {
                program_id_index: ix.program_id_index,
                accounts: ix.accounts,
                data: ix.data,
            })
            .collect();

        Transaction {
            signature: self.transaction.signatures.into_iter().next().unwrap_or_default(),
            meta: Some(TransactionMeta { failed }),
            message: TransactionMessage::Raw {
                account_keys,
                instructions,
            },
        }
    }
}

impl UiTransactionWithMeta<UiParsedMessage> {
    fn into_transaction(self) -> Transaction {
        let failed = self.meta.as_ref().is_some_and(|m| m.err.is_some());
        let instructions = self
            .transaction
            .message
            .instructions
            .into_iter()
            .map(|ix| StructuredInstruction {
                program: ix.program,
                program_id: ix.program_id,
                parsed: ix.parsed,
            })
            .collect();

        Transaction {
            signature: self.transaction.signatures.into_iter().next().unwrap_or_default(),
            meta: Some(TransactionMeta { failed }),
            message: TransactionMessage::Structured(instructions),
        }
    }
}

/// Parse a log notification's `result` object
fn parse_log_notification(result: &Value) -> Option<LogNotification> {
    let slot = result["context"]["slot"].as_u64()?;
    let value = &result["value"];
    let signature = value["signature"].as_str()?.to_string();
    Some(LogNotification {
        signature,
        slot,
        failed: !value["err"].is_null(),
    })
}

/// Parse a slot notification's `result` object
fn parse_slot_notification(result: &Value) -> Option<Slot> {
    result["slot"].as_u64()
}

/// Map a JSON-RPC error object onto a ledger error for `slot`
fn classify_block_error(slot: Slot, code: i64, message: String) -> Result<Option<Block>, LedgerError> {
    match code {
        SLOT_SKIPPED | LONG_TERM_STORAGE_SLOT_SKIPPED | BLOCK_CLEANED_UP => Ok(None),
        BLOCK_NOT_AVAILABLE | BLOCK_STATUS_NOT_AVAILABLE_YET => Err(LedgerError::NotAvailable(slot)),
        _ => Err(LedgerError::Rpc { code, message }),
    }
}

/// Ledger client over HTTP JSON-RPC and WebSocket subscriptions
pub struct RpcClient {
    http: reqwest::Client,
    http_url: String,
    ws_url: String,
    commitment: Commitment,
    next_id: AtomicU64,
    subscriptions: Arc<Mutex<HashMap<SubscriptionId, oneshot::Sender<()>>>>,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("http_url", &self.http_url)
            .field("ws_url", &self.ws_url)
            .field("commitment", &self.commitment)
            .finish()
    }
}

impl RpcClient {
    /// # Arguments
    /// * `http_url` - JSON-RPC endpoint
    /// * `ws_url` - WebSocket endpoint for subscriptions
    /// * `commitment` - Commitment used for block and transaction reads
    pub fn new(
        http_url: impl Into<String>,
        ws_url: impl Into<String>,
        commitment: Commitment,
    ) -> Result<Self, LedgerError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| LedgerError::Transport(e.to_string()))?;

        Ok(Self {
            http,
            http_url: http_url.into(),
            ws_url: ws_url.into(),
            commitment,
            next_id: AtomicU64::new(1),
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn commitment(&self) -> Commitment {
        self.commitment
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn subscriptions(&self) -> MutexGuard<'_, HashMap<SubscriptionId, oneshot::Sender<()>>> {
        self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make a JSON-RPC call and return the raw response envelope
    async fn call_raw<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<RpcResponse<T>, LedgerError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": self.next_id(),
            "method": method,
            "params": params,
        });
        debug!(method, "rpc call");

        let response = self
            .http
            .post(&self.http_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| LedgerError::Transport(e.to_string()))?;

        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            return Err(LedgerError::RateLimited);
        }
        if response.status().is_server_error() {
            return Err(LedgerError::Transport(format!("HTTP {}", response.status())));
        }

        response
            .json::<RpcResponse<T>>()
            .await
            .map_err(|e| LedgerError::InvalidResponse(e.to_string()))
    }

    /// Make a JSON-RPC call and unwrap its result
    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, LedgerError> {
        let response = self.call_raw(method, params).await?;
        if let Some(error) = response.error {
            return Err(LedgerError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        response
            .result
            .ok_or_else(|| LedgerError::InvalidResponse(format!("no result for {method}")))
    }

    /// Open a WebSocket, subscribe, and forward notifications through `forward`
    ///
    /// `forward` turns a notification's `result` into a feed item; returning
    /// `None` drops the notification.
    async fn subscribe<T, F>(
        &self,
        method: &'static str,
        unsubscribe_method: &'static str,
        params: Value,
        forward: F,
    ) -> Result<(SubscriptionId, mpsc::UnboundedReceiver<T>), LedgerError>
    where
        T: Send + 'static,
        F: Fn(&Value) -> Option<T> + Send + 'static,
    {
        let (mut ws, _) = connect_async(self.ws_url.as_str())
            .await
            .map_err(|e| LedgerError::SubscriptionFailed(e.to_string()))?;

        let request = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        ws.send(Message::Text(request.to_string()))
            .await
            .map_err(|e| LedgerError::SubscriptionFailed(e.to_string()))?;

        let remote_id = loop {
            let frame = ws
                .next()
                .await
                .ok_or_else(|| LedgerError::SubscriptionFailed("socket closed".into()))?
                .map_err(|e| LedgerError::SubscriptionFailed(e.to_string()))?;
            let Message::Text(text) = frame else {
                continue;
            };
            let response: RpcResponse<u64> = serde_json::from_str(&text)
                .map_err(|e| LedgerError::InvalidResponse(e.to_string()))?;
            if let Some(error) = response.error {
                return Err(LedgerError::SubscriptionFailed(format!(
                    "{method}: {} ({})",
                    error.message, error.code
                )));
            }
            if let Some(id) = response.result {
                break id;
            }
        };

        let id = self.next_id();
        let (tx, rx) = mpsc::unbounded_channel();
        let (stop_tx, mut stop_rx) = oneshot::channel();
        self.subscriptions().insert(id, stop_tx);
        info!(method, id, remote_id, "subscribed");

        let subscriptions = self.subscriptions.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stop_rx => {
                        let request = json!({
                            "jsonrpc": "2.0",
                            "id": 2,
                            "method": unsubscribe_method,
                            "params": [remote_id],
                        });
                        if let Err(e) = ws.send(Message::Text(request.to_string())).await {
                            debug!(id, error = %e, "unsubscribe send failed");
                        }
                        let _ = ws.close(None).await;
                        break;
                    }
                    frame = ws.next() => match frame {
                        Some(Ok(Message::Text(text))) => {
                            let Ok(value) = serde_json::from_str::<Value>(&text) else {
                                continue;
                            };
                            let Some(item) = forward(&value["params"]["result"]) else {
                                continue;
                            };
                            if tx.send(item).is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = ws.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            warn!(id, "subscription socket closed");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(id, error = %e, "subscription socket error");
                            break;
                        }
                    }
                }
            }
            subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
        });

        Ok((id, rx))
    }
}

#[async_trait]
impl LedgerClient for RpcClient {
    async fn current_slot(&self, commitment: Commitment) -> Result<Slot, LedgerError> {
        self.call("getSlot", json!([{ "commitment": commitment.as_str() }]))
            .await
    }

    async fn get_block(&self, slot: Slot) -> Result<Option<Block>, LedgerError> {
        let params = json!([
            slot,
            {
                "encoding": "json",
                "transactionDetails": "full",
                "maxSupportedTransactionVersion": 0,
                "rewards": false,
                "commitment": self.commitment.as_str(),
            }
        ]);

        let response: RpcResponse<UiBlock> = self.call_raw("getBlock", params).await?;
        if let Some(error) = response.error {
            return classify_block_error(slot, error.code, error.message);
        }
        let Some(block) = response.result else {
            return Ok(None);
        };

        Ok(Some(Block {
            slot,
            transactions: block
                .transactions
                .into_iter()
                .map(UiTransactionWithMeta::<UiRawMessage>::into_transaction)
                .collect(),
        }))
    }

    async fn get_transaction(&self, signature: &str) -> Result<Option<Transaction>, LedgerError> {
        let params = json!([
            signature,
            {
                "encoding": "jsonParsed",
                "maxSupportedTransactionVersion": 0,
                "commitment": self.commitment.as_str(),
            }
        ]);

        let response: RpcResponse<UiTransactionWithMeta<UiParsedMessage>> =
            self.call_raw("getTransaction", params).await?;
        if let Some(error) = response.error {
            return Err(LedgerError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        Ok(response.result.map(UiTransactionWithMeta::<UiParsedMessage>::into_transaction))
    }

    async fn subscribe_slots(&self) -> Result<(SubscriptionId, SlotFeed), LedgerError> {
        self.subscribe("slotSubscribe", "slotUnsubscribe", json!([]), parse_slot_notification)
            .await
    }

    async fn subscribe_logs(
        &self,
        address: &str,
        commitment: Commitment,
    ) -> Result<(SubscriptionId, LogFeed), LedgerError> {
        let params = json!([
            { "mentions": [address] },
            { "commitment": commitment.as_str() }
        ]);
        self.subscribe("logsSubscribe", "logsUnsubscribe", params, parse_log_notification)
            .await
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), LedgerError> {
        match self.subscriptions().remove(&id) {
            Some(stop) => {
                let _ = stop.send(());
                debug!(id, "unsubscribed");
                Ok(())
            }
            None => Err(LedgerError::SubscriptionFailed(format!("unknown subscription {id}"))),
        }
    }
}
