//! Alert Publishing
//!
//! Formats matched outflows as alert messages and fans them out to the
//! configured sinks: the log, a Redis pub/sub channel, a Telegram chat.
//!
//! Delivery is fire-and-forget: a sink failure is logged and not retried.
//! Each alert carries a stable dedup key (`signature:label:receiver:lamports`)
//! and the dispatcher drops exact repeats, which suppresses duplicates when a
//! slot is processed again after a failure. The seen-set lives in memory only,
//! so duplicates across a restart are still possible.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::dedup::RecentSet;
use crate::types::{Outflow, Slot, WatchedAddress};

/// Default Redis channel for publishing alerts
pub const DEFAULT_CHANNEL: &str = "outflow_alerts";

/// Timeout for Telegram API calls
pub const TELEGRAM_TIMEOUT_SECS: u64 = 15;

/// Errors that can occur during publishing
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Redis connection error: {0}")]
    Connection(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Alert rejected: {0}")]
    Rejected(String),
}

/// Alert message format
///
/// This is the JSON structure published to Redis; `text` is the
/// human-readable form sent to chat sinks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AlertMessage {
    /// Watched address label
    pub label: String,
    /// Watched address (sender)
    pub address: String,
    pub receiver: String,
    /// Amount in display units
    pub amount: f64,
    /// Amount in base units
    pub lamports: u64,
    pub signature: String,
    pub slot: Slot,
    /// Stable key identifying this outflow
    pub dedup_key: String,
    pub text: String,
    /// Unix timestamp in milliseconds when the alert was generated
    pub timestamp: u64,
}

impl AlertMessage {
    /// Build the alert for an outflow from `watched`
    pub fn new(watched: &WatchedAddress, outflow: &Outflow) -> Self {
        let text = format!(
            "[{}] outflow of {} SOL\nfrom: {}\nto: {}\nslot: {}\ntx: {}",
            watched.label,
            outflow.amount,
            watched.address,
            outflow.receiver,
            outflow.slot,
            outflow.signature,
        );

        AlertMessage {
            label: watched.label.clone(),
            address: watched.address.clone(),
            receiver: outflow.receiver.clone(),
            amount: outflow.amount,
            lamports: outflow.lamports,
            signature: outflow.signature.clone(),
            slot: outflow.slot,
            dedup_key: dedup_key(watched, outflow),
            text,
            timestamp: current_timestamp_millis(),
        }
    }

    /// Serialize the message to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize a message from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Key identifying one outflow across reprocessing
pub fn dedup_key(watched: &WatchedAddress, outflow: &Outflow) -> String {
    format!(
        "{}:{}:{}:{}",
        outflow.signature, watched.label, outflow.receiver, outflow.lamports
    )
}

/// Get current timestamp in milliseconds
pub fn current_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Destination for alert messages
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    async fn send(&self, message: &AlertMessage) -> Result<(), PublishError>;
}

/// Writes alerts to the log only
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl AlertSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, message: &AlertMessage) -> Result<(), PublishError> {
        info!(
            label = %message.label,
            amount = message.amount,
            receiver = %message.receiver,
            slot = message.slot,
            signature = %message.signature,
            "outflow alert"
        );
        Ok(())
    }
}

/// Redis publisher for alert messages
pub struct RedisSink {
    connection: MultiplexedConnection,
    channel: String,
}

impl RedisSink {
    /// Create a new sink with an established Redis connection
    ///
    /// # Arguments
    /// * `connection` - An established Redis multiplexed connection
    /// * `channel` - The pub/sub channel name to publish to
    pub fn new(connection: MultiplexedConnection, channel: impl Into<String>) -> Self {
        Self {
            connection,
            channel: channel.into(),
        }
    }

    /// Connect to `url` and publish on `channel`
    pub async fn connect(url: &str, channel: impl Into<String>) -> Result<Self, PublishError> {
        let client = redis::Client::open(url)?;
        let connection = client.get_multiplexed_async_connection().await?;
        Ok(Self::new(connection, channel))
    }

    /// Get the channel name
    pub fn channel(&self) -> &str {
        &self.channel
    }
}

#[async_trait]
impl AlertSink for RedisSink {
    fn name(&self) -> &str {
        "redis"
    }

    async fn send(&self, message: &AlertMessage) -> Result<(), PublishError> {
        let json = message.to_json()?;
        let mut connection = self.connection.clone();
        let subscribers: i64 = connection.publish(&self.channel, &json).await?;
        debug!(channel = %self.channel, subscribers, "alert published");
        Ok(())
    }
}

/// Telegram chat destination
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_id: String,
}

impl TelegramConfig {
    pub fn is_configured(&self) -> bool {
        !self.bot_token.is_empty() && !self.chat_id.is_empty()
    }
}

/// Sends alert text to a Telegram chat through the Bot API
pub struct TelegramSink {
    config: TelegramConfig,
    client: reqwest::Client,
    api_base: String,
}

impl std::fmt::Debug for TelegramSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramSink")
            .field("chat_id", &self.config.chat_id)
            .field("api_base", &"<redacted>")
            .finish()
    }
}

impl TelegramSink {
    pub fn new(config: TelegramConfig) -> Result<Self, PublishError> {
        let api_base = format!("https://api.telegram.org/bot{}", config.bot_token);
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(TELEGRAM_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            config,
            client,
            api_base,
        })
    }
}

#[async_trait]
impl AlertSink for TelegramSink {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn send(&self, message: &AlertMessage) -> Result<(), PublishError> {
        let response = self
            .client
            .post(format!("{}/sendMessage", self.api_base))
            .json(&json!({
                "chat_id": self.config.chat_id,
                "text": message.text,
                "disable_web_page_preview": true,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(PublishError::Rejected(response.status().to_string()));
        }
        Ok(())
    }
}

/// Fans alerts out to every sink, dropping repeats of the same outflow
pub struct AlertDispatcher {
    sinks: Vec<Arc<dyn AlertSink>>,
    recent: Mutex<RecentSet>,
}

impl AlertDispatcher {
    pub fn new(sinks: Vec<Arc<dyn AlertSink>>) -> Self {
        Self::with_recent(sinks, RecentSet::default())
    }

    pub fn with_recent(sinks: Vec<Arc<dyn AlertSink>>, recent: RecentSet) -> Self {
        Self {
            sinks,
            recent: Mutex::new(recent),
        }
    }

    pub fn sink_names(&self) -> Vec<&str> {
        self.sinks.iter().map(|sink| sink.name()).collect()
    }

    /// Send `message` to every sink
    ///
    /// The dedup key is reserved before the first sink is tried, so
    /// concurrent dispatches of one alert send it once. If the dispatch
    /// panics or is dropped before every sink was tried, the key is released
    /// and the alert is sent again on reprocessing.
    ///
    /// # Returns
    /// `false` if the message was a repeat and nothing was sent
    pub async fn dispatch(&self, message: &AlertMessage) -> bool {
        let fresh = self
            .recent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(&message.dedup_key);
        if !fresh {
            debug!(key = %message.dedup_key, "duplicate alert suppressed");
            return false;
        }
        let mut reservation = Reservation {
            recent: &self.recent,
            key: &message.dedup_key,
            kept: false,
        };

        for sink in &self.sinks {
            if let Err(e) = sink.send(message).await {
                warn!(
                    sink = sink.name(),
                    label = %message.label,
                    signature = %message.signature,
                    error = %e,
                    "alert delivery failed"
                );
            }
        }

        reservation.kept = true;
        true
    }
}

/// A dedup key held while its alert is sent; released on drop unless kept
struct Reservation<'a> {
    recent: &'a Mutex<RecentSet>,
    key: &'a str,
    kept: bool,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.kept {
            debug!(key = %self.key, "alert dispatch interrupted, releasing key");
            self.recent
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(self.key);
        }
    }
}
