//! Runtime configuration
//!
//! Everything is read from environment variables in one pass and validated
//! before any connection is made. Watched addresses are numbered entries:
//!
//! ```text
//! WATCH_1_LABEL=treasury
//! WATCH_1_ADDRESS=9WzDXwBbmkg8ZTbNMqUxvQRAyrZzDsGYdLVL9zYtAWWM
//! WATCH_1_RANGES=100-500,1000
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::checkpoint::DEFAULT_CHECKPOINT_PATH;
use crate::filter::{format_ranges, parse_ranges};
use crate::ledger::Commitment;
use crate::publisher::{TelegramConfig, DEFAULT_CHANNEL};
use crate::scheduler::{
    SchedulerConfig, DEFAULT_FETCH_CONCURRENCY, DEFAULT_MAX_CATCHUP_SLOTS,
    DEFAULT_MAX_IN_FLIGHT_SLOTS, DEFAULT_PROCESS_CONCURRENCY,
};
use crate::types::WatchedAddress;

/// Default time allowed for in-flight work to finish on shutdown
pub const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 10;

/// Length of a decoded account address
pub const ADDRESS_LEN: usize = 32;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Missing required variable {0}")]
    MissingVar(&'static str),

    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: String, value: String },

    #[error("Duplicate watch label '{0}'")]
    DuplicateLabel(String),

    #[error("Invalid address for '{label}': {reason}")]
    InvalidAddress { label: String, reason: String },

    #[error("Watch entry {0} needs both LABEL and ADDRESS")]
    IncompleteEntry(u32),

    #[error("No watched addresses configured")]
    NoWatchedAddresses,
}

/// How new activity is discovered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IngestMode {
    /// Follow slot updates and scan every block
    #[default]
    Blocks,
    /// Follow per-address log notifications
    Logs,
}

impl fmt::Display for IngestMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngestMode::Blocks => f.write_str("blocks"),
            IngestMode::Logs => f.write_str("logs"),
        }
    }
}

impl FromStr for IngestMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "blocks" => Ok(IngestMode::Blocks),
            "logs" => Ok(IngestMode::Logs),
            other => Err(format!("unknown ingest mode '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RedisConfig {
    pub url: String,
    pub channel: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub rpc_url: String,
    pub ws_url: String,
    pub watched: Vec<WatchedAddress>,
    pub mode: IngestMode,
    pub commitment: Commitment,
    pub process_concurrency: usize,
    pub fetch_concurrency: usize,
    pub max_in_flight_slots: usize,
    /// 0 keeps every slot after the checkpoint
    pub max_catchup_slots: u64,
    pub checkpoint_path: String,
    pub include_failed: bool,
    pub drain_timeout: Duration,
    pub redis: Option<RedisConfig>,
    pub telegram: Option<TelegramConfig>,
}

impl Config {
    /// Read the configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(std::env::vars())
    }

    /// Read the configuration from `vars`
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter(|(_, v)| !v.trim().is_empty())
            .collect();
        let get = |name: &str| vars.get(name).map(|v| v.trim().to_string());

        let rpc_url = get("RPC_URL").ok_or(ConfigError::MissingVar("RPC_URL"))?;
        let ws_url = get("WS_URL").unwrap_or_else(|| derive_ws_url(&rpc_url));

        let redis = get("REDIS_URL").map(|url| RedisConfig {
            url,
            channel: get("REDIS_CHANNEL").unwrap_or_else(|| DEFAULT_CHANNEL.to_string()),
        });
        let telegram = Some(TelegramConfig {
            bot_token: get("TELEGRAM_BOT_TOKEN").unwrap_or_default(),
            chat_id: get("TELEGRAM_CHAT_ID").unwrap_or_default(),
        })
        .filter(TelegramConfig::is_configured);

        Ok(Self {
            watched: parse_watch_list(&vars)?,
            mode: parse_or(&vars, "INGEST_MODE", IngestMode::default())?,
            commitment: parse_or(&vars, "COMMITMENT", Commitment::default())?,
            process_concurrency: parse_positive(&vars, "PROCESS_CONCURRENCY", DEFAULT_PROCESS_CONCURRENCY)?,
            fetch_concurrency: parse_positive(&vars, "FETCH_CONCURRENCY", DEFAULT_FETCH_CONCURRENCY)?,
            max_in_flight_slots: parse_positive(&vars, "MAX_IN_FLIGHT_SLOTS", DEFAULT_MAX_IN_FLIGHT_SLOTS)?,
            max_catchup_slots: parse_or(&vars, "MAX_CATCHUP_SLOTS", DEFAULT_MAX_CATCHUP_SLOTS)?,
            checkpoint_path: get("CHECKPOINT_PATH").unwrap_or_else(|| DEFAULT_CHECKPOINT_PATH.to_string()),
            include_failed: parse_bool(&vars, "INCLUDE_FAILED")?,
            drain_timeout: Duration::from_secs(parse_or(
                &vars,
                "DRAIN_TIMEOUT_SECS",
                DEFAULT_DRAIN_TIMEOUT_SECS,
            )?),
            rpc_url,
            ws_url,
            redis,
            telegram,
        })
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            process_concurrency: self.process_concurrency,
            fetch_concurrency: self.fetch_concurrency,
            max_in_flight_slots: self.max_in_flight_slots,
            max_catchup_slots: self.max_catchup_slots,
            ..Default::default()
        }
    }

    /// One line per watched address, for the startup log
    pub fn describe_watch_list(&self) -> Vec<String> {
        self.watched
            .iter()
            .map(|w| format!("{} {} [{}]", w.label, w.address, format_ranges(&w.ranges)))
            .collect()
    }
}

/// WebSocket endpoint matching an HTTP RPC endpoint
pub fn derive_ws_url(rpc_url: &str) -> String {
    if let Some(rest) = rpc_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = rpc_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        rpc_url.to_string()
    }
}

/// Check that `address` is base58 for a 32-byte key
pub fn validate_address(address: &str) -> Result<(), String> {
    let bytes = bs58::decode(address)
        .into_vec()
        .map_err(|e| e.to_string())?;
    if bytes.len() != ADDRESS_LEN {
        return Err(format!("decodes to {} bytes, expected {ADDRESS_LEN}", bytes.len()));
    }
    Ok(())
}

fn parse_watch_list(vars: &HashMap<String, String>) -> Result<Vec<WatchedAddress>, ConfigError> {
    let mut entries: BTreeMap<u32, (Option<String>, Option<String>, Option<String>)> = BTreeMap::new();
    for (key, value) in vars {
        let Some(rest) = key.strip_prefix("WATCH_") else {
            continue;
        };
        let Some((index, field)) = rest.split_once('_') else {
            continue;
        };
        let Ok(index) = index.parse::<u32>() else {
            continue;
        };
        let entry = entries.entry(index).or_default();
        let value = value.trim().to_string();
        match field {
            "LABEL" => entry.0 = Some(value),
            "ADDRESS" => entry.1 = Some(value),
            "RANGES" => entry.2 = Some(value),
            _ => {}
        }
    }

    let mut labels = HashSet::new();
    let mut watched = Vec::with_capacity(entries.len());
    for (index, (label, address, ranges)) in entries {
        let (Some(label), Some(address)) = (label, address) else {
            return Err(ConfigError::IncompleteEntry(index));
        };
        if !labels.insert(label.clone()) {
            return Err(ConfigError::DuplicateLabel(label));
        }
        validate_address(&address).map_err(|reason| ConfigError::InvalidAddress {
            label: label.clone(),
            reason,
        })?;
        watched.push(WatchedAddress {
            ranges: parse_ranges(ranges.as_deref().unwrap_or_default()),
            label,
            address,
        });
    }

    if watched.is_empty() {
        return Err(ConfigError::NoWatchedAddresses);
    }
    Ok(watched)
}

fn parse_or<T: FromStr>(vars: &HashMap<String, String>, name: &str, default: T) -> Result<T, ConfigError> {
    match vars.get(name) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|_| ConfigError::InvalidValue {
            name: name.to_string(),
            value: value.clone(),
        }),
    }
}

fn parse_positive(vars: &HashMap<String, String>, name: &str, default: usize) -> Result<usize, ConfigError> {
    let value = parse_or(vars, name, default)?;
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            name: name.to_string(),
            value: "0".to_string(),
        });
    }
    Ok(value)
}

fn parse_bool(vars: &HashMap<String, String>, name: &str) -> Result<bool, ConfigError> {
    match vars.get(name).map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(false),
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes") => Ok(true),
        Some(v) if matches!(v.as_str(), "0" | "false" | "no") => Ok(false),
        Some(v) => Err(ConfigError::InvalidValue {
            name: name.to_string(),
            value: v,
        }),
    }
}
