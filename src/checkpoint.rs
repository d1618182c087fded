//! Checkpoint Store
//!
//! Durable last-advanced slot per watched label, kept as a single JSON map
//! (`{ "<label>": slot, ... }`). The file is read once when the store is
//! opened; every save rewrites the whole map through a temp file that is
//! renamed over the target.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::types::Slot;

/// Default location of the checkpoint file
pub const DEFAULT_CHECKPOINT_PATH: &str = "~/.outflow-watcher/checkpoint.json";

/// Errors that can occur while persisting checkpoints
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Checkpoint I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Checkpoint serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Expand ~ to home directory in path
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

#[derive(Debug)]
pub struct CheckpointStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, Slot>>,
}

impl CheckpointStore {
    /// Open the store at `path`, reading any existing checkpoints
    ///
    /// A missing file is an empty store. An unreadable or corrupt file is
    /// logged and also treated as empty, so ingestion resumes from the tip.
    pub fn open(path: &str) -> Self {
        let path = expand_path(path);
        let entries = match read_file(&path) {
            Ok(Some(entries)) => {
                info!(path = %path.display(), labels = entries.len(), "loaded checkpoints");
                entries
            }
            Ok(None) => {
                debug!(path = %path.display(), "no checkpoint file yet");
                BTreeMap::new()
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring unreadable checkpoint file");
                BTreeMap::new()
            }
        };

        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<String, Slot>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stored checkpoint for `label`, if any
    pub fn get(&self, label: &str) -> Option<Slot> {
        self.entries().get(label).copied()
    }

    /// Stored checkpoint for `label`, or 0
    pub fn load(&self, label: &str) -> Slot {
        self.get(label).unwrap_or(0)
    }

    /// Lowest checkpoint across `labels`, or `None` if any label has none
    pub fn resume_point<S: AsRef<str>>(&self, labels: &[S]) -> Option<Slot> {
        let entries = self.entries();
        labels
            .iter()
            .map(|label| entries.get(label.as_ref()).copied())
            .collect::<Option<Vec<_>>>()?
            .into_iter()
            .min()
    }

    /// Store `slot` for `label` and persist
    pub fn save(&self, label: &str, slot: Slot) -> Result<(), CheckpointError> {
        self.update(|entries| {
            entries.insert(label.to_string(), slot);
            true
        })
        .map(|_| ())
    }

    /// Store `slot` for every label and persist once
    pub fn save_all<S: AsRef<str>>(&self, labels: &[S], slot: Slot) -> Result<(), CheckpointError> {
        self.update(|entries| {
            for label in labels {
                entries.insert(label.as_ref().to_string(), slot);
            }
            true
        })
        .map(|_| ())
    }

    /// Store `slot` for `label` only if it is past the stored value
    ///
    /// # Returns
    /// `true` if the checkpoint moved
    pub fn advance(&self, label: &str, slot: Slot) -> Result<bool, CheckpointError> {
        self.advance_all(&[label], slot)
    }

    /// Raise every label to `slot`, leaving labels already past it alone
    ///
    /// # Returns
    /// `true` if any checkpoint moved; the file is only written then
    pub fn advance_all<S: AsRef<str>>(&self, labels: &[S], slot: Slot) -> Result<bool, CheckpointError> {
        self.update(|entries| {
            let mut moved = false;
            for label in labels {
                let label = label.as_ref();
                if entries.get(label).is_some_and(|current| *current >= slot) {
                    continue;
                }
                entries.insert(label.to_string(), slot);
                moved = true;
            }
            moved
        })
    }

    /// Apply `change` to a copy of the map and persist it
    ///
    /// The in-memory map only takes the new value once the file is written,
    /// so a failed write leaves both unchanged.
    fn update<F>(&self, change: F) -> Result<bool, CheckpointError>
    where
        F: FnOnce(&mut BTreeMap<String, Slot>) -> bool,
    {
        let mut entries = self.entries();
        let mut next = entries.clone();
        if !change(&mut next) {
            return Ok(false);
        }
        write_file(&self.path, &next)?;
        *entries = next;
        Ok(true)
    }
}

fn read_file(path: &Path) -> Result<Option<BTreeMap<String, Slot>>, CheckpointError> {
    if !path.exists() {
        return Ok(None);
    }
    let text = fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&text)?))
}

fn write_file(path: &Path, entries: &BTreeMap<String, Slot>) -> Result<(), CheckpointError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let json = serde_json::to_string_pretty(entries)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
