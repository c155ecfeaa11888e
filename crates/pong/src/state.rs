//! Durable progress record and its stores.
//!
//! The record is small and rewritten whole on every mutation. [JsonFileStore] replaces the
//! file atomically (temp file, fsync, rename), so a crash leaves either the old or the new
//! record on disk.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("state file {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("state encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Persisted progress: start block, reconciled height, and responded-to event ids.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressState {
    #[serde(rename = "startHeight", alias = "startBlock")]
    pub start_block: Option<u64>,
    #[serde(rename = "lastProcessedHeight", alias = "lastProcessedBlock")]
    pub last_processed_block: u64,
    /// Ids answered with a confirmed pong, in response order.
    processed_txs: Vec<String>,
    /// Ids whose pong was rejected; skipped permanently.
    #[serde(default)]
    rejected_txs: Vec<String>,
    #[serde(skip)]
    seen: HashSet<String>,
}

impl PartialEq for ProgressState {
    fn eq(&self, other: &Self) -> bool {
        self.start_block == other.start_block
            && self.last_processed_block == other.last_processed_block
            && self.processed_txs == other.processed_txs
            && self.rejected_txs == other.rejected_txs
    }
}

impl ProgressState {
    /// Assign the start block once; `last_processed_block` becomes `start - 1`.
    /// Returns false (no change) if a start block is already set.
    /// Genesis holds no transactions, so a start of 0 is recorded as 1.
    pub fn assign_start(&mut self, start: u64) -> bool {
        if self.start_block.is_some() {
            return false;
        }
        let start = start.max(1);
        self.start_block = Some(start);
        self.last_processed_block = start.saturating_sub(1);
        true
    }

    pub fn is_seen(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    pub fn is_rejected(&self, id: &str) -> bool {
        self.rejected_txs.iter().any(|r| r == id)
    }

    /// Record a confirmed response. Returns false if the id was already recorded.
    pub fn mark_seen(&mut self, id: &str) -> bool {
        if !self.seen.insert(id.to_string()) {
            return false;
        }
        self.processed_txs.push(id.to_string());
        true
    }

    pub fn mark_rejected(&mut self, id: &str) {
        if !self.is_rejected(id) {
            self.rejected_txs.push(id.to_string());
        }
    }

    /// Move the reconciled height forward; never backwards.
    pub fn advance_to(&mut self, height: u64) {
        self.last_processed_block = self.last_processed_block.max(height);
    }

    pub fn processed_txs(&self) -> &[String] {
        &self.processed_txs
    }

    pub fn rejected_txs(&self) -> &[String] {
        &self.rejected_txs
    }

    fn rebuild_index(&mut self) {
        self.seen = self.processed_txs.iter().cloned().collect();
    }

    fn validate(&self) -> Result<(), String> {
        if let Some(start) = self.start_block {
            if self.last_processed_block < start.saturating_sub(1) {
                return Err(format!(
                    "lastProcessedHeight {} below startHeight {} - 1",
                    self.last_processed_block, start
                ));
            }
        }
        Ok(())
    }

    /// Parse a persisted record, rebuilding the dedup index and checking invariants.
    pub fn from_json(bytes: &[u8]) -> Result<Self, String> {
        let mut state: ProgressState = serde_json::from_slice(bytes).map_err(|e| e.to_string())?;
        state.rebuild_index();
        state.validate()?;
        Ok(state)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, StateError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }
}

/// Durable home of the [ProgressState]. Single writer; `save` must be crash-atomic.
pub trait StateStore: Send {
    /// Load the persisted state, or a fresh default if none exists yet.
    fn load(&self) -> Result<ProgressState, StateError>;
    fn save(&self, state: &ProgressState) -> Result<(), StateError>;
}

/// Pretty-JSON file store with atomic replace.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn io_err(&self, source: std::io::Error) -> StateError {
        StateError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl StateStore for JsonFileStore {
    fn load(&self) -> Result<ProgressState, StateError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ProgressState::default());
            }
            Err(e) => return Err(self.io_err(e)),
        };
        ProgressState::from_json(&bytes).map_err(|reason| StateError::Corrupt {
            path: self.path.clone(),
            reason,
        })
    }

    fn save(&self, state: &ProgressState) -> Result<(), StateError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| self.io_err(e))?;
        }
        let bytes = state.to_json()?;
        let temp_path = self.temp_path();
        let mut file = std::fs::File::create(&temp_path).map_err(|e| self.io_err(e))?;
        file.write_all(&bytes).map_err(|e| self.io_err(e))?;
        file.sync_all().map_err(|e| self.io_err(e))?;
        drop(file);
        std::fs::rename(&temp_path, &self.path).map_err(|e| self.io_err(e))?;
        Ok(())
    }
}

/// In-memory store. Clones share the same record, so a test can keep a handle and
/// inspect what the engine persisted.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Option<ProgressState>>>,
    saves: Arc<Mutex<u64>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: ProgressState) -> Self {
        let store = Self::default();
        *store.inner.lock().unwrap_or_else(|e| e.into_inner()) = Some(state);
        store
    }

    /// Last saved state, if any.
    pub fn snapshot(&self) -> Option<ProgressState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn save_count(&self) -> u64 {
        *self.saves.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl StateStore for MemoryStore {
    fn load(&self) -> Result<ProgressState, StateError> {
        let mut state = self.snapshot().unwrap_or_default();
        state.rebuild_index();
        Ok(state)
    }

    fn save(&self, state: &ProgressState) -> Result<(), StateError> {
        *self.inner.lock().unwrap_or_else(|e| e.into_inner()) = Some(state.clone());
        *self.saves.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        Ok(())
    }
}
