//! Snapshot persistence
//!
//! The node owns no storage format. It captures its directory and ledger as
//! a [`Snapshot`] on shutdown and hands it to a [`Persistence`] adapter;
//! on startup it restores whatever the adapter returns, re-verifying every
//! record since the file may have been edited.

use crate::agent::index::CapabilityIndex;
use crate::protocol::messages::{AgentRecord, ReputationEntry, Withdrawal};
use crate::reputation::ReputationLedger;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Snapshot I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Snapshot is not valid JSON: {0}")]
    Format(#[from] serde_json::Error),
}

/// Point-in-time copy of the directory and ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub saved_at: DateTime<Utc>,
    #[serde(default)]
    pub records: Vec<AgentRecord>,
    #[serde(default)]
    pub tombstones: Vec<Withdrawal>,
    #[serde(default)]
    pub entries: Vec<ReputationEntry>,
}

/// Counts from [`Snapshot::restore`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    pub records: usize,
    pub tombstones: usize,
    pub entries: usize,
    pub rejected: usize,
}

impl Snapshot {
    pub fn capture(index: &CapabilityIndex, ledger: &ReputationLedger) -> Self {
        Self {
            saved_at: Utc::now(),
            records: index.records(),
            tombstones: index.tombstones(),
            entries: ledger.entries(),
        }
    }

    /// Load into `index` and `ledger` with the same rules gossip applies:
    /// verified items only, never replacing anything newer
    pub fn restore(self, index: &CapabilityIndex, ledger: &ReputationLedger) -> RestoreSummary {
        let mut summary = RestoreSummary::default();

        for record in self.records {
            if let Err(e) = record.verify() {
                warn!(agent_id = %record.agent_id, error = %e, "Dropping invalid record from snapshot");
                summary.rejected += 1;
                continue;
            }
            if index.upsert(record).is_applied() {
                summary.records += 1;
            }
        }
        for tombstone in self.tombstones {
            if let Err(e) = tombstone.verify() {
                warn!(agent_id = %tombstone.agent_id, error = %e, "Dropping invalid withdrawal from snapshot");
                summary.rejected += 1;
                continue;
            }
            if index.withdraw(tombstone) {
                summary.tombstones += 1;
            }
        }

        let (valid, invalid): (Vec<_>, Vec<_>) = self
            .entries
            .into_iter()
            .partition(|entry| entry.validate().is_ok());
        summary.rejected += invalid.len();
        summary.entries = ledger.merge(valid).len();

        info!(
            records = summary.records,
            tombstones = summary.tombstones,
            entries = summary.entries,
            rejected = summary.rejected,
            "Restored snapshot"
        );
        summary
    }
}

/// Load/dump hooks for node state
pub trait Persistence: Send + Sync {
    /// The last dumped snapshot, `None` if there is none yet
    fn load(&self) -> Result<Option<Snapshot>, PersistenceError>;

    fn dump(&self, snapshot: &Snapshot) -> Result<(), PersistenceError>;
}

/// Snapshot stored as pretty JSON in one file, replaced atomically
#[derive(Debug, Clone)]
pub struct JsonFilePersistence {
    path: PathBuf,
}

impl JsonFilePersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> PersistenceError {
        PersistenceError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl Persistence for JsonFilePersistence {
    fn load(&self) -> Result<Option<Snapshot>, PersistenceError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No snapshot file yet");
                return Ok(None);
            }
            Err(e) => return Err(self.io_error(e)),
        };
        Ok(Some(serde_json::from_str(&content)?))
    }

    fn dump(&self, snapshot: &Snapshot) -> Result<(), PersistenceError> {
        let body = serde_json::to_vec_pretty(snapshot)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }

        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, body).map_err(|e| self.io_error(e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| self.io_error(e))?;
        info!(
            path = %self.path.display(),
            records = snapshot.records.len(),
            entries = snapshot.entries.len(),
            "Snapshot written"
        );
        Ok(())
    }
}
