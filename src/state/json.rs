//! JSON-backed fallback state store.
//!
//! Some deployment targets ship without working SQLite; this backend keeps
//! the whole database as one JSON document, held in memory and written
//! atomically on commit (or immediately for mutations outside a
//! transaction). Rollback restores a deep copy taken at `begin`.

use crate::error::Result;
use crate::fsio::safe_write;
use crate::state::{StateStore, nested_txn_error, no_txn_error};
use crate::types::{HistoryEntry, InstalledRecord, Snapshot};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct Counters {
    #[serde(default)]
    history: i64,
    #[serde(default)]
    snapshots: i64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct Document {
    #[serde(default)]
    installed: BTreeMap<String, InstalledRecord>,
    #[serde(default)]
    history: Vec<HistoryEntry>,
    #[serde(default)]
    snapshots: Vec<Snapshot>,
    #[serde(default, rename = "_counters")]
    counters: Counters,
}

/// State store over a single JSON document.
#[derive(Debug)]
pub struct JsonStore {
    path: PathBuf,
    data: Document,
    backup: Option<Document>,
}

impl JsonStore {
    /// Open (and create) the JSON database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let data = if path.exists() {
            match serde_json::from_slice(&std::fs::read(path)?) {
                Ok(doc) => doc,
                Err(err) => {
                    tracing::warn!(
                        "state file {} unreadable ({err}), starting empty",
                        path.display()
                    );
                    Document::default()
                }
            }
        } else {
            Document::default()
        };
        Ok(Self { path: path.to_path_buf(), data, backup: None })
    }

    fn in_txn(&self) -> bool {
        self.backup.is_some()
    }

    fn save(&self) -> Result<()> {
        let payload = serde_json::to_vec_pretty(&self.data)?;
        safe_write(&self.path, &payload, Some(0o644))
    }

    /// Persist immediately unless a transaction will do it at commit.
    fn autosave(&self) -> Result<()> {
        if self.in_txn() { Ok(()) } else { self.save() }
    }
}

impl StateStore for JsonStore {
    fn begin(&mut self) -> Result<()> {
        if self.in_txn() {
            return Err(nested_txn_error());
        }
        self.backup = Some(self.data.clone());
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        if !self.in_txn() {
            return Err(no_txn_error());
        }
        self.save()?;
        self.backup = None;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        match self.backup.take() {
            Some(backup) => {
                self.data = backup;
                Ok(())
            }
            None => Err(no_txn_error()),
        }
    }

    fn upsert_installed(&mut self, record: &InstalledRecord) -> Result<()> {
        self.data.installed.insert(record.name.clone(), record.clone());
        self.autosave()
    }

    fn remove_installed(&mut self, name: &str) -> Result<()> {
        self.data.installed.remove(name);
        self.autosave()
    }

    fn get_installed(&self, name: &str) -> Result<Option<InstalledRecord>> {
        Ok(self.data.installed.get(name).cloned())
    }

    fn all_installed(&self) -> Result<Vec<InstalledRecord>> {
        Ok(self.data.installed.values().cloned().collect())
    }

    fn append_history(&mut self, entry: &HistoryEntry) -> Result<i64> {
        self.data.counters.history += 1;
        let id = self.data.counters.history;
        let mut entry = entry.clone();
        entry.id = id;
        self.data.history.push(entry);
        self.autosave()?;
        Ok(id)
    }

    fn recent_history(&self, limit: usize) -> Result<Vec<HistoryEntry>> {
        Ok(self.data.history.iter().rev().take(limit).cloned().collect())
    }

    fn add_snapshot(&mut self, ts: i64, tag: &str, archive: &str) -> Result<i64> {
        self.data.counters.snapshots += 1;
        let id = self.data.counters.snapshots;
        self.data.snapshots.push(Snapshot {
            id,
            ts,
            tag: tag.to_string(),
            archive: archive.to_string(),
        });
        self.autosave()?;
        Ok(id)
    }

    fn snapshots(&self) -> Result<Vec<Snapshot>> {
        Ok(self.data.snapshots.clone())
    }

    fn delete_snapshot(&mut self, id: i64) -> Result<()> {
        self.data.snapshots.retain(|s| s.id != id);
        self.autosave()
    }
}
