//! Persistent state: installed packages, history, snapshots.
//!
//! The persistence contract is the [`StateStore`] trait; the transaction
//! engine only ever talks to `dyn StateStore`. Two backends satisfy it: a
//! SQLite database (the default) and a JSON-backed store for environments
//! without working SQLite. Tests plug whichever is convenient.

pub mod json;
pub mod sqlite;

use crate::error::{LpmError, Result};
use crate::types::{HistoryEntry, InstalledRecord, Snapshot};
use std::path::Path;

/// Row operations plus a single-level transaction protocol.
///
/// `begin` opens an in-memory transaction, `commit` promotes it atomically,
/// `rollback` restores the pre-`begin` state. Nesting is rejected.
pub trait StateStore {
    /// Start a transaction. Fails if one is already open.
    fn begin(&mut self) -> Result<()>;
    /// Atomically promote the open transaction.
    fn commit(&mut self) -> Result<()>;
    /// Discard the open transaction, restoring the pre-`begin` state.
    fn rollback(&mut self) -> Result<()>;

    /// Insert or replace the row for `record.name`.
    fn upsert_installed(&mut self, record: &InstalledRecord) -> Result<()>;
    /// Delete the row for `name` (no-op when absent).
    fn remove_installed(&mut self, name: &str) -> Result<()>;
    /// Fetch one installed row.
    fn get_installed(&self, name: &str) -> Result<Option<InstalledRecord>>;
    /// All installed rows, ordered by name.
    fn all_installed(&self) -> Result<Vec<InstalledRecord>>;

    /// Append a history row, returning its id.
    fn append_history(&mut self, entry: &HistoryEntry) -> Result<i64>;
    /// The most recent history rows, newest first.
    fn recent_history(&self, limit: usize) -> Result<Vec<HistoryEntry>>;

    /// Record a snapshot row, returning its id.
    fn add_snapshot(&mut self, ts: i64, tag: &str, archive: &str) -> Result<i64>;
    /// All snapshot rows, oldest first.
    fn snapshots(&self) -> Result<Vec<Snapshot>>;
    /// Delete one snapshot row.
    fn delete_snapshot(&mut self, id: i64) -> Result<()>;
}

/// What: Open the state store at `path`.
///
/// Inputs:
/// - `path`: State database file (usually `<state_dir>/state.db`).
/// - `prefer_json`: Force the JSON backend for new databases.
///
/// Details:
/// - An existing file is sniffed: the SQLite magic selects the SQLite
///   backend, anything else the JSON backend, regardless of `prefer_json` —
///   the on-disk format wins over preference.
pub fn open_store(path: &Path, prefer_json: bool) -> Result<Box<dyn StateStore>> {
    if path.exists() {
        let mut magic = [0u8; 16];
        let sniffed = std::fs::File::open(path).and_then(|mut f| {
            use std::io::Read;
            f.read_exact(&mut magic)
        });
        if sniffed.is_ok() && &magic == b"SQLite format 3\0" {
            return Ok(Box::new(sqlite::SqliteStore::open(path)?));
        }
        if sniffed.is_ok() {
            tracing::debug!("state file {} is not SQLite, using JSON backend", path.display());
            return Ok(Box::new(json::JsonStore::open(path)?));
        }
    }
    if prefer_json {
        return Ok(Box::new(json::JsonStore::open(path)?));
    }
    match sqlite::SqliteStore::open(path) {
        Ok(store) => Ok(Box::new(store)),
        Err(err) => {
            tracing::warn!("SQLite unavailable ({err}), falling back to JSON state store");
            Ok(Box::new(json::JsonStore::open(path)?))
        }
    }
}

pub(crate) fn nested_txn_error() -> LpmError {
    LpmError::InvalidInput("nested state transactions are not supported".to_string())
}

pub(crate) fn no_txn_error() -> LpmError {
    LpmError::InvalidInput("no state transaction is open".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, version: &str, explicit: i64) -> InstalledRecord {
        InstalledRecord {
            name: name.into(),
            version: version.into(),
            release: "1".into(),
            arch: "noarch".into(),
            provides: vec![name.into()],
            explicit,
            install_time: 1_700_000_000,
            ..InstalledRecord::default()
        }
    }

    fn exercise_store(mut store: Box<dyn StateStore>) {
        // Upsert, fetch, replace.
        store.begin().expect("begin");
        store.upsert_installed(&record("vim", "9.0", 1)).expect("upsert");
        store.upsert_installed(&record("zlib", "1.3", 0)).expect("upsert");
        store.commit().expect("commit");
        assert_eq!(
            store.get_installed("vim").expect("get").expect("row").version,
            "9.0"
        );
        store.begin().expect("begin");
        store.upsert_installed(&record("vim", "9.1", 1)).expect("upsert");
        store.commit().expect("commit");
        let rows = store.all_installed().expect("all");
        assert_eq!(rows.len(), 2);
        assert_eq!(
            store.get_installed("vim").expect("get").expect("row").version,
            "9.1"
        );

        // Rollback restores the pre-begin state.
        store.begin().expect("begin");
        store.remove_installed("vim").expect("remove");
        assert!(store.get_installed("vim").expect("get").is_none());
        store.rollback().expect("rollback");
        assert!(store.get_installed("vim").expect("get").is_some());

        // Nested transactions are refused.
        store.begin().expect("begin");
        assert!(store.begin().is_err());
        store.rollback().expect("rollback");

        // History appends and reads newest-first.
        store.begin().expect("begin");
        for (i, action) in ["install", "upgrade"].iter().enumerate() {
            store
                .append_history(&HistoryEntry {
                    ts: 1_700_000_000 + i as i64,
                    action: (*action).into(),
                    name: "vim".into(),
                    ..HistoryEntry::default()
                })
                .expect("history");
        }
        store.commit().expect("commit");
        let history = store.recent_history(10).expect("recent");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].action, "upgrade");

        // Snapshots append and delete.
        store.begin().expect("begin");
        let id = store
            .add_snapshot(1_700_000_123, "install vim", "/tmp/snap.tar.zst")
            .expect("snapshot");
        store.commit().expect("commit");
        assert_eq!(store.snapshots().expect("snapshots").len(), 1);
        store.begin().expect("begin");
        store.delete_snapshot(id).expect("delete");
        store.commit().expect("commit");
        assert!(store.snapshots().expect("snapshots").is_empty());
    }

    #[test]
    fn test_sqlite_store_contract() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(&dir.path().join("state.db"), false).expect("open");
        exercise_store(store);
    }

    #[test]
    fn test_json_store_contract() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(&dir.path().join("state.db"), true).expect("open");
        exercise_store(store);
    }

    #[test]
    fn test_open_store_sniffs_existing_format() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state.db");
        {
            let mut store = open_store(&path, true).expect("open json");
            store.begin().expect("begin");
            store.upsert_installed(&record("vim", "9.0", 1)).expect("upsert");
            store.commit().expect("commit");
        }
        // Reopen with the SQLite preference; the JSON content must win.
        let store = open_store(&path, false).expect("reopen");
        assert!(store.get_installed("vim").expect("get").is_some());
    }

    #[test]
    fn test_json_store_persists_across_opens() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state.db");
        {
            let mut store = open_store(&path, true).expect("open");
            store.begin().expect("begin");
            store.upsert_installed(&record("zlib", "1.3", 0)).expect("upsert");
            store.commit().expect("commit");
        }
        let store = open_store(&path, true).expect("reopen");
        assert_eq!(
            store.get_installed("zlib").expect("get").expect("row").version,
            "1.3"
        );
    }
}
