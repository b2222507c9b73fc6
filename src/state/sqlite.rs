//! SQLite backend of the state store.

use crate::error::Result;
use crate::state::{StateStore, nested_txn_error, no_txn_error};
use crate::types::{HistoryEntry, InstalledRecord, ManifestEntry, Snapshot};
use rusqlite::{Connection, params};
use std::path::Path;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS installed(
    name TEXT PRIMARY KEY,
    version TEXT NOT NULL,
    release TEXT NOT NULL DEFAULT '',
    arch TEXT NOT NULL DEFAULT '',
    provides TEXT NOT NULL DEFAULT '[]',
    symbols TEXT NOT NULL DEFAULT '[]',
    requires TEXT NOT NULL DEFAULT '[]',
    manifest TEXT NOT NULL DEFAULT '[]',
    explicit INTEGER NOT NULL DEFAULT 0,
    install_time INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS history(
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ts INTEGER NOT NULL,
    action TEXT NOT NULL,
    name TEXT NOT NULL,
    from_ver TEXT,
    to_ver TEXT,
    details TEXT NOT NULL DEFAULT ''
);
CREATE TABLE IF NOT EXISTS snapshots(
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ts INTEGER NOT NULL,
    tag TEXT NOT NULL,
    archive TEXT NOT NULL
);
";

/// State store over a SQLite database file.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
    in_txn: bool,
}

impl SqliteStore {
    /// Open (and create/migrate) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        Ok(Self { conn, in_txn: false })
    }

    fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<InstalledRecord> {
        let provides: String = row.get(4)?;
        let symbols: String = row.get(5)?;
        let requires: String = row.get(6)?;
        let manifest: String = row.get(7)?;
        Ok(InstalledRecord {
            name: row.get(0)?,
            version: row.get(1)?,
            release: row.get(2)?,
            arch: row.get(3)?,
            provides: serde_json::from_str(&provides).unwrap_or_default(),
            symbols: serde_json::from_str(&symbols).unwrap_or_default(),
            requires: serde_json::from_str(&requires).unwrap_or_default(),
            manifest: serde_json::from_str::<Vec<ManifestEntry>>(&manifest).unwrap_or_default(),
            explicit: row.get(8)?,
            install_time: row.get(9)?,
        })
    }
}

const SELECT_INSTALLED: &str = "SELECT name, version, release, arch, provides, symbols, \
     requires, manifest, explicit, install_time FROM installed";

impl StateStore for SqliteStore {
    fn begin(&mut self) -> Result<()> {
        if self.in_txn {
            return Err(nested_txn_error());
        }
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        self.in_txn = true;
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        if !self.in_txn {
            return Err(no_txn_error());
        }
        self.conn.execute_batch("COMMIT")?;
        self.in_txn = false;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        if !self.in_txn {
            return Err(no_txn_error());
        }
        self.conn.execute_batch("ROLLBACK")?;
        self.in_txn = false;
        Ok(())
    }

    fn upsert_installed(&mut self, record: &InstalledRecord) -> Result<()> {
        self.conn.execute(
            "REPLACE INTO installed(name, version, release, arch, provides, symbols, \
             requires, manifest, explicit, install_time) VALUES(?,?,?,?,?,?,?,?,?,?)",
            params![
                record.name,
                record.version,
                record.release,
                record.arch,
                serde_json::to_string(&record.provides)?,
                serde_json::to_string(&record.symbols)?,
                serde_json::to_string(&record.requires)?,
                serde_json::to_string(&record.manifest)?,
                record.explicit,
                record.install_time,
            ],
        )?;
        Ok(())
    }

    fn remove_installed(&mut self, name: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM installed WHERE name = ?", params![name])?;
        Ok(())
    }

    fn get_installed(&self, name: &str) -> Result<Option<InstalledRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{SELECT_INSTALLED} WHERE name = ?"))?;
        let mut rows = stmt.query_map(params![name], Self::row_to_record)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    fn all_installed(&self) -> Result<Vec<InstalledRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{SELECT_INSTALLED} ORDER BY name"))?;
        let rows = stmt.query_map([], Self::row_to_record)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn append_history(&mut self, entry: &HistoryEntry) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO history(ts, action, name, from_ver, to_ver, details) \
             VALUES(?,?,?,?,?,?)",
            params![
                entry.ts,
                entry.action,
                entry.name,
                entry.from_ver,
                entry.to_ver,
                entry.details,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn recent_history(&self, limit: usize) -> Result<Vec<HistoryEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, ts, action, name, from_ver, to_ver, details FROM history \
             ORDER BY id DESC LIMIT ?",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(HistoryEntry {
                id: row.get(0)?,
                ts: row.get(1)?,
                action: row.get(2)?,
                name: row.get(3)?,
                from_ver: row.get(4)?,
                to_ver: row.get(5)?,
                details: row.get(6)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn add_snapshot(&mut self, ts: i64, tag: &str, archive: &str) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO snapshots(ts, tag, archive) VALUES(?,?,?)",
            params![ts, tag, archive],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn snapshots(&self) -> Result<Vec<Snapshot>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, ts, tag, archive FROM snapshots ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok(Snapshot {
                id: row.get(0)?,
                ts: row.get(1)?,
                tag: row.get(2)?,
                archive: row.get(3)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn delete_snapshot(&mut self, id: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM snapshots WHERE id = ?", params![id])?;
        Ok(())
    }
}
