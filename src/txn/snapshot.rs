//! Pre-transaction snapshots and rollback restore.
//!
//! Before a transaction mutates anything it archives the state database
//! file plus every file the plan would overwrite. The archive also records
//! which planned paths did **not** exist, so a rollback can delete files the
//! failed transaction created. Archives are `.tar.zst`, like packages.

use crate::config::Config;
use crate::error::{LpmError, Result};
use crate::fsio::{atomic_symlink, safe_copy};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};

/// Index entry stored inside every snapshot archive.
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotIndex {
    /// Root the captured paths are relative to.
    root: String,
    /// Planned paths that did not exist pre-transaction (absolute).
    missing: Vec<String>,
    /// Database file name under `db/`, when captured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    db_name: Option<String>,
}

const INDEX_NAME: &str = "snapshot.json";

/// What: Archive the pre-transaction state of the given paths.
///
/// Inputs:
/// - `config`: Supplies the snapshot directory, DB path, and root.
/// - `tag`: Human-readable snapshot tag (also used in the file name).
/// - `paths`: Absolute manifest paths the transaction plans to write or
///   remove.
///
/// Output:
/// - Path of the created archive.
pub fn create_snapshot(config: &Config, tag: &str, paths: &[String]) -> Result<PathBuf> {
    let dir = config.snapshot_dir();
    std::fs::create_dir_all(&dir)?;
    let ts = crate::txn::unix_now();
    let safe_tag: String = tag
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    let archive_path = dir.join(format!("snap-{ts}-{}-{safe_tag}.tar.zst", std::process::id()));

    let file = File::create(&archive_path)?;
    let encoder = zstd::stream::write::Encoder::new(file, 3)?;
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    let mut missing = Vec::new();
    let db_path = config.db_path();
    let db_name = if db_path.is_file() {
        let name = db_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "state.db".to_string());
        builder.append_path_with_name(&db_path, format!("db/{name}"))?;
        Some(name)
    } else {
        None
    };

    for path in paths {
        let rel = path.trim_start_matches('/');
        let on_disk = config.root.join(rel);
        if on_disk.symlink_metadata().is_ok() {
            builder.append_path_with_name(&on_disk, format!("root/{rel}"))?;
        } else {
            missing.push(path.clone());
        }
    }

    let index = SnapshotIndex {
        root: config.root.display().to_string(),
        missing,
        db_name,
    };
    let index_json = serde_json::to_vec_pretty(&index)?;
    let mut header = tar::Header::new_gnu();
    header.set_size(index_json.len() as u64);
    header.set_mode(0o600);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    builder.append_data(&mut header, INDEX_NAME, index_json.as_slice())?;

    let encoder = builder.into_inner()?;
    let file = encoder.finish()?;
    file.sync_all()?;
    Ok(archive_path)
}

/// What: Restore a snapshot onto the filesystem.
///
/// Inputs:
/// - `config`: Supplies the root (and DB path when `restore_db`).
/// - `archive`: Snapshot archive created by [`create_snapshot`].
/// - `restore_db`: Also restore the captured database file. Leave false
///   while a store handle is open; the store's own rollback covers the DB.
///
/// Details:
/// - Captured files are written back atomically (symlinks re-created);
///   paths recorded as missing are deleted so files the failed transaction
///   created disappear again.
pub fn restore_snapshot(config: &Config, archive: &Path, restore_db: bool) -> Result<()> {
    let scratch = tempfile::Builder::new().prefix("lpm-restore-").tempdir()?;
    let file = File::open(archive)?;
    let decoder = zstd::stream::read::Decoder::new(file)?;
    let mut tar = tar::Archive::new(decoder);
    tar.set_preserve_permissions(true);
    tar.unpack(scratch.path())?;

    let index_path = scratch.path().join(INDEX_NAME);
    let index: SnapshotIndex = serde_json::from_slice(&std::fs::read(&index_path).map_err(
        |err| LpmError::InvalidInput(format!("snapshot {} has no index: {err}", archive.display())),
    )?)?;

    let root_dir = scratch.path().join("root");
    if root_dir.is_dir() {
        restore_tree(&root_dir, &root_dir, &config.root)?;
    }

    for path in &index.missing {
        let rel = path.trim_start_matches('/');
        let on_disk = config.root.join(rel);
        match std::fs::remove_file(&on_disk) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
    }

    if restore_db
        && let Some(db_name) = &index.db_name
    {
        let captured = scratch.path().join("db").join(db_name);
        if captured.is_file() {
            safe_copy(&captured, &config.db_path(), Some(0o644))?;
        }
    }
    Ok(())
}

fn restore_tree(current: &Path, base: &Path, root: &Path) -> Result<()> {
    for entry in std::fs::read_dir(current)? {
        let entry = entry?;
        let path = entry.path();
        let rel = path
            .strip_prefix(base)
            .map_err(|_| LpmError::InvalidInput("snapshot path escapes base".to_string()))?;
        let dest = root.join(rel);
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            std::fs::create_dir_all(&dest)?;
            restore_tree(&path, base, root)?;
        } else if file_type.is_symlink() {
            let target = std::fs::read_link(&path)?;
            atomic_symlink(&target, &dest)?;
        } else {
            use std::os::unix::fs::PermissionsExt;
            let mode = entry.metadata()?.permissions().mode() & 0o7777;
            safe_copy(&path, &dest, Some(mode))?;
        }
    }
    Ok(())
}
