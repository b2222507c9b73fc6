//! Atomic file writes, directory syncing, and the global transaction lock.
//!
//! Every state file and every installed payload goes through
//! [`safe_write`]: write into a sibling temp file, fsync it, rename onto the
//! destination, then fsync the parent directory (and any ancestors the call
//! had to create). A crash at any point leaves either the old file or the
//! new file, never a torn one.

use crate::error::{LpmError, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// What: Read the process umask without permanently altering it.
///
/// Details:
/// - `umask(2)` has no read-only query; set-and-restore is the only way.
#[must_use]
pub fn current_umask() -> u32 {
    // SAFETY: umask only mutates process-local state and cannot fail.
    unsafe {
        let previous = libc::umask(0);
        libc::umask(previous);
        previous as u32
    }
}

/// What: fsync a directory so a preceding rename is durable.
///
/// Details:
/// - Failures are swallowed: some filesystems refuse directory fsync and
///   the rename itself already landed.
pub fn fsync_dir(path: &Path) {
    if let Ok(dir) = File::open(path)
        && let Err(err) = dir.sync_all()
    {
        tracing::debug!("fsync of {} failed: {err}", path.display());
    }
}

/// Create the parent chain of `path`, returning the directories that had to
/// be created (deepest last) so callers can fsync them after a rename.
fn create_parents(path: &Path) -> Result<Vec<PathBuf>> {
    let mut created = Vec::new();
    if let Some(parent) = path.parent() {
        let mut missing = Vec::new();
        let mut cursor = parent;
        while !cursor.as_os_str().is_empty() && !cursor.exists() {
            missing.push(cursor.to_path_buf());
            match cursor.parent() {
                Some(next) => cursor = next,
                None => break,
            }
        }
        if !missing.is_empty() {
            fs::create_dir_all(parent)?;
            missing.reverse();
            created = missing;
        }
    }
    Ok(created)
}

/// What: Atomically write `data` to `path`.
///
/// Inputs:
/// - `path`: Final destination.
/// - `data`: Payload bytes.
/// - `mode`: Requested permission bits; `None` requests `0o666`. The active
///   umask is honoured either way.
///
/// Details:
/// - Writes a sibling `.<name>.XXXX.tmp` file, fsyncs it, renames it onto
///   `path`, then fsyncs the parent directory and any ancestors this call
///   created. The temp file is removed on any failure.
pub fn safe_write(path: &Path, data: &[u8], mode: Option<u32>) -> Result<()> {
    let created = create_parents(path)?;
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    let name = path
        .file_name()
        .ok_or_else(|| LpmError::InvalidInput(format!("not a file path: {}", path.display())))?
        .to_string_lossy()
        .into_owned();

    let tmp = tempfile::Builder::new()
        .prefix(&format!(".{name}."))
        .suffix(".tmp")
        .tempfile_in(&parent)?;

    let result: Result<()> = (|| {
        tmp.as_file().write_all(data)?;
        tmp.as_file().sync_all()?;
        let applied = (mode.unwrap_or(0o666)) & !current_umask();
        fs::set_permissions(tmp.path(), fs::Permissions::from_mode(applied))?;
        Ok(())
    })();
    if let Err(err) = result {
        // NamedTempFile cleans up on drop; ENOENT there is fine.
        drop(tmp);
        return Err(err);
    }

    tmp.persist(path)
        .map_err(|err| LpmError::Io(err.error))?;
    fsync_dir(&parent);
    for dir in created {
        fsync_dir(&dir);
    }
    Ok(())
}

/// What: Atomically copy a file to `dest` with the temp-rename protocol.
///
/// Details:
/// - Same durability contract as [`safe_write`], but streams from `src`
///   instead of holding the payload in memory.
pub fn safe_copy(src: &Path, dest: &Path, mode: Option<u32>) -> Result<()> {
    let created = create_parents(dest)?;
    let parent = dest
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    let name = dest
        .file_name()
        .ok_or_else(|| LpmError::InvalidInput(format!("not a file path: {}", dest.display())))?
        .to_string_lossy()
        .into_owned();
    let mut tmp = tempfile::Builder::new()
        .prefix(&format!(".{name}."))
        .suffix(".tmp")
        .tempfile_in(&parent)?;
    let mut reader = File::open(src)?;
    std::io::copy(&mut reader, tmp.as_file_mut())?;
    tmp.as_file().sync_all()?;
    let applied = (mode.unwrap_or(0o666)) & !current_umask();
    fs::set_permissions(tmp.path(), fs::Permissions::from_mode(applied))?;
    tmp.persist(dest).map_err(|err| LpmError::Io(err.error))?;
    fsync_dir(&parent);
    for dir in created {
        fsync_dir(&dir);
    }
    Ok(())
}

/// What: Atomically (re)point a symlink at `target`.
///
/// Details:
/// - Creates a `.<name>.link` sibling and renames it over `dest`, replacing
///   whatever was there.
pub fn atomic_symlink(target: &Path, dest: &Path) -> Result<()> {
    create_parents(dest)?;
    let name = dest
        .file_name()
        .ok_or_else(|| LpmError::InvalidInput(format!("not a file path: {}", dest.display())))?
        .to_string_lossy()
        .into_owned();
    let tmp = dest.with_file_name(format!(".{name}.link"));
    match fs::remove_file(&tmp) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }
    std::os::unix::fs::symlink(target, &tmp)?;
    fs::rename(&tmp, dest)?;
    Ok(())
}

/// Exclusive process-wide transaction lock.
///
/// The lock file carries the holder's PID; a second acquirer reads it back
/// for the error message. Dropping the guard truncates and unlocks.
#[derive(Debug)]
pub struct TransactionLock {
    file: File,
    path: PathBuf,
}

impl TransactionLock {
    /// What: Acquire the lock non-blockingly.
    ///
    /// Inputs:
    /// - `path`: Lock file location (created with umask-honouring 0666).
    ///
    /// Output:
    /// - The guard on success.
    ///
    /// # Errors
    ///
    /// `LpmError::LockHeld` carrying the holder's PID on contention.
    pub fn acquire(path: &Path) -> Result<Self> {
        create_parents(path)?;
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let mode = 0o666 & !current_umask();
        let _ = fs::set_permissions(path, fs::Permissions::from_mode(mode));

        if let Err(err) = file.try_lock_exclusive() {
            let pid = if err.kind() == std::io::ErrorKind::WouldBlock
                || fs2::lock_contended_error().kind() == err.kind()
            {
                Self::read_pid(&mut file)
            } else {
                None
            };
            return Err(LpmError::LockHeld { pid });
        }

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "{}", std::process::id())?;
        file.sync_all()?;
        Ok(Self { file, path: path.to_path_buf() })
    }

    fn read_pid(file: &mut File) -> Option<u32> {
        file.seek(SeekFrom::Start(0)).ok()?;
        let mut buf = String::new();
        file.take(32).read_to_string(&mut buf).ok()?;
        buf.trim().parse().ok()
    }

    /// The lock file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TransactionLock {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
        let _ = self.file.sync_all();
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_write_creates_parents_and_content() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("a/b/c/state.json");
        safe_write(&path, b"{\"ok\":true}", None).expect("write");
        assert_eq!(fs::read(&path).expect("read"), b"{\"ok\":true}");
    }

    #[test]
    fn test_safe_write_replaces_existing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("file");
        safe_write(&path, b"one", None).expect("write");
        safe_write(&path, b"two", None).expect("write");
        assert_eq!(fs::read(&path).expect("read"), b"two");
        // No temp litter left behind.
        let extras: Vec<_> = fs::read_dir(dir.path())
            .expect("read_dir")
            .filter_map(std::result::Result::ok)
            .filter(|e| e.file_name() != "file")
            .collect();
        assert!(extras.is_empty(), "{extras:?}");
    }

    #[test]
    fn test_safe_write_honours_mode() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("script.sh");
        safe_write(&path, b"#!/bin/sh\n", Some(0o755)).expect("write");
        let mode = fs::metadata(&path).expect("stat").permissions().mode() & 0o777;
        assert_eq!(mode, 0o755 & !current_umask());
    }

    #[test]
    fn test_atomic_symlink_replaces() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dest = dir.path().join("link");
        atomic_symlink(Path::new("one"), &dest).expect("symlink");
        atomic_symlink(Path::new("two"), &dest).expect("symlink");
        assert_eq!(fs::read_link(&dest).expect("readlink"), PathBuf::from("two"));
    }

    #[test]
    fn test_lock_contention_reports_pid() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("lock");
        let _guard = TransactionLock::acquire(&path).expect("first acquire");
        let err = TransactionLock::acquire(&path).expect_err("second acquire");
        match err {
            LpmError::LockHeld { pid } => assert_eq!(pid, Some(std::process::id())),
            other => panic!("expected LockHeld, got {other}"),
        }
    }

    #[test]
    fn test_lock_released_on_drop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("lock");
        drop(TransactionLock::acquire(&path).expect("first"));
        let _again = TransactionLock::acquire(&path).expect("reacquire after drop");
    }
}
