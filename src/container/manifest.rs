//! Manifest collection over a staged tree.

use crate::container::{sha256_bytes, sha256_file};
use crate::error::Result;
use crate::types::ManifestEntry;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use walkdir::WalkDir;

/// What: Walk a staged tree and record every file and symlink.
///
/// Inputs:
/// - `stagedir`: Root of the staged tree.
///
/// Output:
/// - Entries sorted by path. Paths are absolute (leading `/`) relative to
///   the stage root. Directories are not recorded; the installer creates
///   parents on demand, and manifest order guarantees parents sort before
///   their children.
///
/// Details:
/// - Files record `size`, `mode`, and the payload digest.
/// - Symlinks record `link` and the digest of the link-target string, so a
///   manifest can be validated without following the link.
pub fn collect_manifest(stagedir: &Path) -> Result<Vec<ManifestEntry>> {
    let mut entries = Vec::new();
    for item in WalkDir::new(stagedir).sort_by_file_name() {
        let item = item.map_err(|err| {
            crate::error::LpmError::InvalidInput(format!(
                "cannot walk {}: {err}",
                stagedir.display()
            ))
        })?;
        let path = item.path();
        if path == stagedir {
            continue;
        }
        let rel = path
            .strip_prefix(stagedir)
            .map_err(|_| {
                crate::error::LpmError::InvalidInput(format!(
                    "path escapes stage dir: {}",
                    path.display()
                ))
            })?
            .to_string_lossy()
            .into_owned();
        let abs = format!("/{rel}");

        let file_type = item.file_type();
        if file_type.is_symlink() {
            let target = std::fs::read_link(path)?;
            let target_text = target.to_string_lossy().into_owned();
            entries.push(ManifestEntry {
                path: abs,
                size: 0,
                sha256: sha256_bytes(target_text.as_bytes()),
                mode: None,
                link: Some(target_text),
                keep: false,
            });
        } else if file_type.is_file() {
            let meta = item.metadata().map_err(|err| {
                crate::error::LpmError::InvalidInput(format!(
                    "cannot stat {}: {err}",
                    path.display()
                ))
            })?;
            entries.push(ManifestEntry {
                path: abs,
                size: meta.len(),
                sha256: sha256_file(path)?,
                mode: Some(meta.permissions().mode() & 0o7777),
                link: None,
                keep: false,
            });
        }
    }
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(entries)
}
