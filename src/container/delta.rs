//! Delta patch generation and application via the system `zstd` binary.
//!
//! `zstd --patch-from` has no stable library API, so deltas shell out to
//! the installed tool, exactly as repository publishers do. Everything
//! degrades gracefully: no binary or a too-old binary simply means no delta.

use crate::container::sha256_file;
use crate::error::{LpmError, Result};
use crate::types::DeltaInfo;
use std::path::{Path, PathBuf};
use std::process::Command;

/// What: Locate the system zstd binary.
#[must_use]
pub fn zstd_binary() -> Option<PathBuf> {
    which::which("zstd").ok()
}

/// What: Query the installed zstd version.
///
/// Output:
/// - `(major, minor, patch)`, or `None` when the binary is absent or its
///   version banner cannot be parsed.
#[must_use]
pub fn zstd_version() -> Option<(u32, u32, u32)> {
    let bin = zstd_binary()?;
    let output = Command::new(bin).arg("--version").output().ok()?;
    let text = String::from_utf8_lossy(&output.stdout);
    // Banner shape: "*** zstd command line interface ... v1.5.5 ***".
    for token in text.split_whitespace() {
        let candidate = token.trim_start_matches('v').trim_end_matches(',');
        let parts: Vec<&str> = candidate.split('.').collect();
        if parts.len() == 3
            && let (Ok(major), Ok(minor), Ok(patch)) =
                (parts[0].parse(), parts[1].parse(), parts[2].parse())
        {
            return Some((major, minor, patch));
        }
    }
    None
}

/// Whether `current` meets a `"X.Y.Z"` minimum.
#[must_use]
pub fn version_at_least(current: Option<(u32, u32, u32)>, minimum: &str) -> bool {
    let Some(current) = current else { return false };
    let mut want = [0u32; 3];
    for (slot, part) in want.iter_mut().zip(minimum.split('.')) {
        match part.parse() {
            Ok(value) => *slot = value,
            Err(_) => return false,
        }
    }
    (current.0, current.1, current.2) >= (want[0], want[1], want[2])
}

/// Repository-relative location of a delta artifact.
#[must_use]
pub fn delta_relpath(name: &str, version: &str, arch: &str, base_version: &str) -> PathBuf {
    PathBuf::from("deltas")
        .join(name)
        .join(version)
        .join(arch)
        .join(format!("{base_version}.zstpatch"))
}

/// What: Generate a delta from `base` to `target`.
///
/// Inputs:
/// - `base`: Previous version's artifact.
/// - `target`: New artifact.
/// - `output`: Destination `.zstpatch` path.
/// - `minimum_version`: Minimum zstd version clients will need.
///
/// Output:
/// - `Some(DeltaInfo)` describing the patch, or `None` when the local zstd
///   is missing or too old, or patch generation fails (the half-written
///   output is removed).
pub fn generate_delta(
    base: &Path,
    target: &Path,
    output: &Path,
    minimum_version: &str,
) -> Result<Option<DeltaInfo>> {
    if !version_at_least(zstd_version(), minimum_version) {
        tracing::debug!("zstd missing or older than {minimum_version}, skipping delta");
        return Ok(None);
    }
    let Some(bin) = zstd_binary() else {
        return Ok(None);
    };
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let status = Command::new(bin)
        .arg(format!("--patch-from={}", base.display()))
        .arg(target)
        .arg("-f")
        .arg("-o")
        .arg(output)
        .status()?;
    if !status.success() {
        if output.exists() {
            let _ = std::fs::remove_file(output);
        }
        tracing::warn!("zstd --patch-from failed with {status}");
        return Ok(None);
    }
    let size = std::fs::metadata(output)?.len();
    Ok(Some(DeltaInfo {
        algorithm: "zstd-patch".to_string(),
        base_version: String::new(),
        base_sha256: sha256_file(base)?,
        url: String::new(),
        sha256: sha256_file(output)?,
        size,
        min_tool: format!("zstd>={minimum_version}"),
    }))
}

/// What: Reconstruct an artifact from a base blob and a patch.
///
/// # Errors
///
/// Fails when no zstd binary is available or the patch does not apply.
pub fn apply_delta(base: &Path, patch: &Path, output: &Path) -> Result<()> {
    let bin = zstd_binary().ok_or_else(|| {
        LpmError::InvalidInput("zstd binary not available for delta application".to_string())
    })?;
    let status = Command::new(bin)
        .arg(format!("--patch-from={}", base.display()))
        .arg(patch)
        .arg("-d")
        .arg("-f")
        .arg("-o")
        .arg(output)
        .status()?;
    if !status.success() {
        return Err(LpmError::InvalidPackage(format!(
            "delta application failed for {}",
            patch.display()
        )));
    }
    Ok(())
}

/// What: Find a cached artifact matching a digest.
///
/// Details:
/// - Only `.zst` files are considered; unreadable entries are skipped.
#[must_use]
pub fn find_cached_by_sha(cache_dirs: &[PathBuf], digest: &str) -> Option<PathBuf> {
    for dir in cache_dirs {
        let Ok(entries) = std::fs::read_dir(dir) else { continue };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let name = path.file_name().map(|n| n.to_string_lossy().into_owned());
            if !name.is_some_and(|n| n.ends_with(".zst")) {
                continue;
            }
            if let Ok(sum) = sha256_file(&path)
                && sum == digest
            {
                return Some(path);
            }
        }
    }
    None
}
