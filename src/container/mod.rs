//! Package container: deterministic `.zst` tar artifacts, manifests,
//! detached signatures, and delta patches.
//!
//! Every artifact is a tar archive streamed through zstd. The archive root
//! always carries `/.lpm-meta.json` and `/.lpm-manifest.json`; the tar is
//! deterministic (sorted entries, zeroed timestamps and ownership, numeric
//! owners) so rebuilding identical inputs reproduces identical bytes.

pub mod archive;
pub mod delta;
pub mod manifest;
pub mod sign;

use crate::error::Result;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

pub use archive::{
    META_NAME, MANIFEST_NAME, ZSTD_MAGIC, build_package, check_magic, extract_package,
    read_package_meta,
};
pub use manifest::collect_manifest;

/// Hex sha256 of a byte slice.
#[must_use]
pub fn sha256_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// What: Hex sha256 of a file, streamed in 1 MiB chunks.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
