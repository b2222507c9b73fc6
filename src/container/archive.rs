//! Deterministic `.zst` tar artifact writing and reading.

use crate::config::PKG_SUFFIX;
use crate::container::manifest::collect_manifest;
use crate::error::{LpmError, Result};
use crate::types::{ManifestEntry, PkgMeta};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tar::{Builder, EntryType, Header};
use walkdir::WalkDir;

/// The zstd frame magic every artifact must start with.
pub const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Archive-root metadata file name.
pub const META_NAME: &str = ".lpm-meta.json";

/// Archive-root manifest file name.
pub const MANIFEST_NAME: &str = ".lpm-manifest.json";

/// Compression level for produced artifacts.
const ZSTD_LEVEL: i32 = 19;

/// What: Verify the 4-byte zstd magic of an artifact.
pub fn check_magic(path: &Path) -> Result<()> {
    let mut file = File::open(path)?;
    let mut magic = [0u8; 4];
    file.read_exact(&mut magic)
        .map_err(|_| LpmError::InvalidPackage(format!("{}: truncated", path.display())))?;
    if magic != ZSTD_MAGIC {
        return Err(LpmError::InvalidPackage(format!(
            "{}: bad magic header",
            path.display()
        )));
    }
    Ok(())
}

fn base_header(mode: u32) -> Header {
    let mut header = Header::new_gnu();
    header.set_mode(mode);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header
}

/// What: Produce a package artifact from a staged tree.
///
/// Inputs:
/// - `stagedir`: Staged filesystem tree to package.
/// - `meta`: Package metadata written as `/.lpm-meta.json`.
/// - `outdir`: Directory receiving the artifact.
///
/// Output:
/// - `(artifact path, manifest)`. The artifact is named
///   `name-version-release.arch.zst`.
///
/// Details:
/// - The manifest is collected from the tree before the sentinel files are
///   added, then `/.lpm-install.sh` (if present) is flagged in it.
/// - Entries are emitted in sorted order with zeroed mtime and ownership so
///   identical trees produce identical artifacts.
pub fn build_package(
    stagedir: &Path,
    meta: &PkgMeta,
    outdir: &Path,
) -> Result<(PathBuf, Vec<ManifestEntry>)> {
    let manifest = collect_manifest(stagedir)?;

    std::fs::create_dir_all(outdir)?;
    let out_path = outdir.join(format!(
        "{}-{}-{}.{}{}",
        meta.name, meta.version, meta.release, meta.arch, PKG_SUFFIX
    ));

    let meta_json = serde_json::to_vec_pretty(meta)?;
    let manifest_json = serde_json::to_vec_pretty(&manifest)?;

    let file = File::create(&out_path)?;
    let encoder = zstd::stream::write::Encoder::new(file, ZSTD_LEVEL)?;
    let mut builder = Builder::new(encoder);

    // Sentinels first so metadata-only reads can stop early.
    let mut header = base_header(0o644);
    header.set_size(meta_json.len() as u64);
    builder.append_data(&mut header, META_NAME, meta_json.as_slice())?;
    let mut header = base_header(0o644);
    header.set_size(manifest_json.len() as u64);
    builder.append_data(&mut header, MANIFEST_NAME, manifest_json.as_slice())?;

    for item in WalkDir::new(stagedir).sort_by_file_name() {
        let item = item
            .map_err(|err| LpmError::Build(format!("walk {}: {err}", stagedir.display())))?;
        let path = item.path();
        if path == stagedir {
            continue;
        }
        let rel = path
            .strip_prefix(stagedir)
            .map_err(|_| LpmError::Build(format!("path escapes stage: {}", path.display())))?;
        let file_type = item.file_type();
        if file_type.is_symlink() {
            let target = std::fs::read_link(path)?;
            let mut header = base_header(0o777);
            header.set_entry_type(EntryType::Symlink);
            header.set_size(0);
            builder.append_link(&mut header, rel, &target)?;
        } else if file_type.is_dir() {
            let mut header = base_header(0o755);
            header.set_entry_type(EntryType::Directory);
            header.set_size(0);
            builder.append_data(&mut header, rel, std::io::empty())?;
        } else if file_type.is_file() {
            use std::os::unix::fs::PermissionsExt;
            let metadata = item
                .metadata()
                .map_err(|err| LpmError::Build(format!("stat {}: {err}", path.display())))?;
            let mut header = base_header(metadata.permissions().mode() & 0o7777);
            header.set_size(metadata.len());
            builder.append_data(&mut header, rel, File::open(path)?)?;
        }
    }

    let encoder = builder.into_inner()?;
    let mut file = encoder.finish()?;
    file.flush()?;
    file.sync_all()?;
    Ok((out_path, manifest))
}

fn entry_name(path: &Path) -> String {
    path.to_string_lossy()
        .trim_start_matches("./")
        .trim_start_matches('/')
        .to_string()
}

/// What: Read metadata and manifest out of an artifact.
///
/// Details:
/// - Verifies the zstd magic, then streams the tar and stops as soon as
///   both sentinel entries have been seen; the payload is never extracted.
pub fn read_package_meta(path: &Path) -> Result<(PkgMeta, Vec<ManifestEntry>)> {
    check_magic(path)?;
    let file = File::open(path)?;
    let decoder = zstd::stream::read::Decoder::new(file)?;
    let mut archive = tar::Archive::new(decoder);

    let mut meta: Option<PkgMeta> = None;
    let mut manifest: Option<Vec<ManifestEntry>> = None;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry_name(&entry.path()?);
        if name == META_NAME {
            let mut text = String::new();
            entry.read_to_string(&mut text)?;
            meta = Some(serde_json::from_str(&text)?);
        } else if name == MANIFEST_NAME {
            let mut text = String::new();
            entry.read_to_string(&mut text)?;
            manifest = Some(serde_json::from_str(&text)?);
        }
        if meta.is_some() && manifest.is_some() {
            break;
        }
    }

    let meta = meta.ok_or_else(|| {
        LpmError::InvalidPackage(format!("{}: no metadata", path.display()))
    })?;
    Ok((meta, manifest.unwrap_or_default()))
}

/// What: Extract an artifact's full payload into `dest`.
///
/// Details:
/// - `dest` should live on the same filesystem as the final root so that
///   the installer's renames stay atomic. Permissions are preserved;
///   the sentinel files are extracted too (the installer consults them).
pub fn extract_package(path: &Path, dest: &Path) -> Result<()> {
    check_magic(path)?;
    std::fs::create_dir_all(dest)?;
    let file = File::open(path)?;
    let decoder = zstd::stream::read::Decoder::new(file)?;
    let mut archive = tar::Archive::new(decoder);
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);
    archive.unpack(dest)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::sha256_bytes;

    fn stage_with_payload(dir: &Path) -> PkgMeta {
        std::fs::create_dir_all(dir.join("usr/bin")).expect("mkdir");
        std::fs::write(dir.join("usr/bin/hello"), b"#!/bin/sh\necho hi\n").expect("write");
        std::os::unix::fs::symlink("hello", dir.join("usr/bin/hi")).expect("symlink");
        PkgMeta {
            name: "hello".into(),
            version: "1.0".into(),
            release: "1".into(),
            arch: "noarch".into(),
            summary: "test package".into(),
            ..PkgMeta::default()
        }
    }

    #[test]
    fn test_build_and_read_round_trip() {
        let stage = tempfile::tempdir().expect("stage");
        let out = tempfile::tempdir().expect("out");
        let meta = stage_with_payload(stage.path());

        let (artifact, manifest) =
            build_package(stage.path(), &meta, out.path()).expect("build");
        assert!(artifact.file_name().is_some_and(|n| n == "hello-1.0-1.noarch.zst"));
        check_magic(&artifact).expect("magic");

        let (read_meta, read_manifest) = read_package_meta(&artifact).expect("read");
        assert_eq!(read_meta, meta);
        assert_eq!(read_manifest, manifest);
        assert!(read_manifest.iter().any(|e| e.path == "/usr/bin/hello"));
        assert!(
            read_manifest
                .iter()
                .any(|e| e.path == "/usr/bin/hi" && e.link.as_deref() == Some("hello"))
        );
    }

    #[test]
    fn test_extract_restores_payload_and_symlink() {
        let stage = tempfile::tempdir().expect("stage");
        let out = tempfile::tempdir().expect("out");
        let dest = tempfile::tempdir().expect("dest");
        let meta = stage_with_payload(stage.path());
        let (artifact, _) = build_package(stage.path(), &meta, out.path()).expect("build");

        extract_package(&artifact, dest.path()).expect("extract");
        let payload = std::fs::read(dest.path().join("usr/bin/hello")).expect("read");
        assert_eq!(sha256_bytes(&payload), sha256_bytes(b"#!/bin/sh\necho hi\n"));
        let target = std::fs::read_link(dest.path().join("usr/bin/hi")).expect("readlink");
        assert_eq!(target, PathBuf::from("hello"));
        assert!(dest.path().join(META_NAME).exists());
    }

    #[test]
    fn test_deterministic_output() {
        let stage = tempfile::tempdir().expect("stage");
        let out_a = tempfile::tempdir().expect("out");
        let out_b = tempfile::tempdir().expect("out");
        let meta = stage_with_payload(stage.path());
        let (a, _) = build_package(stage.path(), &meta, out_a.path()).expect("build");
        let (b, _) = build_package(stage.path(), &meta, out_b.path()).expect("build");
        assert_eq!(std::fs::read(a).expect("a"), std::fs::read(b).expect("b"));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("fake.zst");
        std::fs::write(&path, b"not a zstd stream").expect("write");
        assert!(matches!(
            read_package_meta(&path),
            Err(LpmError::InvalidPackage(_))
        ));
    }
}
