//! Package metadata, manifest, repository, and state-row types.
//!
//! These structs mirror the on-disk JSON schemas: `meta.json` and
//! `manifest.json` inside package artifacts, `index.json` served by
//! repositories, `repos.json`/`pins.json` under the state directory, and the
//! rows persisted by the state store.

use serde::{Deserialize, Serialize};

/// Package metadata embedded in every artifact as `/.lpm-meta.json`.
///
/// The same shape appears in repository indices, where `sha256`, `blob`,
/// `repo`, and `prio` are filled in by the publisher.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PkgMeta {
    /// Canonical package name.
    pub name: String,
    /// Version string, e.g. `"1.2.3"`.
    pub version: String,
    /// Release counter within a version.
    #[serde(default)]
    pub release: String,
    /// Target architecture or `"noarch"`.
    #[serde(default)]
    pub arch: String,
    /// One-line description.
    #[serde(default)]
    pub summary: String,
    /// Upstream project URL.
    #[serde(default)]
    pub url: String,
    /// License identifier.
    #[serde(default)]
    pub license: String,
    /// Runtime dependency expressions (atoms, AND `,`, OR `|`).
    #[serde(default)]
    pub requires: Vec<String>,
    /// Build-time dependency expressions.
    #[serde(default)]
    pub build_requires: Vec<String>,
    /// Packages this one cannot coexist with.
    #[serde(default)]
    pub conflicts: Vec<String>,
    /// Packages this one replaces.
    #[serde(default)]
    pub obsoletes: Vec<String>,
    /// Capability tokens exported by this package (`cap` or `cap==ver`).
    #[serde(default)]
    pub provides: Vec<String>,
    /// Soft dependencies installed by default.
    #[serde(default)]
    pub recommends: Vec<String>,
    /// Soft dependencies surfaced to the user only.
    #[serde(default)]
    pub suggests: Vec<String>,
    /// Installed size in bytes.
    #[serde(default)]
    pub size: u64,
    /// Digest of the artifact blob, when published.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    /// Artifact download URL, when published.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob: Option<String>,
    /// Name of the repository this candidate came from.
    #[serde(default)]
    pub repo: String,
    /// Repository priority (lower wins).
    #[serde(default)]
    pub prio: i64,
    /// Delta patches available against older versions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deltas: Vec<DeltaInfo>,
}

impl PkgMeta {
    /// Stable candidate identity used for solver variables.
    #[must_use]
    pub fn ident(&self) -> String {
        format!("{}=={}", self.name, self.version)
    }

    /// Full `name-version-release.arch` display form.
    #[must_use]
    pub fn full_id(&self) -> String {
        format!("{}-{}-{}.{}", self.name, self.version, self.release, self.arch)
    }

    /// What: Expand `provides` into capability tokens.
    ///
    /// Output:
    /// - The package name itself, every unversioned provide, and for each
    ///   versioned provide `cap==ver` both `cap` and the full token.
    #[must_use]
    pub fn provide_tokens(&self) -> Vec<String> {
        let mut tokens = vec![self.name.clone()];
        for provide in &self.provides {
            if let Some((cap, _ver)) = provide.split_once("==") {
                tokens.push(cap.trim().to_string());
                tokens.push(provide.trim().to_string());
            } else {
                tokens.push(provide.trim().to_string());
            }
        }
        tokens
    }
}

/// One entry of `/.lpm-manifest.json`, sorted by `path`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Absolute, normalized path under the install root.
    pub path: String,
    /// Payload size in bytes (0 for symlinks).
    #[serde(default)]
    pub size: u64,
    /// Digest of the file bytes, or of the link target string for symlinks.
    #[serde(default)]
    pub sha256: String,
    /// File mode bits, when recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
    /// Symlink target; presence marks the entry as a symlink.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    /// Keep the file after install (used by the embedded install script).
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub keep: bool,
}

impl ManifestEntry {
    /// Whether the entry describes a symlink.
    #[must_use]
    pub fn is_symlink(&self) -> bool {
        self.link.is_some()
    }
}

/// Delta patch descriptor published next to an index entry.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DeltaInfo {
    /// Patch algorithm identifier, currently `"zstd-patch"`.
    pub algorithm: String,
    /// Version of the base artifact the patch applies to.
    pub base_version: String,
    /// Digest the cached base blob must match.
    pub base_sha256: String,
    /// Download URL of the patch.
    #[serde(default)]
    pub url: String,
    /// Digest of the patch itself.
    pub sha256: String,
    /// Patch size in bytes.
    #[serde(default)]
    pub size: u64,
    /// Minimum tool requirement, e.g. `"zstd>=1.4.0"`.
    #[serde(default)]
    pub min_tool: String,
}

/// One configured repository from `repos.json`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Repo {
    /// Repository name.
    pub name: String,
    /// Base URL; the index lives at `<url>/index.json`.
    pub url: String,
    /// Priority; lower wins when candidates tie.
    #[serde(default)]
    pub priority: i64,
    /// VSIDS activity bias applied to this repo's candidates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bias: Option<f64>,
    /// VSIDS decay override applied to this repo's candidates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decay: Option<f64>,
}

/// Wire shape of `<repo>/index.json`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RepoIndex {
    /// All candidates published by the repository.
    #[serde(default)]
    pub packages: Vec<PkgMeta>,
}

/// Contents of `pins.json`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Pins {
    /// Names frozen at their installed version.
    #[serde(default)]
    pub hold: Vec<String>,
    /// Per-name version constraints restricting the candidate set.
    #[serde(default)]
    pub prefer: std::collections::HashMap<String, String>,
}

/// One row of the `installed` table.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct InstalledRecord {
    /// Package name (primary key).
    pub name: String,
    /// Installed version.
    pub version: String,
    /// Installed release.
    #[serde(default)]
    pub release: String,
    /// Installed architecture.
    #[serde(default)]
    pub arch: String,
    /// Capability tokens (name plus provides).
    #[serde(default)]
    pub provides: Vec<String>,
    /// Exported symbol metadata, carried verbatim.
    #[serde(default)]
    pub symbols: Vec<String>,
    /// Dependency expressions recorded at install time.
    #[serde(default)]
    pub requires: Vec<String>,
    /// The package's manifest as installed.
    #[serde(default)]
    pub manifest: Vec<ManifestEntry>,
    /// 1 when the user asked for the package; 0 for dependency-only rows.
    #[serde(default)]
    pub explicit: i64,
    /// Unix timestamp of the install.
    #[serde(default)]
    pub install_time: i64,
}

/// One append-only row of the `history` table.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Row id (0 before insertion).
    #[serde(default)]
    pub id: i64,
    /// Unix timestamp.
    pub ts: i64,
    /// Action: `install`, `upgrade`, `remove`, `rollback`.
    pub action: String,
    /// Package name.
    pub name: String,
    /// Previous version, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_ver: Option<String>,
    /// New version, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_ver: Option<String>,
    /// Free-form JSON details.
    #[serde(default)]
    pub details: String,
}

/// One row of the `snapshots` table.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Row id (0 before insertion).
    #[serde(default)]
    pub id: i64,
    /// Unix timestamp.
    pub ts: i64,
    /// Human-readable tag, e.g. `"install vim"`.
    pub tag: String,
    /// Path of the snapshot archive.
    pub archive: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provide_tokens_expand_versioned_provides() {
        let meta = PkgMeta {
            name: "rustup".into(),
            provides: vec!["rust==1.80".into(), "cargo".into()],
            ..PkgMeta::default()
        };
        let tokens = meta.provide_tokens();
        assert!(tokens.contains(&"rustup".to_string()));
        assert!(tokens.contains(&"rust".to_string()));
        assert!(tokens.contains(&"rust==1.80".to_string()));
        assert!(tokens.contains(&"cargo".to_string()));
    }

    #[test]
    fn test_meta_json_round_trip() {
        let meta = PkgMeta {
            name: "vim".into(),
            version: "9.1".into(),
            release: "2".into(),
            arch: "x86_64".into(),
            requires: vec!["ncurses>=6".into()],
            size: 1024,
            repo: "core".into(),
            prio: 10,
            ..PkgMeta::default()
        };
        let text = serde_json::to_string(&meta).expect("serialize");
        let back: PkgMeta = serde_json::from_str(&text).expect("deserialize");
        assert_eq!(meta, back);
        // Idempotence: a second round trip produces identical text.
        assert_eq!(text, serde_json::to_string(&back).expect("serialize"));
    }

    #[test]
    fn test_manifest_entry_symlink_flag() {
        let entry = ManifestEntry {
            path: "/usr/lib/libz.so".into(),
            link: Some("libz.so.1".into()),
            ..ManifestEntry::default()
        };
        assert!(entry.is_symlink());
        let text = serde_json::to_string(&entry).expect("serialize");
        assert!(text.contains("\"link\""));
        assert!(!text.contains("\"keep\""));
    }

    #[test]
    fn test_meta_defaults_tolerate_sparse_json() {
        let meta: PkgMeta =
            serde_json::from_str(r#"{"name":"a","version":"1.0"}"#).expect("deserialize");
        assert_eq!(meta.name, "a");
        assert!(meta.requires.is_empty());
        assert_eq!(meta.full_id(), "a-1.0-.");
    }
}
