//! Runtime configuration threaded into every component.
//!
//! There is no global mutable state: a [`Config`] is built once at startup
//! (from defaults plus environment overrides) and passed explicitly to the
//! resolver, transaction engine, build pipeline, and hook dispatcher.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Package file suffix produced and consumed by the container layer.
pub const PKG_SUFFIX: &str = ".zst";

/// Detached signature suffix appended to the artifact name.
pub const SIG_SUFFIX: &str = ".sig";

/// Default filesystem root packages are installed onto.
pub const DEFAULT_ROOT: &str = "/";

/// Default state directory when `LPM_STATE_DIR` is unset.
pub const DEFAULT_STATE_DIR: &str = "/var/lib/lpm";

/// CPU tuning triple used to derive compiler flags for recipe builds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CpuTuning {
    /// `-march=` value.
    pub march: String,
    /// `-mtune=` value.
    pub mtune: String,
    /// `-O` level, e.g. `"2"`.
    pub level: String,
}

impl Default for CpuTuning {
    fn default() -> Self {
        Self {
            march: "x86-64".to_string(),
            mtune: "generic".to_string(),
            level: "2".to_string(),
        }
    }
}

/// Answer assumed at a file-conflict prompt when stdin is not a TTY.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConflictDefault {
    /// Replace the conflicting destination.
    Replace,
    /// Keep the destination and skip the entry.
    Skip,
    /// Abort the transaction.
    Abort,
}

/// What: Snapshot of all runtime configuration.
///
/// Details:
/// - Constructed once via [`Config::from_env`] and threaded by reference.
/// - All derived paths live under `state_dir` so that tests can redirect the
///   whole state tree with a single environment variable.
#[derive(Clone, Debug)]
pub struct Config {
    /// Host architecture candidates are filtered against.
    pub arch: String,
    /// Filesystem root transactions mutate.
    pub root: PathBuf,
    /// State directory holding the DB, caches, snapshots, and lock.
    pub state_dir: PathBuf,
    /// Hook descriptor directories scanned for `*.hook` files.
    pub hook_dirs: Vec<PathBuf>,
    /// Package names that refuse install/remove without `--force`.
    pub protected: HashSet<String>,
    /// CPU tuning used by the build pipeline.
    pub cpu: CpuTuning,
    /// Bounded worker count for independent dependency builds.
    pub build_workers: usize,
    /// Per-read network timeout for index and source fetches.
    pub net_timeout: Duration,
    /// TTL for cached repository indices.
    pub index_ttl: Duration,
    /// Answer assumed at conflict prompts when stdin is not a TTY.
    pub conflict_default: ConflictDefault,
    /// Private signing key path (ed25519, raw 32 bytes).
    pub signing_key: PathBuf,
    /// Public verification key path (ed25519, raw 32 bytes).
    pub verify_key: PathBuf,
}

impl Config {
    /// What: Build the configuration from defaults plus environment overrides.
    ///
    /// Details:
    /// - `LPM_STATE_DIR` relocates the whole state tree.
    /// - `LPM_ROOT` changes the target root (the CLI `--root` flag wins).
    /// - `LPM_BUILD_WORKERS` overrides the worker clamp.
    /// - `LPM_CONFLICT_DEFAULT` accepts `replace`, `skip`, or `abort`.
    #[must_use]
    pub fn from_env() -> Self {
        let state_dir = std::env::var("LPM_STATE_DIR")
            .map_or_else(|_| PathBuf::from(DEFAULT_STATE_DIR), PathBuf::from);
        let root = std::env::var("LPM_ROOT")
            .map_or_else(|_| PathBuf::from(DEFAULT_ROOT), PathBuf::from);
        let build_workers = std::env::var("LPM_BUILD_WORKERS")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|&n| n > 0)
            .unwrap_or_else(|| num_cpus::get().clamp(2, 8));
        let conflict_default = match std::env::var("LPM_CONFLICT_DEFAULT").as_deref() {
            Ok("replace") => ConflictDefault::Replace,
            Ok("skip") => ConflictDefault::Skip,
            _ => ConflictDefault::Abort,
        };
        let hook_dirs = vec![
            PathBuf::from("/usr/share/liblpm/hooks"),
            PathBuf::from("/etc/lpm/hooks"),
        ];
        let signing_key = state_dir.join("keys/signing.key");
        let verify_key = state_dir.join("keys/signing.pub");
        Self {
            arch: host_arch(),
            root,
            state_dir,
            hook_dirs,
            protected: HashSet::new(),
            cpu: CpuTuning::default(),
            build_workers,
            net_timeout: Duration::from_secs(10),
            index_ttl: Duration::from_secs(300),
            conflict_default,
            signing_key,
            verify_key,
        }
    }

    /// Path of the state database file.
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.state_dir.join("state.db")
    }

    /// Directory holding fetched repository blobs keyed by sha256 or name.
    #[must_use]
    pub fn cache_dir(&self) -> PathBuf {
        self.state_dir.join("cache")
    }

    /// Directory holding pre-transaction snapshot archives.
    #[must_use]
    pub fn snapshot_dir(&self) -> PathBuf {
        self.state_dir.join("snapshots")
    }

    /// Path of `repos.json`.
    #[must_use]
    pub fn repos_path(&self) -> PathBuf {
        self.state_dir.join("repos.json")
    }

    /// Path of `pins.json`.
    #[must_use]
    pub fn pins_path(&self) -> PathBuf {
        self.state_dir.join("pins.json")
    }

    /// Path of the global transaction lock file.
    #[must_use]
    pub fn lock_path(&self) -> PathBuf {
        self.state_dir.join("lock")
    }

    /// Path of the protected-package list.
    #[must_use]
    pub fn protected_path(&self) -> PathBuf {
        self.state_dir.join("protected.json")
    }

    /// What: Whether `root` is the default root.
    ///
    /// Details:
    /// - Transactions against the default root require euid 0; transactions
    ///   against a scratch root (tests, image builds) do not.
    #[must_use]
    pub fn is_default_root(&self) -> bool {
        self.root == Path::new(DEFAULT_ROOT)
    }

    /// What: Load the protected-package list from disk into `self`.
    ///
    /// Details:
    /// - The file is a JSON array of names; a missing or unreadable file
    ///   leaves the set empty.
    pub fn load_protected(&mut self) {
        let path = self.protected_path();
        match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<Vec<String>>(&bytes) {
                Ok(names) => self.protected = names.into_iter().collect(),
                Err(err) => {
                    tracing::warn!("Ignoring malformed protected list {}: {err}", path.display());
                }
            },
            Err(_) => self.protected = HashSet::new(),
        }
    }
}

/// What: Determine the host architecture string.
///
/// Details:
/// - Uses the compile-time target arch, mapped to package-index spelling.
#[must_use]
pub fn host_arch() -> String {
    match std::env::consts::ARCH {
        "x86" => "i686".to_string(),
        other => other.to_string(),
    }
}

/// What: Check whether a package arch is installable on the host.
///
/// Inputs:
/// - `pkg_arch`: Architecture declared in the package metadata.
/// - `host`: Host architecture string.
///
/// Output:
/// - `true` for `noarch` and exact matches.
#[must_use]
pub fn arch_compatible(pkg_arch: &str, host: &str) -> bool {
    pkg_arch == "noarch" || pkg_arch == host
}
