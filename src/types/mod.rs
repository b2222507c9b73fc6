//! Shared data types used across the crate.

pub mod package;

pub use package::{
    DeltaInfo, HistoryEntry, InstalledRecord, ManifestEntry, PkgMeta, Pins, Repo, RepoIndex,
    Snapshot,
};
