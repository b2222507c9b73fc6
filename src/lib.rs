//! Linux package manager: dependency resolution, atomic transactions,
//! package building.
//!
//! The crate is organised around the path a package takes through the
//! system:
//!
//! - [`deps`]: version grammar and dependency expressions
//! - [`solver`]: CNF container and CDCL SAT solver
//! - [`resolver`]: package universe, constraint encoding, install plans
//! - [`index`]: repository indices, fetch cache, artifact downloads
//! - [`container`]: the `.zst` artifact format, manifests, signing, deltas
//! - [`build`]: recipe parsing, sandboxed phases, split packages
//! - [`state`]: installed/history/snapshot persistence (SQLite or JSON)
//! - [`txn`]: the atomic install/remove/upgrade transaction engine
//! - [`hooks`]: declarative hook descriptors and dispatch
//! - [`fsio`]: atomic writes and the global transaction lock
//!
//! # Example
//!
//! Resolving a goal against an in-memory universe:
//!
//! ```
//! use lpm::resolver::{ResolveOptions, Universe, solve};
//! use lpm::types::PkgMeta;
//!
//! let mut universe = Universe::new();
//! universe.register_candidate(PkgMeta {
//!     name: "editor".into(),
//!     version: "1.0".into(),
//!     requires: vec!["libcore>=1".into()],
//!     ..PkgMeta::default()
//! });
//! universe.register_candidate(PkgMeta {
//!     name: "libcore".into(),
//!     version: "1.2".into(),
//!     ..PkgMeta::default()
//! });
//! universe.sort_candidates();
//!
//! let plan = solve(&["editor".into()], &universe, ResolveOptions::default()).unwrap();
//! let names: Vec<&str> = plan.iter().map(|p| p.name.as_str()).collect();
//! assert_eq!(names, vec!["libcore", "editor"]);
//! ```

pub mod build;
pub mod cli;
pub mod config;
pub mod container;
pub mod deps;
pub mod error;
pub mod fsio;
pub mod hooks;
pub mod index;
pub mod prelude;
pub mod resolver;
pub mod solver;
pub mod state;
pub mod txn;
pub mod types;

// Re-export commonly used types
pub use config::Config;
pub use error::{LpmError as Error, Result};
pub use types::{InstalledRecord, ManifestEntry, PkgMeta, Repo};
