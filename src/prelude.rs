//! Prelude module for convenient imports.
//!
//! ```
//! use lpm::prelude::*;
//!
//! let mut universe = Universe::new();
//! universe.register_candidate(PkgMeta {
//!     name: "tool".into(),
//!     version: "1.0".into(),
//!     ..PkgMeta::default()
//! });
//! universe.sort_candidates();
//! let plan = solve(&["tool".into()], &universe, ResolveOptions::default()).unwrap();
//! assert_eq!(plan.len(), 1);
//! ```

pub use crate::config::Config;
pub use crate::container::{build_package, read_package_meta};
pub use crate::deps::{Atom, DepExpr, Version, parse_atom, parse_dep_expr, satisfies};
pub use crate::error::{LpmError, Result};
pub use crate::resolver::{ResolveOptions, Universe, solve};
pub use crate::solver::{CdclSolver, Cnf, SatResult, SolverOptions};
pub use crate::state::{StateStore, open_store};
pub use crate::txn::{ConflictChoice, Engine, TxnOptions};
pub use crate::types::{
    HistoryEntry, InstalledRecord, ManifestEntry, Pins, PkgMeta, Repo, Snapshot,
};
