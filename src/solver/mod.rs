//! CNF container and CDCL SAT solver.
//!
//! The resolver encodes package constraints into a [`Cnf`] and hands it to
//! [`CdclSolver`]. The solver is deliberately not a general-purpose SAT
//! interface: variables are interned package identities, and the heuristics
//! (activity bias, per-variable decay, preferred phases) exist so the
//! encoder can steer the search towards installed and newest candidates.

pub mod cdcl;
pub mod cnf;

pub use cdcl::{CdclSolver, SatResult, SolverOptions, luby};
pub use cnf::{Cnf, Lit, Var};
