//! Unified error type for lpm.

use thiserror::Error;

/// Unified error type for all lpm operations.
///
/// Every module reports failures through this enum so that the CLI can map
/// them to the documented exit codes in one place.
#[derive(Error, Debug)]
pub enum LpmError {
    /// Filesystem or other I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network or HTTP request error.
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// JSON parsing error.
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    /// State database error.
    #[error("State database error: {0}")]
    Db(#[from] rusqlite::Error),

    /// Malformed version string.
    #[error("Invalid version {0:?}")]
    InvalidVersion(String),

    /// Malformed dependency atom.
    #[error("Invalid atom {0:?}")]
    InvalidAtom(String),

    /// Unexpected token while parsing a dependency expression.
    #[error("Unexpected token {0:?} in dependency expression")]
    UnexpectedToken(String),

    /// Tokens remained after the top-level dependency expression.
    #[error("Trailing input {0:?} after dependency expression")]
    TrailingInput(String),

    /// No candidate provides a required atom.
    #[error("No provider for dependency '{atom}' (required by {context})")]
    NoProvider {
        /// The unsatisfied dependency atom.
        atom: String,
        /// The package (or goal) whose requires triggered the lookup.
        context: String,
    },

    /// The dependency problem has no satisfying assignment.
    #[error("Unsatisfiable dependencies: {}", .core.join(" AND "))]
    Unsatisfiable {
        /// Package names forming the minimized unsat core.
        core: Vec<String>,
    },

    /// Build-requires form a cycle.
    #[error("Dependency cycle: {}", .names.join(" -> "))]
    DependencyCycle {
        /// The cycle path, first node repeated last.
        names: Vec<String>,
    },

    /// Detached signature missing or failed verification.
    #[error("Signature verification failed for {0}")]
    SignatureInvalid(String),

    /// A manifest entry's digest did not match the staged payload.
    #[error("Hash mismatch for {path}: expected {expected}, got {actual}")]
    HashMismatch {
        /// Manifest path of the offending entry.
        path: String,
        /// Digest recorded in the manifest.
        expected: String,
        /// Digest computed from the staged payload.
        actual: String,
    },

    /// The user aborted at a file conflict prompt.
    #[error("Aborted due to conflict at {0}")]
    ConflictAbort(String),

    /// Hook descriptor or dispatch failure.
    #[error("Hook error: {0}")]
    Hook(String),

    /// Another transaction holds the global lock.
    #[error("Another transaction is running{}", .pid.map(|p| format!(" (pid {p})")).unwrap_or_default())]
    LockHeld {
        /// PID read from the lock file, when available.
        pid: Option<u32>,
    },

    /// The operation needs root and the process does not have it.
    #[error("Root privileges required to {0}")]
    RootPrivilegesRequired(String),

    /// Recipe script parse or execution failure.
    #[error("Build error: {0}")]
    Build(String),

    /// Malformed or unreadable package artifact.
    #[error("Invalid package: {0}")]
    InvalidPackage(String),

    /// Invalid input parameter.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl LpmError {
    /// What: Map this error onto the CLI exit-code contract.
    ///
    /// Output:
    /// - `2` for usage, grammar, and resolution failures.
    /// - `77` when root privileges are missing.
    /// - `1` for everything else.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidVersion(_)
            | Self::InvalidAtom(_)
            | Self::UnexpectedToken(_)
            | Self::TrailingInput(_)
            | Self::NoProvider { .. }
            | Self::Unsatisfiable { .. }
            | Self::InvalidInput(_) => 2,
            Self::RootPrivilegesRequired(_) => 77,
            _ => 1,
        }
    }
}

/// Result type alias for lpm operations.
pub type Result<T> = std::result::Result<T, LpmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(LpmError::InvalidVersion("x".into()).exit_code(), 2);
        assert_eq!(
            LpmError::NoProvider {
                atom: "glibc".into(),
                context: "base-1.0".into(),
            }
            .exit_code(),
            2
        );
        assert_eq!(
            LpmError::RootPrivilegesRequired("install packages".into()).exit_code(),
            77
        );
        assert_eq!(LpmError::LockHeld { pid: Some(42) }.exit_code(), 1);
    }

    #[test]
    fn test_lock_held_message_includes_pid() {
        let err = LpmError::LockHeld { pid: Some(1234) };
        assert_eq!(err.to_string(), "Another transaction is running (pid 1234)");
        let err = LpmError::LockHeld { pid: None };
        assert_eq!(err.to_string(), "Another transaction is running");
    }

    #[test]
    fn test_no_provider_message_names_atom_and_context() {
        let err = LpmError::NoProvider {
            atom: "glibc".into(),
            context: "system-base-1.0".into(),
        };
        assert_eq!(
            err.to_string(),
            "No provider for dependency 'glibc' (required by system-base-1.0)"
        );
    }
}
