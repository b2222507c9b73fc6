//! Version parsing, comparison, and constraint checking.
//!
//! Versions are `(major, minor, patch)` tuples. Trailing suffixes introduced
//! by `-`, `+`, or `~` (release tags, pre-release markers) do not
//! participate in ordering; missing components count as zero.

use crate::error::{LpmError, Result};
use std::cmp::Ordering;

/// A parsed version tuple with total order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    /// Major component.
    pub major: u64,
    /// Minor component (0 when absent).
    pub minor: u64,
    /// Patch component (0 when absent).
    pub patch: u64,
}

impl Version {
    /// What: Parse `MAJOR[.MINOR[.PATCH]][-/+/~suffix]` into a tuple.
    ///
    /// Inputs:
    /// - `text`: Version string, e.g. `"1.2.3"`, `"2.0-rc1"`, `"3"`.
    ///
    /// Output:
    /// - `Ok(Version)` with missing components zeroed.
    /// - `Err(LpmError::InvalidVersion)` when the major component carries no
    ///   leading digits.
    ///
    /// Details:
    /// - The suffix after the first `-`, `+`, or `~` is dropped.
    /// - A non-numeric tail inside a component (`"3rc1"`) is dropped after
    ///   its leading digits; components past the third are ignored.
    pub fn parse(text: &str) -> Result<Self> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(LpmError::InvalidVersion(text.to_string()));
        }
        let numeric = trimmed
            .split_once(['-', '+', '~'])
            .map_or(trimmed, |(head, _)| head);

        let mut parts = [0u64; 3];
        for (idx, piece) in numeric.split('.').take(3).enumerate() {
            let digits: String = piece.chars().take_while(char::is_ascii_digit).collect();
            if digits.is_empty() {
                if idx == 0 {
                    return Err(LpmError::InvalidVersion(text.to_string()));
                }
                break;
            }
            parts[idx] = digits
                .parse::<u64>()
                .map_err(|_| LpmError::InvalidVersion(text.to_string()))?;
        }
        Ok(Self {
            major: parts[0],
            minor: parts[1],
            patch: parts[2],
        })
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// What: Compare two version strings by numeric tuple.
///
/// Inputs:
/// - `a`: Left-hand version string.
/// - `b`: Right-hand version string.
///
/// Output:
/// - The `Ordering` of the parsed tuples.
///
/// # Errors
///
/// Returns `LpmError::InvalidVersion` when either side fails to parse.
///
/// # Example
///
/// ```
/// use lpm::deps::compare;
/// use std::cmp::Ordering;
///
/// assert_eq!(compare("1.2.3", "1.2.4").unwrap(), Ordering::Less);
/// assert_eq!(compare("2.0", "2.0.0").unwrap(), Ordering::Equal);
/// assert_eq!(compare("1.2.3-rc1", "1.2.3").unwrap(), Ordering::Equal);
/// ```
pub fn compare(a: &str, b: &str) -> Result<Ordering> {
    Ok(Version::parse(a)?.cmp(&Version::parse(b)?))
}

/// One comparison operator from the constraint grammar.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Op {
    Eq,
    Ge,
    Le,
    Gt,
    Lt,
    /// `~=X.Y`: same major as `X.Y`, version >= `X.Y`.
    Compatible,
}

fn split_op(piece: &str) -> Option<(Op, &str)> {
    for (prefix, op) in [
        (">=", Op::Ge),
        ("<=", Op::Le),
        ("==", Op::Eq),
        ("~=", Op::Compatible),
        ("=", Op::Eq),
        (">", Op::Gt),
        ("<", Op::Lt),
    ] {
        if let Some(rest) = piece.strip_prefix(prefix) {
            return Some((op, rest.trim()));
        }
    }
    None
}

fn check_one(ver: Version, piece: &str) -> Result<bool> {
    let piece = piece.trim();
    if piece.is_empty() {
        return Ok(true);
    }
    let (op, ver_text) = match split_op(piece) {
        Some(found) => found,
        // A bare version is an equality constraint.
        None if piece.starts_with(|c: char| c.is_ascii_digit()) => (Op::Eq, piece),
        None => return Err(LpmError::InvalidVersion(piece.to_string())),
    };
    // `X.*` is an alias for `~=X`, with or without a leading equality.
    if let Some(base) = ver_text.strip_suffix(".*") {
        if !matches!(op, Op::Eq | Op::Compatible) {
            return Err(LpmError::InvalidVersion(piece.to_string()));
        }
        let want = Version::parse(base)?;
        return Ok(ver.major == want.major && ver >= want);
    }
    let want = Version::parse(ver_text)?;
    Ok(match op {
        Op::Eq => ver == want,
        Op::Ge => ver >= want,
        Op::Le => ver <= want,
        Op::Gt => ver > want,
        Op::Lt => ver < want,
        Op::Compatible => ver.major == want.major && ver >= want,
    })
}

/// What: Check a version against a comma-separated constraint list.
///
/// Inputs:
/// - `version`: Version string to test.
/// - `constraints`: Constraint expression, e.g. `">=1.2, <2.0"`, `"1.4.*"`.
///
/// Output:
/// - `Ok(true)` when every constraint holds; an empty constraint string is
///   always satisfied.
///
/// # Errors
///
/// Returns `LpmError::InvalidVersion` for malformed versions or operators.
///
/// # Example
///
/// ```
/// use lpm::deps::satisfies;
///
/// assert!(satisfies("1.6", ">=1.5").unwrap());
/// assert!(satisfies("1.6", ">=1.5, <2.0").unwrap());
/// assert!(satisfies("1.6", "1.*").unwrap());
/// assert!(!satisfies("2.0", "~=1.4").unwrap());
/// assert!(satisfies("2.0", "").unwrap());
/// ```
pub fn satisfies(version: &str, constraints: &str) -> Result<bool> {
    if constraints.trim().is_empty() {
        return Ok(true);
    }
    let ver = Version::parse(version)?;
    for piece in constraints.split(',') {
        if !check_one(ver, piece)? {
            return Ok(false);
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic() {
        assert_eq!(
            Version::parse("1.2.3").unwrap(),
            Version { major: 1, minor: 2, patch: 3 }
        );
        assert_eq!(
            Version::parse("2.0").unwrap(),
            Version { major: 2, minor: 0, patch: 0 }
        );
        assert_eq!(
            Version::parse("7").unwrap(),
            Version { major: 7, minor: 0, patch: 0 }
        );
    }

    #[test]
    fn test_parse_suffixes_ignored() {
        assert_eq!(Version::parse("1.2.3-rc1").unwrap(), Version::parse("1.2.3").unwrap());
        assert_eq!(Version::parse("1.2.3+git").unwrap(), Version::parse("1.2.3").unwrap());
        assert_eq!(Version::parse("1.2.3~beta").unwrap(), Version::parse("1.2.3").unwrap());
        // Non-numeric tail inside a component drops after the digits.
        assert_eq!(Version::parse("1.2.3rc1").unwrap(), Version::parse("1.2.3").unwrap());
        // Non-numeric component treated as zero from there on.
        assert_eq!(Version::parse("1.beta").unwrap(), Version::parse("1.0").unwrap());
    }

    #[test]
    fn test_parse_invalid() {
        assert!(Version::parse("").is_err());
        assert!(Version::parse("alpha").is_err());
        assert!(Version::parse("-3").is_err());
    }

    #[test]
    fn test_compare_total_order() {
        assert_eq!(compare("1.0.0", "1.0.1").unwrap(), Ordering::Less);
        assert_eq!(compare("2.0.0", "1.9.9").unwrap(), Ordering::Greater);
        assert_eq!(compare("1.0", "1.0.0").unwrap(), Ordering::Equal);
        assert_eq!(compare("1.10.0", "1.9.9").unwrap(), Ordering::Greater);
        assert_eq!(compare("10.0.0", "9.9.9").unwrap(), Ordering::Greater);
    }

    #[test]
    fn test_satisfies_operators() {
        assert!(satisfies("2.0", ">=1.5").unwrap());
        assert!(satisfies("1.5", ">=1.5").unwrap());
        assert!(!satisfies("1.0", ">=1.5").unwrap());
        assert!(satisfies("1.5", "<=1.5").unwrap());
        assert!(!satisfies("2.0", "<=1.5").unwrap());
        assert!(satisfies("1.6", ">1.5").unwrap());
        assert!(!satisfies("1.5", ">1.5").unwrap());
        assert!(satisfies("1.4", "<1.5").unwrap());
        assert!(satisfies("1.5", "=1.5").unwrap());
        assert!(satisfies("1.5", "==1.5").unwrap());
        assert!(!satisfies("1.6", "=1.5").unwrap());
    }

    #[test]
    fn test_satisfies_compatible_release() {
        assert!(satisfies("1.6", "~=1.4").unwrap());
        assert!(satisfies("1.4", "~=1.4").unwrap());
        assert!(!satisfies("1.3", "~=1.4").unwrap());
        assert!(!satisfies("2.0", "~=1.4").unwrap());
    }

    #[test]
    fn test_satisfies_wildcard() {
        assert!(satisfies("1.6", "1.*").unwrap());
        assert!(satisfies("1.0", "1.*").unwrap());
        assert!(!satisfies("2.0", "1.*").unwrap());
        assert!(satisfies("1.4.9", "1.4.*").unwrap());
        assert!(satisfies("1.5.0", "1.4.*").unwrap());
    }

    #[test]
    fn test_satisfies_conjunction() {
        assert!(satisfies("1.6", ">=1.5, <2.0").unwrap());
        assert!(!satisfies("2.0", ">=1.5, <2.0").unwrap());
        assert!(!satisfies("1.4", ">=1.5, <2.0").unwrap());
    }

    #[test]
    fn test_satisfies_empty_always_true() {
        assert!(satisfies("1.0", "").unwrap());
        assert!(satisfies("99.99.99", "  ").unwrap());
    }

    #[test]
    fn test_satisfies_bare_version_is_equality() {
        assert!(satisfies("1.5", "1.5").unwrap());
        assert!(!satisfies("1.6", "1.5").unwrap());
    }
}
