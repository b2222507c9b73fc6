//! Recipe (`.lpmbuild`) metadata parsing.
//!
//! Recipes are shell scripts; the metadata at the top is assignments
//! (`NAME=foo`, `SUMMARY="A tool"`) and arrays (`REQUIRES=(a b>=2)`),
//! followed by the lifecycle functions `prepare`, `build`, `check`, and
//! `staging` (the legacy spelling `install` is accepted for `staging`).
//! Parsing never executes the script; the functions run later in the
//! sandbox.

use crate::error::{LpmError, Result};
use crate::types::PkgMeta;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Lifecycle phases in execution order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Unpack and patch sources.
    Prepare,
    /// Compile.
    Build,
    /// Run the test suite.
    Check,
    /// Install into the stage directory.
    Staging,
}

impl Phase {
    /// All phases in execution order.
    pub const ORDER: [Self; 4] = [Self::Prepare, Self::Build, Self::Check, Self::Staging];

    /// Shell function name invoked for this phase.
    #[must_use]
    pub fn function(self) -> &'static str {
        match self {
            Self::Prepare => "prepare",
            Self::Build => "build",
            Self::Check => "check",
            Self::Staging => "staging",
        }
    }
}

/// Parsed recipe: metadata plus which phase functions exist.
#[derive(Clone, Debug, Default)]
pub struct Recipe {
    /// Script location.
    pub path: PathBuf,
    /// Package name.
    pub name: String,
    /// Version.
    pub version: String,
    /// Release counter.
    pub release: String,
    /// Target arch.
    pub arch: String,
    /// One-line summary.
    pub summary: String,
    /// Upstream URL.
    pub url: String,
    /// License.
    pub license: String,
    /// Runtime dependency expressions.
    pub requires: Vec<String>,
    /// Build-time dependency expressions.
    pub build_requires: Vec<String>,
    /// Provided capability tokens.
    pub provides: Vec<String>,
    /// Conflicting packages.
    pub conflicts: Vec<String>,
    /// Obsoleted packages.
    pub obsoletes: Vec<String>,
    /// Soft dependencies.
    pub recommends: Vec<String>,
    /// Suggestions.
    pub suggests: Vec<String>,
    /// Source specs (`URL`, `alias::URL`, or bare names).
    pub sources: Vec<String>,
    /// Phase functions defined by the script.
    pub phases: HashSet<Phase>,
    /// The staging phase was declared as `install()`.
    pub staging_is_install: bool,
}

impl Recipe {
    /// Package metadata for the main artifact.
    #[must_use]
    pub fn meta(&self, host_arch: &str) -> PkgMeta {
        PkgMeta {
            name: self.name.clone(),
            version: self.version.clone(),
            release: if self.release.is_empty() { "1".into() } else { self.release.clone() },
            arch: if self.arch.is_empty() { host_arch.into() } else { self.arch.clone() },
            summary: self.summary.clone(),
            url: self.url.clone(),
            license: self.license.clone(),
            requires: self.requires.clone(),
            build_requires: self.build_requires.clone(),
            provides: self.provides.clone(),
            conflicts: self.conflicts.clone(),
            obsoletes: self.obsoletes.clone(),
            recommends: self.recommends.clone(),
            suggests: self.suggests.clone(),
            ..PkgMeta::default()
        }
    }

    /// Shell function name for a phase, honouring the `install` alias.
    #[must_use]
    pub fn phase_function(&self, phase: Phase) -> &'static str {
        if phase == Phase::Staging && self.staging_is_install {
            "install"
        } else {
            phase.function()
        }
    }
}

fn unquote(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.len() >= 2
        && ((trimmed.starts_with('"') && trimmed.ends_with('"'))
            || (trimmed.starts_with('\'') && trimmed.ends_with('\'')))
    {
        trimmed[1..trimmed.len() - 1].to_string()
    } else {
        trimmed.to_string()
    }
}

fn split_array(body: &str) -> Vec<String> {
    shlex::split(body)
        .unwrap_or_else(|| body.split_whitespace().map(ToString::to_string).collect())
        .into_iter()
        .filter(|item| !item.is_empty())
        .collect()
}

/// Does this line open a shell function with the given name?
fn opens_function(line: &str, name: &str) -> bool {
    let line = line.trim_start();
    let (rest, keyword) = match line.strip_prefix("function ") {
        Some(rest) => (rest.trim_start(), true),
        None => (line, false),
    };
    let Some(after) = rest.strip_prefix(name) else { return false };
    let after = after.trim_start();
    after.starts_with("()") || (keyword && (after.is_empty() || after.starts_with('{')))
}

/// What: Parse a recipe script's metadata without executing it.
///
/// # Errors
///
/// `LpmError::Build` when the file is unreadable or `NAME`/`VERSION` are
/// missing.
pub fn parse_recipe(path: &Path) -> Result<Recipe> {
    let text = std::fs::read_to_string(path)
        .map_err(|err| LpmError::Build(format!("cannot read {}: {err}", path.display())))?;

    let mut recipe = Recipe { path: path.to_path_buf(), ..Recipe::default() };
    let mut lines = text.lines().peekable();
    while let Some(line) = lines.next() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        for (phase, function) in [
            (Phase::Prepare, "prepare"),
            (Phase::Build, "build"),
            (Phase::Check, "check"),
            (Phase::Staging, "staging"),
        ] {
            if opens_function(trimmed, function) {
                recipe.phases.insert(phase);
            }
        }
        if opens_function(trimmed, "install") {
            recipe.phases.insert(Phase::Staging);
            recipe.staging_is_install = true;
        }

        let Some((key, value)) = trimmed.split_once('=') else { continue };
        let key = key.trim();
        if !key.chars().all(|c| c.is_ascii_uppercase() || c == '_') || key.is_empty() {
            continue;
        }
        let mut value = value.trim().to_string();
        if value.starts_with('(') {
            // Array assignment, possibly spanning lines.
            while !value.contains(')') {
                match lines.next() {
                    Some(next) => {
                        value.push(' ');
                        value.push_str(next.trim());
                    }
                    None => break,
                }
            }
            let inner = value
                .trim_start_matches('(')
                .rsplit_once(')')
                .map_or("", |(body, _)| body)
                .to_string();
            let items = split_array(&inner);
            match key {
                "REQUIRES" => recipe.requires = items,
                "BUILD_REQUIRES" => recipe.build_requires = items,
                "PROVIDES" => recipe.provides = items,
                "CONFLICTS" => recipe.conflicts = items,
                "OBSOLETES" => recipe.obsoletes = items,
                "RECOMMENDS" => recipe.recommends = items,
                "SUGGESTS" => recipe.suggests = items,
                "SOURCE" => recipe.sources = items,
                other => tracing::debug!("ignoring recipe array {other}"),
            }
            continue;
        }
        let value = unquote(&value);
        match key {
            "NAME" => recipe.name = value,
            "VERSION" => recipe.version = value,
            "RELEASE" => recipe.release = value,
            "ARCH" => recipe.arch = value,
            "SUMMARY" => recipe.summary = value,
            "URL" => recipe.url = value,
            "LICENSE" => recipe.license = value,
            "REQUIRES" => recipe.requires = split_array(&value),
            "BUILD_REQUIRES" => recipe.build_requires = split_array(&value),
            "PROVIDES" => recipe.provides = split_array(&value),
            "CONFLICTS" => recipe.conflicts = split_array(&value),
            "OBSOLETES" => recipe.obsoletes = split_array(&value),
            "RECOMMENDS" => recipe.recommends = split_array(&value),
            "SUGGESTS" => recipe.suggests = split_array(&value),
            "SOURCE" => recipe.sources = split_array(&value),
            other => tracing::debug!("ignoring recipe key {other}"),
        }
    }

    if recipe.name.is_empty() {
        return Err(LpmError::Build(format!("{}: recipe missing NAME", path.display())));
    }
    if recipe.version.is_empty() {
        return Err(LpmError::Build(format!("{}: recipe missing VERSION", path.display())));
    }
    Ok(recipe)
}

#[cfg(test)]
mod tests {
    use super::*;

    const RECIPE: &str = r#"
NAME=hello
VERSION=1.2.3
RELEASE=2
ARCH=noarch
SUMMARY="An example package"
LICENSE=MIT
REQUIRES=(zlib>=1.2 "openssl (>= 3.0)")
BUILD_REQUIRES=(make gcc)
SOURCE=(https://example.org/hello-1.2.3.tar.gz)

prepare() {
    tar xf "$SRCDIR/hello-1.2.3.tar.gz"
}

build() {
    make -C hello-1.2.3
}

staging() {
    make -C hello-1.2.3 DESTDIR="$pkgdir" install
}
"#;

    fn write_recipe(body: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("hello.lpmbuild");
        std::fs::write(&path, body).expect("write");
        (dir, path)
    }

    #[test]
    fn test_parse_metadata_and_phases() {
        let (_dir, path) = write_recipe(RECIPE);
        let recipe = parse_recipe(&path).expect("parse");
        assert_eq!(recipe.name, "hello");
        assert_eq!(recipe.version, "1.2.3");
        assert_eq!(recipe.release, "2");
        assert_eq!(recipe.arch, "noarch");
        assert_eq!(recipe.summary, "An example package");
        assert_eq!(recipe.requires, vec!["zlib>=1.2", "openssl (>= 3.0)"]);
        assert_eq!(recipe.build_requires, vec!["make", "gcc"]);
        assert_eq!(recipe.sources, vec!["https://example.org/hello-1.2.3.tar.gz"]);
        assert_eq!(
            recipe.phases,
            HashSet::from([Phase::Prepare, Phase::Build, Phase::Staging])
        );
        assert!(!recipe.staging_is_install);
    }

    #[test]
    fn test_install_alias_for_staging() {
        let (_dir, path) = write_recipe(
            "NAME=x\nVERSION=1\ninstall(){\n  echo hi\n}\n",
        );
        let recipe = parse_recipe(&path).expect("parse");
        assert!(recipe.phases.contains(&Phase::Staging));
        assert!(recipe.staging_is_install);
        assert_eq!(recipe.phase_function(Phase::Staging), "install");
    }

    #[test]
    fn test_multiline_array() {
        let (_dir, path) = write_recipe(
            "NAME=x\nVERSION=1\nREQUIRES=(\n  alpha\n  beta>=2\n)\n",
        );
        let recipe = parse_recipe(&path).expect("parse");
        assert_eq!(recipe.requires, vec!["alpha", "beta>=2"]);
    }

    #[test]
    fn test_missing_name_or_version_rejected() {
        let (_dir, path) = write_recipe("VERSION=1\n");
        assert!(parse_recipe(&path).is_err());
        let (_dir, path) = write_recipe("NAME=x\n");
        assert!(parse_recipe(&path).is_err());
    }

    #[test]
    fn test_meta_defaults() {
        let (_dir, path) = write_recipe("NAME=x\nVERSION=1\n");
        let recipe = parse_recipe(&path).expect("parse");
        let meta = recipe.meta("x86_64");
        assert_eq!(meta.release, "1");
        assert_eq!(meta.arch, "x86_64");
    }
}
