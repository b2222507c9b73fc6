//! Source fetching and the download cache.
//!
//! A recipe's `SOURCE` entries come in three shapes:
//!
//! - an absolute URL (`https://…/tool-1.0.tar.gz`),
//! - `alias::URL` (fetch URL, save under `alias`),
//! - a bare name resolved against `<LPMBUILD_REPO>/<package>/<name>`.
//!
//! Downloads are cached under `<cache>/sources/` keyed by `sha256(url)` so
//! rebuilds are offline; redirect targets with `Content-Disposition`
//! filenames keep their server-provided name.

use crate::container::sha256_bytes;
use crate::error::{LpmError, Result};
use crate::fsio::safe_write;
use std::path::{Path, PathBuf};

/// A resolved source entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceSpec {
    /// Filename the source should appear as inside `SRCDIR`.
    pub file_name: String,
    /// Where it comes from.
    pub origin: SourceOrigin,
}

/// Where a source comes from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceOrigin {
    /// Remote URL.
    Url(String),
    /// Local file path.
    Path(PathBuf),
}

/// What: Resolve one `SOURCE` entry.
///
/// Inputs:
/// - `spec`: The raw entry.
/// - `package`: Recipe package name (for bare-name resolution).
/// - `recipe_dir`: Directory of the recipe (bare names fall back here).
///
/// Details:
/// - `alias::URL` downloads `URL` but saves it as `alias`.
/// - Bare names resolve against `$LPMBUILD_REPO/<package>/<name>`, then the
///   recipe directory.
pub fn resolve_source(spec: &str, package: &str, recipe_dir: &Path) -> Result<SourceSpec> {
    if let Some((alias, url)) = spec.split_once("::") {
        if alias.is_empty() || url.is_empty() {
            return Err(LpmError::Build(format!("malformed source spec {spec:?}")));
        }
        return Ok(SourceSpec {
            file_name: alias.to_string(),
            origin: SourceOrigin::Url(url.to_string()),
        });
    }
    if spec.starts_with("http://") || spec.starts_with("https://") {
        let file_name = spec
            .rsplit('/')
            .next()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| LpmError::Build(format!("source URL has no filename: {spec}")))?;
        return Ok(SourceSpec {
            file_name: file_name.to_string(),
            origin: SourceOrigin::Url(spec.to_string()),
        });
    }
    // Bare name.
    if let Ok(repo) = std::env::var("LPMBUILD_REPO") {
        let candidate = Path::new(&repo).join(package).join(spec);
        if candidate.exists() {
            return Ok(SourceSpec {
                file_name: spec.to_string(),
                origin: SourceOrigin::Path(candidate),
            });
        }
    }
    let local = recipe_dir.join(spec);
    if local.exists() {
        return Ok(SourceSpec {
            file_name: spec.to_string(),
            origin: SourceOrigin::Path(local),
        });
    }
    Err(LpmError::Build(format!("source {spec:?} not found for {package}")))
}

fn content_disposition_name(response: &reqwest::blocking::Response) -> Option<String> {
    let header = response
        .headers()
        .get(reqwest::header::CONTENT_DISPOSITION)?
        .to_str()
        .ok()?;
    for part in header.split(';') {
        let part = part.trim();
        if let Some(value) = part.strip_prefix("filename=") {
            let name = value.trim_matches('"').trim();
            if !name.is_empty() && !name.contains('/') {
                return Some(name.to_string());
            }
        }
    }
    None
}

/// What: Fetch a source into `srcdir`, using the download cache.
///
/// Inputs:
/// - `client`: Blocking HTTP client.
/// - `cache_dir`: Root cache directory (`sources/` is created below it).
/// - `spec`: Resolved source.
/// - `srcdir`: Build source directory receiving the file.
///
/// Output:
/// - `(path in srcdir, final file name)`. The name may differ from the
///   requested one when the server supplied a `Content-Disposition`.
pub fn fetch_source(
    client: &reqwest::blocking::Client,
    cache_dir: &Path,
    spec: &SourceSpec,
    srcdir: &Path,
) -> Result<(PathBuf, String)> {
    std::fs::create_dir_all(srcdir)?;
    match &spec.origin {
        SourceOrigin::Path(source) => {
            let dest = srcdir.join(&spec.file_name);
            std::fs::copy(source, &dest)?;
            Ok((dest, spec.file_name.clone()))
        }
        SourceOrigin::Url(url) => {
            let key = sha256_bytes(url.as_bytes());
            let cache_root = cache_dir.join("sources");
            std::fs::create_dir_all(&cache_root)?;
            let cached = cache_root.join(&key);
            let name_file = cache_root.join(format!("{key}.name"));

            let file_name;
            if cached.exists() {
                tracing::debug!("source cache hit for {url}");
                file_name = std::fs::read_to_string(&name_file)
                    .map(|n| n.trim().to_string())
                    .ok()
                    .filter(|n| !n.is_empty())
                    .unwrap_or_else(|| spec.file_name.clone());
            } else {
                tracing::info!("fetching {url}");
                let response = client.get(url).send()?.error_for_status()?;
                file_name =
                    content_disposition_name(&response).unwrap_or_else(|| spec.file_name.clone());
                let body = response.bytes()?;
                safe_write(&cached, &body, Some(0o644))?;
                safe_write(&name_file, file_name.as_bytes(), Some(0o644))?;
            }
            let dest = srcdir.join(&file_name);
            std::fs::copy(&cached, &dest)?;
            Ok((dest, file_name))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_absolute_url() {
        let dir = tempfile::tempdir().expect("tempdir");
        let spec = resolve_source("https://example.org/a/tool-1.0.tar.gz", "tool", dir.path())
            .expect("resolve");
        assert_eq!(spec.file_name, "tool-1.0.tar.gz");
        assert_eq!(
            spec.origin,
            SourceOrigin::Url("https://example.org/a/tool-1.0.tar.gz".into())
        );
    }

    #[test]
    fn test_resolve_alias_url() {
        let dir = tempfile::tempdir().expect("tempdir");
        let spec = resolve_source("renamed.tar.gz::https://example.org/dl?id=7", "tool", dir.path())
            .expect("resolve");
        assert_eq!(spec.file_name, "renamed.tar.gz");
        assert_eq!(spec.origin, SourceOrigin::Url("https://example.org/dl?id=7".into()));
    }

    #[test]
    fn test_resolve_bare_name_from_recipe_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("local.patch"), b"--- a\n").expect("write");
        let spec = resolve_source("local.patch", "tool", dir.path()).expect("resolve");
        assert_eq!(spec.file_name, "local.patch");
        assert!(matches!(spec.origin, SourceOrigin::Path(_)));
    }

    #[test]
    fn test_resolve_missing_bare_name_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(resolve_source("nope.tar.gz", "tool", dir.path()).is_err());
    }

    #[test]
    fn test_fetch_local_source_copies_into_srcdir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let src = dir.path().join("payload.tar.gz");
        std::fs::write(&src, b"payload").expect("write");
        let spec = SourceSpec {
            file_name: "payload.tar.gz".into(),
            origin: SourceOrigin::Path(src),
        };
        let client = reqwest::blocking::Client::new();
        let srcdir = dir.path().join("srcdir");
        let (path, name) =
            fetch_source(&client, &dir.path().join("cache"), &spec, &srcdir).expect("fetch");
        assert_eq!(name, "payload.tar.gz");
        assert_eq!(std::fs::read(path).expect("read"), b"payload");
    }
}
