//! Recipe build pipeline.
//!
//! The driver parses a recipe, satisfies its build-time dependencies
//! (recursively building what the installed system does not provide),
//! fetches sources into the cache, runs the lifecycle phases in a sandbox,
//! and packages the staged tree into a main artifact plus any split
//! packages the recipe requested through `$LPM_SPLIT_PACKAGE`.

pub mod installgen;
pub mod recipe;
pub mod sandbox;
pub mod sources;

use crate::config::Config;
use crate::container::build_package;
use crate::error::{LpmError, Result};
use crate::types::PkgMeta;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

pub use recipe::{Phase, Recipe, parse_recipe};
pub use sandbox::{CpuOverrides, SandboxMode, compiler_env, detect_sandbox, parse_cpu_overrides};

/// Options for one build invocation.
#[derive(Clone, Debug, Default)]
pub struct BuildOptions {
    /// Resolve and build missing build-time dependencies first.
    pub build_deps: bool,
    /// Rebuild even when the artifact already exists in the output dir.
    pub force_rebuild: bool,
    /// CPU tuning overrides from the command line.
    pub overrides: CpuOverrides,
    /// Sandbox selection; `None` auto-detects.
    pub sandbox: Option<SandboxMode>,
    /// Recipe repository for dependency builds
    /// (`<repo>/<name>/<name>.lpmbuild`); defaults to `$LPMBUILD_REPO`.
    pub recipe_repo: Option<PathBuf>,
}

/// Result of a successful build.
#[derive(Debug)]
pub struct BuildOutput {
    /// Main artifact path.
    pub artifact: PathBuf,
    /// Main package metadata.
    pub meta: PkgMeta,
    /// Wall-clock duration of the phase runs.
    pub duration: Duration,
    /// Number of phases executed.
    pub phases_run: usize,
    /// Split artifacts with their metadata.
    pub splits: Vec<(PathBuf, PkgMeta)>,
}

/// What: Build a recipe into package artifacts.
///
/// Inputs:
/// - `config`: Tuning, worker count, cache location.
/// - `installed`: Capability tokens currently installed (loaded once per
///   invocation by the caller, not per dependency scan).
/// - `script`: Recipe path.
/// - `outdir`: Directory receiving artifacts.
/// - `opts`: Build options.
///
/// # Errors
///
/// - `DependencyCycle` when build-requires loop.
/// - `Build` for recipe, source, or phase failures (partially staged trees
///   are discarded with the scratch directory).
pub fn run_build(
    config: &Config,
    installed: &HashSet<String>,
    script: &Path,
    outdir: &Path,
    opts: &BuildOptions,
) -> Result<BuildOutput> {
    let client = crate::index::http_client(config)?;
    let built = std::sync::Mutex::new(HashSet::new());
    let ctx = BuildCtx { config, client, installed, built: &built };
    build_recursive(&ctx, script, outdir, opts, &[])
}

struct BuildCtx<'a> {
    config: &'a Config,
    client: reqwest::blocking::Client,
    installed: &'a HashSet<String>,
    built: &'a std::sync::Mutex<HashSet<String>>,
}

fn recipe_repo(opts: &BuildOptions) -> Option<PathBuf> {
    opts.recipe_repo
        .clone()
        .or_else(|| std::env::var("LPMBUILD_REPO").ok().map(PathBuf::from))
}

/// Names this recipe needs at build time that neither the installed system
/// nor a finished dependency build provides.
fn missing_deps(
    recipe: &Recipe,
    installed: &HashSet<String>,
    built: &HashSet<String>,
) -> Result<Vec<String>> {
    let mut missing = Vec::new();
    for expr_text in recipe.requires.iter().chain(recipe.build_requires.iter()) {
        let expr = crate::deps::parse_dep_expr(expr_text)?;
        for conjunct in expr.conjuncts() {
            let atoms = conjunct.or_atoms();
            if atoms.is_empty() {
                continue;
            }
            let satisfied = atoms
                .iter()
                .any(|atom| installed.contains(&atom.name) || built.contains(&atom.name));
            if !satisfied {
                let name = atoms[0].name.clone();
                if !missing.contains(&name) {
                    missing.push(name);
                }
            }
        }
    }
    Ok(missing)
}

fn build_recursive(
    ctx: &BuildCtx<'_>,
    script: &Path,
    outdir: &Path,
    opts: &BuildOptions,
    chain: &[String],
) -> Result<BuildOutput> {
    let recipe = parse_recipe(script)?;

    if chain.contains(&recipe.name) {
        let mut names = chain.to_vec();
        names.push(recipe.name.clone());
        return Err(LpmError::DependencyCycle { names });
    }

    if opts.build_deps {
        let missing = {
            let built = ctx.built.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            missing_deps(&recipe, ctx.installed, &built)?
        };
        if !missing.is_empty() {
            build_dependencies(ctx, &recipe, &missing, outdir, opts, chain)?;
        }
    }

    let meta = recipe.meta(&ctx.config.arch);
    let artifact_name = format!(
        "{}-{}-{}.{}{}",
        meta.name, meta.version, meta.release, meta.arch,
        crate::config::PKG_SUFFIX
    );
    let existing = outdir.join(&artifact_name);
    if existing.exists() && !opts.force_rebuild {
        tracing::info!("reusing existing artifact {}", existing.display());
        record_built(ctx, &meta);
        return Ok(BuildOutput {
            artifact: existing,
            meta,
            duration: Duration::ZERO,
            phases_run: 0,
            splits: Vec::new(),
        });
    }

    let output = execute_build(ctx, &recipe, outdir, opts)?;
    record_built(ctx, &output.meta);
    Ok(output)
}

fn record_built(ctx: &BuildCtx<'_>, meta: &PkgMeta) {
    let mut built = ctx.built.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    for token in meta.provide_tokens() {
        built.insert(token);
    }
}

/// Build missing dependencies, independent ones in parallel on the bounded
/// worker pool.
fn build_dependencies(
    ctx: &BuildCtx<'_>,
    recipe: &Recipe,
    missing: &[String],
    outdir: &Path,
    opts: &BuildOptions,
    chain: &[String],
) -> Result<()> {
    let repo = recipe_repo(opts).ok_or_else(|| {
        LpmError::Build(format!(
            "{} needs {:?} but no recipe repository is configured",
            recipe.name, missing
        ))
    })?;

    let mut chain = chain.to_vec();
    chain.push(recipe.name.clone());

    let mut scripts = Vec::new();
    for name in missing {
        let dep_script = repo.join(name).join(format!("{name}.lpmbuild"));
        if !dep_script.exists() {
            return Err(LpmError::Build(format!(
                "missing build dependency {name} (no recipe at {})",
                dep_script.display()
            )));
        }
        scripts.push(dep_script);
    }

    for wave in scripts.chunks(ctx.config.build_workers.max(1)) {
        std::thread::scope(|scope| -> Result<()> {
            let mut handles = Vec::new();
            for dep_script in wave {
                let chain = chain.clone();
                handles.push(scope.spawn(move || {
                    build_recursive(ctx, dep_script, outdir, opts, &chain)
                }));
            }
            for handle in handles {
                handle
                    .join()
                    .map_err(|_| LpmError::Build("dependency build panicked".to_string()))??;
            }
            Ok(())
        })?;
    }
    Ok(())
}

const SPLIT_HELPER: &str = "#!/bin/sh\n\
out=$(mktemp \"$LPM_SPLIT_SPOOL/split.XXXXXX\")\n\
for arg in \"$@\"; do\n\
  printf '%s\\n' \"$arg\" >> \"$out\"\n\
done\n";

fn execute_build(
    ctx: &BuildCtx<'_>,
    recipe: &Recipe,
    outdir: &Path,
    opts: &BuildOptions,
) -> Result<BuildOutput> {
    let meta = recipe.meta(&ctx.config.arch);
    let work = tempfile::Builder::new()
        .prefix(&format!("lpm-build-{}-", recipe.name))
        .tempdir()?;
    let srcdir = work.path().join("src");
    let pkgdir = work.path().join("pkg");
    let spool = work.path().join("spool");
    std::fs::create_dir_all(&srcdir)?;
    std::fs::create_dir_all(&pkgdir)?;
    std::fs::create_dir_all(&spool)?;

    let helper = work.path().join("lpm-split-package");
    std::fs::write(&helper, SPLIT_HELPER)?;
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&helper, std::fs::Permissions::from_mode(0o755))?;
    }

    let recipe_dir = recipe
        .path
        .parent()
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    for spec_text in &recipe.sources {
        let spec = sources::resolve_source(spec_text, &recipe.name, &recipe_dir)?;
        let (path, name) =
            sources::fetch_source(&ctx.client, &ctx.config.cache_dir(), &spec, &srcdir)?;
        tracing::debug!("source {name} ready at {}", path.display());
    }

    let mut env: Vec<(String, String)> = vec![
        ("NAME".into(), meta.name.clone()),
        ("VERSION".into(), meta.version.clone()),
        ("RELEASE".into(), meta.release.clone()),
        ("ARCH".into(), meta.arch.clone()),
        ("SRCDIR".into(), srcdir.display().to_string()),
        ("BUILDROOT".into(), work.path().display().to_string()),
        ("pkgdir".into(), pkgdir.display().to_string()),
        ("LPM_SPLIT_PACKAGE".into(), helper.display().to_string()),
        ("LPM_SPLIT_SPOOL".into(), spool.display().to_string()),
        ("MAKEFLAGS".into(), format!("-j{}", ctx.config.build_workers)),
    ];
    env.extend(compiler_env(&ctx.config.cpu, &opts.overrides));

    let mode = opts.sandbox.unwrap_or_else(detect_sandbox);
    let started = Instant::now();
    let mut phases_run = 0usize;
    for phase in Phase::ORDER {
        if !recipe.phases.contains(&phase) {
            continue;
        }
        let function = recipe.phase_function(phase);
        tracing::info!("[{}] running phase {function}", recipe.name);
        sandbox::run_phase(function, &recipe.path, &srcdir, &env, mode)?;
        phases_run += 1;
    }
    let duration = started.elapsed();

    let script_body = installgen::generate_install_script(&pkgdir)?;
    if !script_body.is_empty() {
        let script_path = pkgdir.join(".lpm-install.sh");
        std::fs::write(&script_path, script_body)?;
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755))?;
    }

    // Package into a scratch dir inside outdir, then promote by rename, so
    // concurrent dependency builds never observe half-written artifacts.
    std::fs::create_dir_all(outdir)?;
    let scratch = tempfile::Builder::new().prefix(".lpm-out-").tempdir_in(outdir)?;
    let (artifact_tmp, _manifest) = build_package(&pkgdir, &meta, scratch.path())?;
    let splits_tmp = collect_splits(ctx, recipe, &meta, &spool, scratch.path())?;

    let artifact = promote(&artifact_tmp, outdir)?;
    let mut splits = Vec::new();
    for (path, split_meta) in splits_tmp {
        splits.push((promote(&path, outdir)?, split_meta));
    }

    Ok(BuildOutput { artifact, meta, duration, phases_run, splits })
}

/// Rename a freshly built artifact from the scratch dir into `outdir`.
fn promote(tmp: &Path, outdir: &Path) -> Result<PathBuf> {
    let name = tmp
        .file_name()
        .ok_or_else(|| LpmError::Build(format!("artifact path {} has no name", tmp.display())))?;
    let dest = outdir.join(name);
    std::fs::rename(tmp, &dest)?;
    Ok(dest)
}

/// Package every split the recipe requested via the helper spool.
fn collect_splits(
    _ctx: &BuildCtx<'_>,
    recipe: &Recipe,
    parent: &PkgMeta,
    spool: &Path,
    outdir: &Path,
) -> Result<Vec<(PathBuf, PkgMeta)>> {
    let mut requests: Vec<PathBuf> = std::fs::read_dir(spool)?
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect();
    requests.sort();

    let mut splits = Vec::new();
    for request in requests {
        let text = std::fs::read_to_string(&request)?;
        let args: Vec<String> = text.lines().map(ToString::to_string).collect();
        let split = parse_split_request(recipe, parent, &args)?;
        let stagedir = PathBuf::from(&split.stagedir);
        if !stagedir.is_dir() {
            return Err(LpmError::Build(format!(
                "split {} stage dir {} does not exist",
                split.meta.name, split.stagedir
            )));
        }
        let (path, _) = build_package(&stagedir, &split.meta, outdir)?;
        tracing::info!("built split package {}", split.meta.name);
        splits.push((path, split.meta));
    }
    Ok(splits)
}

struct SplitRequest {
    stagedir: String,
    meta: PkgMeta,
}

fn parse_split_request(
    recipe: &Recipe,
    parent: &PkgMeta,
    args: &[String],
) -> Result<SplitRequest> {
    let mut stagedir = None;
    let mut meta = PkgMeta {
        version: parent.version.clone(),
        release: parent.release.clone(),
        arch: parent.arch.clone(),
        url: parent.url.clone(),
        license: parent.license.clone(),
        ..PkgMeta::default()
    };
    let mut iter = args.iter();
    while let Some(flag) = iter.next() {
        let mut value = || {
            iter.next().cloned().ok_or_else(|| {
                LpmError::Build(format!("split request in {}: {flag} needs a value", recipe.name))
            })
        };
        match flag.as_str() {
            "--stagedir" => stagedir = Some(value()?),
            "--name" => meta.name = value()?,
            "--summary" => meta.summary = value()?,
            "--requires" => meta.requires.push(value()?),
            "--provides" => meta.provides.push(value()?),
            "--conflicts" => meta.conflicts.push(value()?),
            "--obsoletes" => meta.obsoletes.push(value()?),
            other => {
                tracing::warn!("ignoring unknown split flag {other} in {}", recipe.name);
            }
        }
    }
    let stagedir = stagedir.ok_or_else(|| {
        LpmError::Build(format!("split request in {} missing --stagedir", recipe.name))
    })?;
    if meta.name.is_empty() {
        return Err(LpmError::Build(format!(
            "split request in {} missing --name",
            recipe.name
        )));
    }
    Ok(SplitRequest { stagedir, meta })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &Path) -> Config {
        let mut config = Config::from_env();
        config.state_dir = dir.join("state");
        config.build_workers = 2;
        config
    }

    fn opts_no_sandbox() -> BuildOptions {
        BuildOptions { sandbox: Some(SandboxMode::None), ..BuildOptions::default() }
    }

    const SPLIT_RECIPE: &str = r#"NAME=foo
VERSION=1.2.3
RELEASE=2
ARCH=noarch
SUMMARY="Base package"
prepare(){ :; }
build(){ :; }
install(){
  mkdir -p "$pkgdir/usr/bin"
  echo base > "$pkgdir/usr/bin/foo"
  split_a="$BUILDROOT/split-a"
  mkdir -p "$split_a/usr/bin"
  echo alpha > "$split_a/usr/bin/foo-alpha"
  "$LPM_SPLIT_PACKAGE" --stagedir "$split_a" --name foo-alpha --summary "Alpha compiler" --requires bar
  split_b="$BUILDROOT/split-b"
  mkdir -p "$split_b/usr/bin"
  echo beta > "$split_b/usr/bin/foo-beta"
  "$LPM_SPLIT_PACKAGE" --stagedir "$split_b" --name foo-beta --provides foo-beta-bin
}
"#;

    #[test]
    fn test_build_creates_main_and_split_packages() {
        let dir = tempfile::tempdir().expect("tempdir");
        let script = dir.path().join("split.lpmbuild");
        std::fs::write(&script, SPLIT_RECIPE).expect("write");
        let config = test_config(dir.path());

        let output = run_build(
            &config,
            &HashSet::new(),
            &script,
            &dir.path().join("out"),
            &opts_no_sandbox(),
        )
        .expect("build");

        assert!(output.artifact.exists());
        assert_eq!(output.phases_run, 3);
        assert_eq!(output.splits.len(), 2);
        let mut names: Vec<&str> =
            output.splits.iter().map(|(_, m)| m.name.as_str()).collect();
        names.sort_unstable();
        assert_eq!(names, vec!["foo-alpha", "foo-beta"]);
        for (path, meta) in &output.splits {
            assert!(path.exists());
            assert_eq!(meta.version, "1.2.3");
            assert_eq!(meta.release, "2");
            match meta.name.as_str() {
                "foo-alpha" => {
                    assert_eq!(meta.requires, vec!["bar"]);
                    assert_eq!(meta.summary, "Alpha compiler");
                }
                "foo-beta" => assert_eq!(meta.provides, vec!["foo-beta-bin"]),
                other => panic!("unexpected split {other}"),
            }
        }

        // The main artifact carries the staged payload.
        let (meta, manifest) =
            crate::container::read_package_meta(&output.artifact).expect("read");
        assert_eq!(meta.name, "foo");
        assert!(manifest.iter().any(|e| e.path == "/usr/bin/foo"));
    }

    #[test]
    fn test_failing_phase_aborts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let script = dir.path().join("bad.lpmbuild");
        std::fs::write(&script, "NAME=bad\nVERSION=1\nbuild(){ false; }\n").expect("write");
        let config = test_config(dir.path());
        let err = run_build(
            &config,
            &HashSet::new(),
            &script,
            &dir.path().join("out"),
            &opts_no_sandbox(),
        )
        .expect_err("phase failure");
        assert!(err.to_string().contains("phase build failed"));
        // No artifact left behind.
        assert!(!dir.path().join("out/bad-1-1.noarch.zst").exists());
    }

    #[test]
    fn test_existing_artifact_reused_without_force() {
        let dir = tempfile::tempdir().expect("tempdir");
        let script = dir.path().join("tool.lpmbuild");
        std::fs::write(
            &script,
            "NAME=tool\nVERSION=1\nARCH=noarch\nstaging(){ mkdir -p \"$pkgdir\"; echo x > \"$pkgdir/file\"; }\n",
        )
        .expect("write");
        let config = test_config(dir.path());
        let out = dir.path().join("out");
        let first = run_build(&config, &HashSet::new(), &script, &out, &opts_no_sandbox())
            .expect("first build");
        assert_eq!(first.phases_run, 1);
        let second = run_build(&config, &HashSet::new(), &script, &out, &opts_no_sandbox())
            .expect("second build");
        assert_eq!(second.phases_run, 0);
        assert_eq!(first.artifact, second.artifact);
    }

    #[test]
    fn test_dependency_cycle_detected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let repo = dir.path().join("repo");
        for (name, dep) in [("a", "b"), ("b", "a")] {
            let pkg_dir = repo.join(name);
            std::fs::create_dir_all(&pkg_dir).expect("mkdir");
            std::fs::write(
                pkg_dir.join(format!("{name}.lpmbuild")),
                format!("NAME={name}\nVERSION=1\nARCH=noarch\nBUILD_REQUIRES=({dep})\n"),
            )
            .expect("write");
        }
        let config = test_config(dir.path());
        let opts = BuildOptions {
            build_deps: true,
            sandbox: Some(SandboxMode::None),
            recipe_repo: Some(repo.clone()),
            ..BuildOptions::default()
        };
        let err = run_build(
            &config,
            &HashSet::new(),
            &repo.join("a/a.lpmbuild"),
            &dir.path().join("out"),
            &opts,
        )
        .expect_err("cycle");
        match err {
            LpmError::DependencyCycle { names } => {
                assert_eq!(names.first().map(String::as_str), Some("a"));
                assert_eq!(names.last().map(String::as_str), Some("a"));
            }
            other => panic!("expected DependencyCycle, got {other}"),
        }
    }

    #[test]
    fn test_missing_dependency_built_from_recipe_repo() {
        let dir = tempfile::tempdir().expect("tempdir");
        let repo = dir.path().join("repo");
        let dep_dir = repo.join("libdep");
        std::fs::create_dir_all(&dep_dir).expect("mkdir");
        std::fs::write(
            dep_dir.join("libdep.lpmbuild"),
            "NAME=libdep\nVERSION=1\nARCH=noarch\nstaging(){ mkdir -p \"$pkgdir\"; echo lib > \"$pkgdir/lib\"; }\n",
        )
        .expect("write");
        let script = dir.path().join("app.lpmbuild");
        std::fs::write(
            &script,
            "NAME=app\nVERSION=1\nARCH=noarch\nREQUIRES=(libdep)\nstaging(){ mkdir -p \"$pkgdir\"; echo app > \"$pkgdir/app\"; }\n",
        )
        .expect("write");
        let config = test_config(dir.path());
        let out = dir.path().join("out");
        let opts = BuildOptions {
            build_deps: true,
            sandbox: Some(SandboxMode::None),
            recipe_repo: Some(repo),
            ..BuildOptions::default()
        };
        let output = run_build(&config, &HashSet::new(), &script, &out, &opts)
            .expect("build with dep");
        assert!(output.artifact.exists());
        assert!(out.join("libdep-1-1.noarch.zst").exists());

        // With deps disabled the dependency is simply not built.
        let out2 = dir.path().join("out2");
        let output = run_build(
            &config,
            &HashSet::new(),
            &script,
            &out2,
            &opts_no_sandbox(),
        )
        .expect("build without deps");
        assert!(output.artifact.exists());
        assert!(!out2.join("libdep-1-1.noarch.zst").exists());
    }

    #[test]
    fn test_installed_dependency_not_rebuilt() {
        let dir = tempfile::tempdir().expect("tempdir");
        let script = dir.path().join("app.lpmbuild");
        std::fs::write(
            &script,
            "NAME=app\nVERSION=1\nARCH=noarch\nREQUIRES=(glibc)\nstaging(){ mkdir -p \"$pkgdir\"; echo app > \"$pkgdir/app\"; }\n",
        )
        .expect("write");
        let config = test_config(dir.path());
        let installed: HashSet<String> = HashSet::from(["glibc".to_string()]);
        let opts = BuildOptions {
            build_deps: true,
            sandbox: Some(SandboxMode::None),
            ..BuildOptions::default()
        };
        // No recipe repo configured; succeeds because glibc is installed.
        let output = run_build(&config, &installed, &script, &dir.path().join("out"), &opts)
            .expect("build");
        assert!(output.artifact.exists());
    }
}
