//! Command-line surface.
//!
//! The binary is thin glue: parse arguments, build the [`Config`], open the
//! state store, and hand work to the resolver, transaction engine, build
//! pipeline, and index layer. Exit codes: 0 success, 1 operation failure,
//! 2 usage or resolution failure, 77 missing privileges.

use crate::build::{BuildOptions, parse_cpu_overrides, run_build};
use crate::config::Config;
use crate::container::sign;
use crate::deps::parse_dep_expr;
use crate::error::{LpmError, Result};
use crate::index::{
    IndexCache, build_universe, ensure_artifact, http_client, load_repos, save_repos,
};
use crate::resolver::{ResolveOptions, Universe, solve};
use crate::state::{StateStore, open_store};
use crate::txn::{ConflictChoice, Engine, TxnOptions};
use crate::types::Repo;
use clap::{Parser, Subcommand};
use std::collections::HashSet;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "lpm",
    version,
    about = "Linux package manager with a CDCL dependency resolver"
)]
struct Cli {
    /// Filesystem root to operate on.
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Plan and validate only; mutate nothing.
    #[arg(long, global = true)]
    dry_run: bool,

    /// Skip signature verification.
    #[arg(long, global = true)]
    no_verify: bool,

    /// Override protected-package refusals.
    #[arg(long, global = true)]
    force: bool,

    /// Allow the JSON state-store fallback.
    #[arg(long, global = true)]
    allow_fallback: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Resolve and install packages from the configured repositories.
    Install {
        /// Goal expressions (names, atoms with versions, OR alternatives).
        #[arg(required = true)]
        packages: Vec<String>,
    },
    /// Remove installed packages.
    Remove {
        #[arg(required = true)]
        packages: Vec<String>,
    },
    /// Upgrade all installed packages, or only the ones named.
    Upgrade {
        packages: Vec<String>,
    },
    /// Search candidate names and summaries.
    Search {
        pattern: String,
    },
    /// Show metadata of a package.
    Info {
        package: String,
    },
    /// List files owned by an installed package.
    Files {
        package: String,
    },
    /// List installed packages.
    List,
    /// Show recent transaction history.
    History {
        /// Maximum rows shown.
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Build a package from a recipe script.
    Buildpkg {
        /// Recipe (`.lpmbuild`) path.
        script: PathBuf,
        /// Output directory for artifacts.
        #[arg(long, default_value = ".")]
        outdir: PathBuf,
        /// Skip building missing dependencies.
        #[arg(long)]
        no_deps: bool,
        /// Rebuild even when the artifact already exists.
        #[arg(long)]
        force_rebuild: bool,
        /// CPU tuning overrides (`@Override=arch=…`, `@none!`, `@lto!=on`).
        #[arg(long = "override", value_name = "OVERRIDE")]
        overrides: Vec<String>,
    },
    /// Install a local package artifact.
    Installpkg {
        file: PathBuf,
    },
    /// Add a repository.
    Repoadd {
        name: String,
        url: String,
        /// Priority; lower wins.
        #[arg(long, default_value_t = 50)]
        priority: i64,
    },
    /// Remove a repository.
    Repodel {
        name: String,
    },
    /// List configured repositories.
    Repolist,
    /// Delete cached repository blobs and sources.
    CleanCache,
    /// Remove dependency-only packages nothing explicit needs.
    Autoremove,
    /// Generate the artifact signing keypair.
    Keygen,
}

/// What: Run the CLI, returning the process exit code.
pub fn run() -> i32 {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return if err.use_stderr() { 2 } else { 0 };
        }
    };
    let mut config = Config::from_env();
    if let Some(root) = &cli.root {
        config.root = root.clone();
    }
    config.load_protected();

    match dispatch(&cli, &config) {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("error: {err}");
            err.exit_code()
        }
    }
}

fn txn_options(cli: &Cli) -> TxnOptions {
    TxnOptions {
        dry_run: cli.dry_run,
        verify: !cli.no_verify,
        force: cli.force,
        assume_conflict: cli.force.then_some(ConflictChoice::Replace),
    }
}

fn open_state(cli: &Cli, config: &Config) -> Result<Box<dyn StateStore>> {
    std::fs::create_dir_all(&config.state_dir)?;
    open_store(&config.db_path(), cli.allow_fallback)
}

/// Resolve goals against the repositories and fetch the plan's artifacts.
fn plan_artifacts(
    config: &Config,
    universe: &Universe,
    client: &reqwest::blocking::Client,
    goals: &[String],
) -> Result<Vec<PathBuf>> {
    let plan = solve(goals, universe, ResolveOptions::default())?;
    let mut files = Vec::new();
    for meta in &plan {
        if let Some(installed) = universe.installed.get(&meta.name)
            && installed.version == meta.version
            && installed.release == meta.release
        {
            tracing::info!("{} is already up to date", meta.full_id());
            continue;
        }
        files.push(ensure_artifact(config, client, meta)?);
    }
    Ok(files)
}

fn dispatch(cli: &Cli, config: &Config) -> Result<()> {
    match &cli.command {
        Commands::Install { packages } => cmd_install(cli, config, packages),
        Commands::Remove { packages } => {
            let mut store = open_state(cli, config)?;
            let mut engine = Engine::new(config, store.as_mut());
            engine.remove(packages, &txn_options(cli))?;
            Ok(())
        }
        Commands::Upgrade { packages } => cmd_upgrade(cli, config, packages),
        Commands::Search { pattern } => cmd_search(cli, config, pattern),
        Commands::Info { package } => cmd_info(cli, config, package),
        Commands::Files { package } => {
            let store = open_state(cli, config)?;
            let record = store
                .get_installed(package)?
                .ok_or_else(|| LpmError::InvalidInput(format!("{package} is not installed")))?;
            for entry in &record.manifest {
                println!("{}", entry.path);
            }
            Ok(())
        }
        Commands::List => {
            let store = open_state(cli, config)?;
            for record in store.all_installed()? {
                let marker = if record.explicit == 1 { "" } else { " (dep)" };
                println!("{}-{}-{}{marker}", record.name, record.version, record.release);
            }
            Ok(())
        }
        Commands::History { limit } => {
            let store = open_state(cli, config)?;
            for entry in store.recent_history(*limit)? {
                let from = entry.from_ver.as_deref().unwrap_or("-");
                let to = entry.to_ver.as_deref().unwrap_or("-");
                println!("{}  {:10}  {}  {from} -> {to}", entry.ts, entry.action, entry.name);
            }
            Ok(())
        }
        Commands::Buildpkg { script, outdir, no_deps, force_rebuild, overrides } => {
            cmd_buildpkg(cli, config, script, outdir, *no_deps, *force_rebuild, overrides)
        }
        Commands::Installpkg { file } => cmd_installpkg(cli, config, file),
        Commands::Repoadd { name, url, priority } => {
            let mut repos = load_repos(&config.repos_path())?;
            if repos.iter().any(|r| r.name == *name) {
                return Err(LpmError::InvalidInput(format!("repo {name} already exists")));
            }
            repos.push(Repo {
                name: name.clone(),
                url: url.clone(),
                priority: *priority,
                bias: None,
                decay: None,
            });
            save_repos(&config.repos_path(), &repos)?;
            println!("added repo {name}");
            Ok(())
        }
        Commands::Repodel { name } => {
            let mut repos = load_repos(&config.repos_path())?;
            let before = repos.len();
            repos.retain(|r| r.name != *name);
            if repos.len() == before {
                return Err(LpmError::InvalidInput(format!("no such repo: {name}")));
            }
            save_repos(&config.repos_path(), &repos)?;
            println!("removed repo {name}");
            Ok(())
        }
        Commands::Repolist => {
            for repo in load_repos(&config.repos_path())? {
                println!("{:20} prio={:<4} {}", repo.name, repo.priority, repo.url);
            }
            Ok(())
        }
        Commands::CleanCache => {
            let cache = config.cache_dir();
            if cache.exists() {
                std::fs::remove_dir_all(&cache)?;
            }
            std::fs::create_dir_all(&cache)?;
            println!("cache cleaned");
            Ok(())
        }
        Commands::Autoremove => {
            let mut store = open_state(cli, config)?;
            let mut engine = Engine::new(config, store.as_mut());
            let removed = engine.autoremove(&txn_options(cli))?;
            if removed.is_empty() {
                println!("nothing to do");
            } else {
                println!("removed: {}", removed.join(", "));
            }
            Ok(())
        }
        Commands::Keygen => {
            sign::generate_keypair(&config.signing_key, &config.verify_key)?;
            println!(
                "wrote {} and {}",
                config.signing_key.display(),
                config.verify_key.display()
            );
            Ok(())
        }
    }
}

fn cmd_install(cli: &Cli, config: &Config, goals: &[String]) -> Result<()> {
    for goal in goals {
        parse_dep_expr(goal)?;
    }
    let mut store = open_state(cli, config)?;
    let client = http_client(config)?;
    let mut cache = IndexCache::new(config.index_ttl);
    let repos = load_repos(&config.repos_path())?;
    let universe = build_universe(config, store.as_ref(), &repos, &client, &mut cache)?;

    let files = plan_artifacts(config, &universe, &client, goals)?;
    if files.is_empty() {
        println!("nothing to do");
        return Ok(());
    }

    let explicit: HashSet<String> = goals
        .iter()
        .filter_map(|g| parse_dep_expr(g).ok())
        .flat_map(|expr| {
            expr.conjuncts()
                .iter()
                .flat_map(|c| c.or_atoms())
                .map(|a| a.name.clone())
                .collect::<Vec<_>>()
        })
        .collect();

    let mut resolver = |requires: &[String]| -> Result<Vec<PathBuf>> {
        plan_artifacts(config, &universe, &client, requires)
    };
    let resolver: &mut crate::txn::MetaResolver<'_> = &mut resolver;
    let mut engine = Engine::new(config, store.as_mut());
    engine.install_files(&files, &txn_options(cli), &explicit, Some(resolver))?;
    Ok(())
}

fn cmd_upgrade(cli: &Cli, config: &Config, packages: &[String]) -> Result<()> {
    let mut store = open_state(cli, config)?;
    let client = http_client(config)?;
    let mut cache = IndexCache::new(config.index_ttl);
    let repos = load_repos(&config.repos_path())?;
    let universe = build_universe(config, store.as_ref(), &repos, &client, &mut cache)?;

    let goals: Vec<String> = if packages.is_empty() {
        universe
            .installed
            .keys()
            .filter(|name| universe.by_name.contains_key(*name))
            .cloned()
            .collect()
    } else {
        packages.to_vec()
    };
    if goals.is_empty() {
        println!("nothing to upgrade");
        return Ok(());
    }

    let files = plan_artifacts(config, &universe, &client, &goals)?;
    if files.is_empty() {
        println!("everything is up to date");
        return Ok(());
    }
    let mut engine = Engine::new(config, store.as_mut());
    engine.install_files(&files, &txn_options(cli), &HashSet::new(), None)?;
    Ok(())
}

fn cmd_search(cli: &Cli, config: &Config, pattern: &str) -> Result<()> {
    let store = open_state(cli, config)?;
    let client = http_client(config)?;
    let mut cache = IndexCache::new(config.index_ttl);
    let repos = load_repos(&config.repos_path())?;
    let universe = build_universe(config, store.as_ref(), &repos, &client, &mut cache)?;

    let needle = pattern.to_ascii_lowercase();
    let mut names: Vec<&String> = universe.by_name.keys().collect();
    names.sort();
    for name in names {
        let Some(&idx) = universe.by_name[name].first() else { continue };
        let meta = &universe.candidates[idx];
        if meta.name.to_ascii_lowercase().contains(&needle)
            || meta.summary.to_ascii_lowercase().contains(&needle)
        {
            let installed = if universe.installed.contains_key(&meta.name) {
                " [installed]"
            } else {
                ""
            };
            println!("{}/{} {}-{}{installed}\n    {}",
                meta.repo, meta.name, meta.version, meta.release, meta.summary);
        }
    }
    Ok(())
}

fn cmd_info(cli: &Cli, config: &Config, package: &str) -> Result<()> {
    let store = open_state(cli, config)?;
    if let Some(record) = store.get_installed(package)? {
        println!("Name      : {}", record.name);
        println!("Version   : {}-{}", record.version, record.release);
        println!("Arch      : {}", record.arch);
        println!("Explicit  : {}", if record.explicit == 1 { "yes" } else { "no" });
        println!("Files     : {}", record.manifest.len());
        println!("Requires  : {}", record.requires.join(", "));
        println!("Provides  : {}", record.provides.join(", "));
        return Ok(());
    }
    let client = http_client(config)?;
    let mut cache = IndexCache::new(config.index_ttl);
    let repos = load_repos(&config.repos_path())?;
    let universe = build_universe(config, store.as_ref(), &repos, &client, &mut cache)?;
    let idx = universe
        .by_name
        .get(package)
        .and_then(|list| list.first().copied())
        .ok_or_else(|| LpmError::InvalidInput(format!("no such package: {package}")))?;
    let meta = &universe.candidates[idx];
    println!("Name      : {}", meta.name);
    println!("Version   : {}-{}", meta.version, meta.release);
    println!("Arch      : {}", meta.arch);
    println!("Repo      : {}", meta.repo);
    println!("Summary   : {}", meta.summary);
    println!("URL       : {}", meta.url);
    println!("License   : {}", meta.license);
    println!("Requires  : {}", meta.requires.join(", "));
    println!("Provides  : {}", meta.provides.join(", "));
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn cmd_buildpkg(
    cli: &Cli,
    config: &Config,
    script: &PathBuf,
    outdir: &PathBuf,
    no_deps: bool,
    force_rebuild: bool,
    overrides: &[String],
) -> Result<()> {
    if !script.exists() {
        return Err(LpmError::InvalidInput(format!(
            ".lpmbuild script not found: {}",
            script.display()
        )));
    }
    let store = open_state(cli, config)?;
    let installed: HashSet<String> = store
        .all_installed()?
        .into_iter()
        .flat_map(|r| r.provides)
        .collect();
    drop(store);

    let opts = BuildOptions {
        build_deps: !no_deps,
        force_rebuild,
        overrides: parse_cpu_overrides(overrides)?,
        sandbox: None,
        recipe_repo: None,
    };
    let output = run_build(config, &installed, script, outdir, &opts)?;

    if config.signing_key.exists() {
        sign::sign_artifact(&output.artifact, &config.signing_key)?;
        for (path, _) in &output.splits {
            sign::sign_artifact(path, &config.signing_key)?;
        }
    }

    println!(
        "built {} ({} phases, {:.1}s)",
        output.artifact.display(),
        output.phases_run,
        output.duration.as_secs_f64()
    );
    for (path, meta) in &output.splits {
        println!("split: {} ({})", path.display(), meta.name);
    }
    Ok(())
}

fn cmd_installpkg(cli: &Cli, config: &Config, file: &PathBuf) -> Result<()> {
    let mut store = open_state(cli, config)?;
    let client = http_client(config)?;
    let mut cache = IndexCache::new(config.index_ttl);
    let repos = load_repos(&config.repos_path())?;
    let universe = build_universe(config, store.as_ref(), &repos, &client, &mut cache)?;

    let (meta, _) = crate::container::read_package_meta(file)?;
    let explicit = HashSet::from([meta.name]);
    let mut resolver = |requires: &[String]| -> Result<Vec<PathBuf>> {
        plan_artifacts(config, &universe, &client, requires)
    };
    let resolver: &mut crate::txn::MetaResolver<'_> = &mut resolver;
    let mut engine = Engine::new(config, store.as_mut());
    engine.install_files(&[file.clone()], &txn_options(cli), &explicit, Some(resolver))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_global_flags_accepted_after_subcommand() {
        let cli = Cli::try_parse_from([
            "lpm", "install", "vim", "--root", "/mnt", "--dry-run", "--no-verify",
        ])
        .expect("parse");
        assert!(cli.dry_run);
        assert!(cli.no_verify);
        assert_eq!(cli.root.as_deref(), Some(std::path::Path::new("/mnt")));
        match cli.command {
            Commands::Install { packages } => assert_eq!(packages, vec!["vim"]),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_buildpkg_flags() {
        let cli = Cli::try_parse_from([
            "lpm",
            "buildpkg",
            "tool.lpmbuild",
            "--no-deps",
            "--force-rebuild",
            "--override",
            "@lto!=on",
        ])
        .expect("parse");
        match cli.command {
            Commands::Buildpkg { no_deps, force_rebuild, overrides, .. } => {
                assert!(no_deps);
                assert!(force_rebuild);
                assert_eq!(overrides, vec!["@lto!=on"]);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_missing_subcommand_is_usage_error() {
        assert!(Cli::try_parse_from(["lpm"]).is_err());
    }
}
