//! The atomic install/remove/upgrade transaction engine.
//!
//! One transaction = lock, snapshot, verify, stage, merge, script, DB row,
//! hooks, commit. Any failure before commit restores the snapshot, rolls
//! the store back, appends a rollback history row, and re-raises the
//! original error, so the installed table, filesystem, and history always
//! advance or revert together.

pub mod snapshot;

use crate::config::{Config, ConflictDefault, PKG_SUFFIX, arch_compatible};
use crate::container::{extract_package, read_package_meta, sha256_bytes, sha256_file, sign};
use crate::error::{LpmError, Result};
use crate::fsio::{TransactionLock, atomic_symlink, safe_copy};
use crate::hooks::{HookOperation, HookTransactionManager, load_hooks};
use crate::state::StateStore;
use crate::types::{HistoryEntry, InstalledRecord, ManifestEntry, PkgMeta};
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Current unix timestamp in seconds.
#[must_use]
pub fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_secs() as i64)
}

/// Answer to a file-conflict prompt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConflictChoice {
    /// Replace this destination.
    Replace,
    /// Replace this and every later conflict in the transaction.
    ReplaceAll,
    /// Keep the destination, skip the entry.
    Skip,
    /// Abort and roll back.
    Abort,
}

/// Options shared by all transaction entry points.
#[derive(Clone, Copy, Debug)]
pub struct TxnOptions {
    /// Plan and validate only; no lock, no mutation.
    pub dry_run: bool,
    /// Verify detached signatures before touching a package.
    pub verify: bool,
    /// Override protected-package refusal.
    pub force: bool,
    /// Non-interactive conflict answer (tests, `--force` front-ends).
    pub assume_conflict: Option<ConflictChoice>,
}

impl Default for TxnOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            verify: true,
            force: false,
            assume_conflict: None,
        }
    }
}

/// Resolver callback used for meta-packages: maps goal expressions to local
/// artifact files ready to install.
pub type MetaResolver<'r> = dyn FnMut(&[String]) -> Result<Vec<PathBuf>> + 'r;

/// Defers SIGINT/SIGTERM while a transaction mutates the filesystem; the
/// previous mask is restored (and pending signals delivered) on drop.
struct SignalGuard {
    previous: libc::sigset_t,
}

impl SignalGuard {
    fn defer() -> Self {
        // SAFETY: sigprocmask only manipulates this process's signal mask.
        unsafe {
            let mut block: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut block);
            libc::sigaddset(&mut block, libc::SIGINT);
            libc::sigaddset(&mut block, libc::SIGTERM);
            let mut previous: libc::sigset_t = std::mem::zeroed();
            libc::sigprocmask(libc::SIG_BLOCK, &block, &mut previous);
            Self { previous }
        }
    }
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        // SAFETY: restores the mask captured in `defer`.
        unsafe {
            libc::sigprocmask(libc::SIG_SETMASK, &self.previous, std::ptr::null_mut());
        }
    }
}

/// The transaction engine. Single-threaded by design; the global lock
/// serialises engines across processes.
pub struct Engine<'a> {
    config: &'a Config,
    store: &'a mut dyn StateStore,
}

struct PreparedPackage {
    file: PathBuf,
    meta: PkgMeta,
    manifest: Vec<ManifestEntry>,
    previous: Option<InstalledRecord>,
}

impl<'a> Engine<'a> {
    /// Create an engine over the given configuration and state store.
    pub fn new(config: &'a Config, store: &'a mut dyn StateStore) -> Self {
        Self { config, store }
    }

    fn ensure_privileges(&self, action: &str, opts: &TxnOptions) -> Result<()> {
        if opts.dry_run || !self.config.is_default_root() {
            return Ok(());
        }
        // SAFETY: geteuid is a read-only query.
        if unsafe { libc::geteuid() } != 0 {
            return Err(LpmError::RootPrivilegesRequired(action.to_string()));
        }
        Ok(())
    }

    fn hook_manager(&self) -> HookTransactionManager {
        HookTransactionManager::new(
            load_hooks(&self.config.hook_dirs),
            &self.config.root,
            vec![("LPM_ROOT".into(), self.config.root.display().to_string())],
        )
    }

    /// What: Install local package artifacts.
    ///
    /// Inputs:
    /// - `files`: `.zst` artifacts to install, in plan order.
    /// - `opts`: Transaction options.
    /// - `explicit`: Names to mark `explicit = 1`; everything else installs
    ///   as dependency-only (an upgrade keeps the previous flag either way).
    /// - `meta_resolver`: Resolves a meta-package's requires to artifact
    ///   files; `None` makes meta-packages an error.
    ///
    /// Output:
    /// - Metadata of every package actually installed.
    pub fn install_files(
        &mut self,
        files: &[PathBuf],
        opts: &TxnOptions,
        explicit: &HashSet<String>,
        mut meta_resolver: Option<&mut MetaResolver<'_>>,
    ) -> Result<Vec<PkgMeta>> {
        self.ensure_privileges("install packages", opts)?;

        let mut prepared = Vec::new();
        let mut installed_meta = Vec::new();
        for file in files {
            match self.prepare_package(file, opts)? {
                Prepared::Package(pkg) => prepared.push(pkg),
                Prepared::Skipped(meta) => installed_meta.push(meta),
                Prepared::MetaPackage(meta) => {
                    tracing::info!(
                        "[meta] {} is a meta-package, resolving deps: {}",
                        meta.name,
                        meta.requires.join(", ")
                    );
                    let Some(resolver) = meta_resolver.as_mut() else {
                        return Err(LpmError::InvalidPackage(format!(
                            "{} is a meta-package but no resolver is available",
                            meta.name
                        )));
                    };
                    let dep_files = (*resolver)(&meta.requires)
                        .map_err(|err| match err {
                            LpmError::NoProvider { atom, .. } => LpmError::NoProvider {
                                atom,
                                context: meta.full_id(),
                            },
                            other => other,
                        })?;
                    let mut installed =
                        self.install_files(&dep_files, opts, &HashSet::new(), None)?;
                    installed_meta.append(&mut installed);
                    installed_meta.push(meta);
                }
            }
        }

        if prepared.is_empty() {
            return Ok(installed_meta);
        }

        if opts.dry_run {
            for pkg in &prepared {
                tracing::info!("[dry-run] would install {}", pkg.meta.full_id());
                for entry in &pkg.manifest {
                    println!(" -> {} ({} bytes)", entry.path, entry.size);
                }
            }
            installed_meta.extend(prepared.into_iter().map(|p| p.meta));
            return Ok(installed_meta);
        }

        let _lock = TransactionLock::acquire(&self.config.lock_path())?;
        let _signals = SignalGuard::defer();

        let mut hooks = self.hook_manager();
        let mut all_paths = Vec::new();
        for pkg in &prepared {
            let paths: Vec<String> = pkg.manifest.iter().map(|e| e.path.clone()).collect();
            let operation = if pkg.previous.is_some() {
                HookOperation::Upgrade
            } else {
                HookOperation::Install
            };
            hooks.add_package_event(
                &pkg.meta.name,
                operation,
                Some(&pkg.meta.version),
                Some(&pkg.meta.release),
                &paths,
            );
            all_paths.extend(paths);
        }

        let tag = format!(
            "install {}",
            prepared
                .iter()
                .map(|p| p.meta.name.as_str())
                .collect::<Vec<_>>()
                .join(" ")
        );
        let archive = snapshot::create_snapshot(self.config, &tag, &all_paths)?;
        self.store
            .add_snapshot(unix_now(), &tag, &archive.display().to_string())?;

        // Snapshot precedes pre-transaction hooks so rollback covers
        // hook-induced mutations.
        if let Err(err) = hooks.ensure_pre_transaction() {
            return Err(self.rollback(&archive, err));
        }
        self.store.begin()?;
        if let Err(err) = self.install_body(&prepared, opts, explicit) {
            return Err(self.rollback(&archive, err));
        }
        if let Err(err) = hooks.run_post_transaction() {
            return Err(self.rollback(&archive, err));
        }
        self.store.commit()?;

        for pkg in &prepared {
            self.handle_service_files(&pkg.meta.name, &pkg.manifest);
            tracing::info!("installed {}", pkg.meta.full_id());
        }
        installed_meta.extend(prepared.into_iter().map(|p| p.meta));
        Ok(installed_meta)
    }

    fn install_body(
        &mut self,
        prepared: &[PreparedPackage],
        opts: &TxnOptions,
        explicit: &HashSet<String>,
    ) -> Result<()> {
        let mut replace_all = false;
        for pkg in prepared {
            let is_explicit = explicit.contains(&pkg.meta.name)
                || pkg.previous.as_ref().is_some_and(|p| p.explicit == 1);
            self.install_single(pkg, opts, is_explicit, &mut replace_all)?;
        }
        Ok(())
    }

    /// Roll the store and filesystem back, record the rollback, and return
    /// the original error.
    fn rollback(&mut self, archive: &Path, err: LpmError) -> LpmError {
        tracing::error!("transaction failed, rolling back: {err}");
        if let Err(db_err) = self.store.rollback() {
            tracing::error!("store rollback failed: {db_err}");
        }
        if let Err(fs_err) = snapshot::restore_snapshot(self.config, archive, false) {
            tracing::error!("snapshot restore failed: {fs_err}");
        }
        let entry = HistoryEntry {
            ts: unix_now(),
            action: "rollback".into(),
            name: archive.display().to_string(),
            details: err.to_string(),
            ..HistoryEntry::default()
        };
        if let Err(db_err) = self.store.append_history(&entry) {
            tracing::error!("recording rollback failed: {db_err}");
        }
        err
    }

    fn prepare_package(&mut self, file: &Path, opts: &TxnOptions) -> Result<Prepared> {
        let name = file.display().to_string();
        if !name.ends_with(PKG_SUFFIX) {
            return Err(LpmError::InvalidPackage(format!("{name} is not a {PKG_SUFFIX} package")));
        }
        if opts.verify {
            sign::verify_signature(file, &sign::signature_path(file), &self.config.verify_key)?;
        }
        let (meta, manifest) = read_package_meta(file)?;
        tracing::info!("valid package: {}", meta.full_id());

        if !arch_compatible(&meta.arch, &self.config.arch) {
            return Err(LpmError::InvalidPackage(format!(
                "incompatible architecture: {} (host: {})",
                meta.arch, self.config.arch
            )));
        }
        if self.config.protected.contains(&meta.name) && !opts.force {
            tracing::warn!(
                "{} is protected and cannot be installed/upgraded without --force",
                meta.name
            );
            return Ok(Prepared::Skipped(meta));
        }
        let is_meta_package = manifest.is_empty()
            || manifest.iter().all(|e| e.path.starts_with("/.lpm"));
        if is_meta_package && !meta.requires.is_empty() {
            return Ok(Prepared::MetaPackage(meta));
        }
        let previous = self.store.get_installed(&meta.name)?;
        Ok(Prepared::Package(PreparedPackage {
            file: file.to_path_buf(),
            meta,
            manifest,
            previous,
        }))
    }

    fn install_single(
        &mut self,
        pkg: &PreparedPackage,
        opts: &TxnOptions,
        explicit: bool,
        replace_all: &mut bool,
    ) -> Result<()> {
        let root = &self.config.root;
        std::fs::create_dir_all(root)?;
        let stage = tempfile::Builder::new()
            .prefix(".lpm-stage-")
            .tempdir_in(root)?;
        extract_package(&pkg.file, stage.path())?;

        for entry in &pkg.manifest {
            validate_entry(stage.path(), entry)?;
        }

        let mut manifest = pkg.manifest.clone();
        self.merge_into_root(stage.path(), &manifest, opts, replace_all)?;
        self.run_install_script(pkg, stage.path())?;

        // The embedded script leaves the manifest unless it asked to stay.
        let script_entry = manifest.iter().find(|e| e.path == INSTALL_SCRIPT).cloned();
        if let Some(entry) = script_entry
            && !entry.keep
        {
            let installed = root.join(INSTALL_SCRIPT.trim_start_matches('/'));
            match std::fs::remove_file(&installed) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
            manifest.retain(|e| e.path != INSTALL_SCRIPT);
        }

        let record = InstalledRecord {
            name: pkg.meta.name.clone(),
            version: pkg.meta.version.clone(),
            release: pkg.meta.release.clone(),
            arch: pkg.meta.arch.clone(),
            provides: pkg.meta.provide_tokens(),
            symbols: Vec::new(),
            requires: pkg.meta.requires.clone(),
            manifest,
            explicit: i64::from(explicit),
            install_time: unix_now(),
        };
        self.store.upsert_installed(&record)?;
        let action = if pkg.previous.is_some() { "upgrade" } else { "install" };
        self.store.append_history(&HistoryEntry {
            ts: unix_now(),
            action: action.into(),
            name: pkg.meta.name.clone(),
            from_ver: pkg.previous.as_ref().map(|p| p.version.clone()),
            to_ver: Some(pkg.meta.version.clone()),
            details: serde_json::to_string(&pkg.meta)?,
            ..HistoryEntry::default()
        })?;
        Ok(())
    }

    fn merge_into_root(
        &self,
        stage: &Path,
        manifest: &[ManifestEntry],
        opts: &TxnOptions,
        replace_all: &mut bool,
    ) -> Result<()> {
        let root = &self.config.root;
        for entry in manifest {
            let rel = entry.path.trim_start_matches('/');
            let src = stage.join(rel);
            let dest = root.join(rel);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            if src.is_dir() {
                std::fs::create_dir_all(&dest)?;
                continue;
            }

            let dest_exists = dest.symlink_metadata().is_ok();
            if dest_exists {
                let same = dest.is_file()
                    && !entry.is_symlink()
                    && sha256_file(&dest).is_ok_and(|sum| sum == entry.sha256);
                let same_link = entry.is_symlink()
                    && std::fs::read_link(&dest)
                        .is_ok_and(|t| Some(t.to_string_lossy().into_owned()) == entry.link);
                if same || same_link {
                    tracing::debug!("[skip] {rel} already up-to-date");
                    continue;
                }
                let choice = if *replace_all {
                    ConflictChoice::Replace
                } else {
                    self.prompt_conflict(rel, opts)
                };
                match choice {
                    ConflictChoice::Abort => {
                        return Err(LpmError::ConflictAbort(rel.to_string()));
                    }
                    ConflictChoice::Skip => {
                        tracing::info!("[skip] {rel}");
                        continue;
                    }
                    ConflictChoice::ReplaceAll => {
                        *replace_all = true;
                        remove_dest(&dest)?;
                    }
                    ConflictChoice::Replace => remove_dest(&dest)?,
                }
            }

            if src.symlink_metadata().is_err() {
                continue;
            }
            if src.symlink_metadata()?.file_type().is_symlink() {
                let target = std::fs::read_link(&src)?;
                atomic_symlink(&target, &dest)?;
            } else {
                use std::os::unix::fs::PermissionsExt;
                let src_mode = src.metadata()?.permissions().mode();
                let mode = if src_mode & 0o111 != 0 { 0o755 } else { 0o644 };
                safe_copy(&src, &dest, Some(mode))?;
            }
        }
        Ok(())
    }

    fn prompt_conflict(&self, rel: &str, opts: &TxnOptions) -> ConflictChoice {
        if let Some(choice) = opts.assume_conflict {
            return choice;
        }
        // SAFETY: isatty is a read-only query.
        let interactive = unsafe { libc::isatty(0) } == 1;
        if !interactive {
            return match self.config.conflict_default {
                ConflictDefault::Replace => ConflictChoice::Replace,
                ConflictDefault::Skip => ConflictChoice::Skip,
                ConflictDefault::Abort => ConflictChoice::Abort,
            };
        }
        let stdin = std::io::stdin();
        loop {
            eprint!("[conflict] {rel} exists. [R]eplace / [RA] Replace All / [S]kip / [A]bort? ");
            let mut line = String::new();
            if stdin.lock().read_line(&mut line).is_err() {
                return ConflictChoice::Abort;
            }
            match line.trim().to_ascii_lowercase().as_str() {
                "r" | "replace" => return ConflictChoice::Replace,
                "ra" | "all" | "replace all" => return ConflictChoice::ReplaceAll,
                "s" | "skip" => return ConflictChoice::Skip,
                "a" | "abort" => return ConflictChoice::Abort,
                _ => eprintln!("Please enter R, RA, S, or A."),
            }
        }
    }

    fn run_install_script(&self, pkg: &PreparedPackage, stage: &Path) -> Result<()> {
        let rel = INSTALL_SCRIPT.trim_start_matches('/');
        let installed = self.config.root.join(rel);
        let staged = stage.join(rel);
        let script = if installed.exists() {
            installed
        } else if staged.exists() {
            staged
        } else {
            return Ok(());
        };
        let executable = {
            use std::os::unix::fs::PermissionsExt;
            script
                .metadata()
                .map(|m| m.permissions().mode() & 0o111 != 0)
                .unwrap_or(false)
        };
        if !executable {
            return Ok(());
        }

        let action = if pkg.previous.is_some() { "upgrade" } else { "install" };
        let new_full = format_full(&pkg.meta.version, &pkg.meta.release);
        let old_full = pkg
            .previous
            .as_ref()
            .map(|p| format_full(&p.version, &p.release));

        let mut command = Command::new(&script);
        command
            .arg(action)
            .arg(&new_full)
            .current_dir(&self.config.root)
            .env("LPM_ROOT", self.config.root.as_os_str())
            .env("LPM_PKG", &pkg.meta.name)
            .env("LPM_VERSION", &pkg.meta.version)
            .env("LPM_RELEASE", &pkg.meta.release)
            .env("LPM_INSTALL_ACTION", action);
        if let (Some(previous), Some(old_full)) = (&pkg.previous, &old_full) {
            command
                .arg(old_full)
                .env("LPM_PREVIOUS_VERSION", &previous.version)
                .env("LPM_PREVIOUS_RELEASE", &previous.release);
        }
        tracing::info!("running embedded install script for {}", pkg.meta.name);
        // The script's exit status is advisory, matching repository practice
        // for maintainer scripts.
        match command.status() {
            Ok(status) if !status.success() => {
                tracing::warn!("install script for {} exited {status}", pkg.meta.name);
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!("install script for {} failed to run: {err}", pkg.meta.name);
            }
        }
        Ok(())
    }

    /// Systemd unit refresh for the default root; a no-op everywhere else.
    fn handle_service_files(&self, name: &str, manifest: &[ManifestEntry]) {
        if !self.config.is_default_root() {
            return;
        }
        let has_units = manifest.iter().any(|e| {
            e.path.ends_with(".service")
                && (e.path.starts_with("/usr/lib/systemd/") || e.path.starts_with("/etc/systemd/"))
        });
        if !has_units {
            return;
        }
        let Ok(systemctl) = which::which("systemctl") else { return };
        tracing::info!("{name} ships systemd units, reloading the daemon");
        if let Err(err) = Command::new(systemctl).arg("daemon-reload").status() {
            tracing::warn!("systemctl daemon-reload failed: {err}");
        }
    }

    /// What: Remove installed packages.
    ///
    /// Details:
    /// - Missing names warn and are skipped; protected names refuse without
    ///   `force`. Files are unlinked in manifest order, then directories
    ///   emptied by the removal are pruned unless another package's
    ///   manifest still claims a file below them.
    pub fn remove(&mut self, names: &[String], opts: &TxnOptions) -> Result<Vec<String>> {
        self.ensure_privileges("remove packages", opts)?;

        let mut targets: Vec<InstalledRecord> = Vec::new();
        for name in names {
            if self.config.protected.contains(name) && !opts.force {
                tracing::warn!("{name} is protected and cannot be removed without --force");
                continue;
            }
            match self.store.get_installed(name)? {
                Some(record) => targets.push(record),
                None => tracing::warn!("{name} not installed"),
            }
        }
        if targets.is_empty() {
            return Ok(Vec::new());
        }
        if opts.dry_run {
            for record in &targets {
                tracing::info!("[dry-run] would remove {}-{}", record.name, record.version);
            }
            return Ok(targets.into_iter().map(|r| r.name).collect());
        }

        let _lock = TransactionLock::acquire(&self.config.lock_path())?;
        let _signals = SignalGuard::defer();

        let mut hooks = self.hook_manager();
        let mut all_paths = Vec::new();
        for record in &targets {
            let paths: Vec<String> = record.manifest.iter().map(|e| e.path.clone()).collect();
            hooks.add_package_event(
                &record.name,
                HookOperation::Remove,
                Some(&record.version),
                Some(&record.release),
                &paths,
            );
            all_paths.extend(paths);
        }

        let tag = format!(
            "remove {}",
            targets.iter().map(|r| r.name.as_str()).collect::<Vec<_>>().join(" ")
        );
        let archive = snapshot::create_snapshot(self.config, &tag, &all_paths)?;
        self.store
            .add_snapshot(unix_now(), &tag, &archive.display().to_string())?;

        let kept_paths: HashSet<String> = {
            let removing: HashSet<&str> = targets.iter().map(|r| r.name.as_str()).collect();
            self.store
                .all_installed()?
                .iter()
                .filter(|r| !removing.contains(r.name.as_str()))
                .flat_map(|r| r.manifest.iter().map(|e| e.path.clone()))
                .collect()
        };

        if let Err(err) = hooks.ensure_pre_transaction() {
            return Err(self.rollback(&archive, err));
        }
        self.store.begin()?;
        let mut body = || -> Result<()> {
            for record in &targets {
                self.remove_single(record, &kept_paths)?;
            }
            Ok(())
        };
        if let Err(err) = body() {
            return Err(self.rollback(&archive, err));
        }
        if let Err(err) = hooks.run_post_transaction() {
            return Err(self.rollback(&archive, err));
        }
        self.store.commit()?;

        for record in &targets {
            tracing::info!("removed {}-{}", record.name, record.version);
        }
        Ok(targets.into_iter().map(|r| r.name).collect())
    }

    fn remove_single(&mut self, record: &InstalledRecord, kept: &HashSet<String>) -> Result<()> {
        let root = &self.config.root;
        let mut dirs: Vec<PathBuf> = Vec::new();
        for entry in &record.manifest {
            let rel = entry.path.trim_start_matches('/');
            let on_disk = root.join(rel);
            match std::fs::remove_file(&on_disk) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
            if let Some(parent) = on_disk.parent()
                && !dirs.contains(&parent.to_path_buf())
            {
                dirs.push(parent.to_path_buf());
            }
        }
        // Prune emptied directories bottom-up, never past the root and
        // never below a path another manifest still claims.
        dirs.sort_by_key(|d| std::cmp::Reverse(d.components().count()));
        for dir in dirs {
            let mut cursor = dir;
            while cursor.starts_with(root) && cursor != *root {
                let rel = cursor
                    .strip_prefix(root)
                    .map(|r| format!("/{}", r.display()))
                    .unwrap_or_default();
                let claimed = kept.iter().any(|p| p.starts_with(&format!("{rel}/")));
                if claimed || std::fs::remove_dir(&cursor).is_err() {
                    break;
                }
                match cursor.parent() {
                    Some(parent) => cursor = parent.to_path_buf(),
                    None => break,
                }
            }
        }

        self.store.remove_installed(&record.name)?;
        self.store.append_history(&HistoryEntry {
            ts: unix_now(),
            action: "remove".into(),
            name: record.name.clone(),
            from_ver: Some(record.version.clone()),
            to_ver: None,
            ..HistoryEntry::default()
        })?;
        Ok(())
    }

    /// What: Remove dependency-only packages no explicit package needs.
    ///
    /// Output:
    /// - Names removed (empty when the system is already tidy).
    ///
    /// Details:
    /// - Reachability runs over requires edges resolved through provide
    ///   tokens (versioned provides included); anything reachable from an
    ///   `explicit = 1` row survives.
    pub fn autoremove(&mut self, opts: &TxnOptions) -> Result<Vec<String>> {
        let rows = self.store.all_installed()?;
        let mut providers: HashMap<String, Vec<String>> = HashMap::new();
        for row in &rows {
            for token in &row.provides {
                providers.entry(token.clone()).or_default().push(row.name.clone());
            }
            providers.entry(row.name.clone()).or_default().push(row.name.clone());
        }

        let requires_of: HashMap<&str, &Vec<String>> =
            rows.iter().map(|r| (r.name.as_str(), &r.requires)).collect();
        let mut reachable: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<String> = rows
            .iter()
            .filter(|r| r.explicit == 1)
            .map(|r| r.name.clone())
            .collect();
        for name in &queue {
            reachable.insert(name.clone());
        }
        while let Some(name) = queue.pop_front() {
            let Some(requires) = requires_of.get(name.as_str()) else { continue };
            for expr_text in requires.iter() {
                let Ok(expr) = crate::deps::parse_dep_expr(expr_text) else {
                    continue;
                };
                for conjunct in expr.conjuncts() {
                    for atom in conjunct.or_atoms() {
                        for provider in
                            providers.get(&atom.name).map_or(&[][..], Vec::as_slice)
                        {
                            if reachable.insert(provider.clone()) {
                                queue.push_back(provider.clone());
                            }
                        }
                    }
                }
            }
        }

        let removable: Vec<String> = rows
            .iter()
            .filter(|r| r.explicit == 0 && !reachable.contains(&r.name))
            .map(|r| r.name.clone())
            .collect();
        if removable.is_empty() {
            tracing::info!("nothing to autoremove");
            return Ok(Vec::new());
        }
        tracing::info!("autoremoving: {}", removable.join(", "));
        self.remove(&removable, opts)
    }
}

enum Prepared {
    Package(PreparedPackage),
    MetaPackage(PkgMeta),
    Skipped(PkgMeta),
}

/// Path of the embedded install script inside every artifact.
pub const INSTALL_SCRIPT: &str = "/.lpm-install.sh";

fn format_full(version: &str, release: &str) -> String {
    if release.is_empty() {
        version.to_string()
    } else {
        format!("{version}-{release}")
    }
}

fn remove_dest(dest: &Path) -> Result<()> {
    let metadata = dest.symlink_metadata()?;
    if metadata.file_type().is_dir() {
        std::fs::remove_dir_all(dest)?;
    } else {
        std::fs::remove_file(dest)?;
    }
    Ok(())
}

/// Validate one staged manifest entry against its recorded digest.
///
/// Symlinks accept, in order: the digest of the payload the link resolves
/// to inside the stage, the digest of the link-target string, or the
/// payload digest for absolute targets (resolved within the stage).
fn validate_entry(stage: &Path, entry: &ManifestEntry) -> Result<()> {
    let rel = entry.path.trim_start_matches('/');
    let staged = stage.join(rel);
    let staged_meta = staged.symlink_metadata();
    if staged_meta.is_err() {
        return Err(LpmError::InvalidPackage(format!("manifest missing file: {}", entry.path)));
    }
    let expected = (!entry.sha256.is_empty()).then_some(entry.sha256.as_str());

    let is_symlink = staged_meta.is_ok_and(|m| m.file_type().is_symlink());
    let actual = if is_symlink || entry.is_symlink() {
        let target = std::fs::read_link(&staged).map_err(|_| {
            LpmError::InvalidPackage(format!("manifest missing file: {}", entry.path))
        })?;
        let target_text = target.to_string_lossy().into_owned();
        if let Some(expected_target) = &entry.link
            && &target_text != expected_target
        {
            return Err(LpmError::InvalidPackage(format!(
                "link mismatch for {}: expected {expected_target}, got {target_text}",
                entry.path
            )));
        }
        let link_hash = sha256_bytes(target_text.as_bytes());
        let payload_candidate = if target.is_absolute() {
            stage.join(target_text.trim_start_matches('/'))
        } else {
            staged.parent().map_or_else(|| stage.to_path_buf(), Path::to_path_buf).join(&target)
        };
        let stage_real = stage.canonicalize().unwrap_or_else(|_| stage.to_path_buf());
        let resolved = payload_candidate
            .canonicalize()
            .ok()
            .filter(|p| p.starts_with(&stage_real) && p.is_file());
        let payload_sum = match resolved {
            Some(path) => Some(sha256_file(&path)?),
            None => None,
        };

        match (&payload_sum, expected) {
            (Some(sum), Some(want)) if sum == want => {
                if *sum != link_hash {
                    tracing::warn!(
                        "symlink {} matched via payload digest rather than link digest",
                        entry.path
                    );
                }
                sum.clone()
            }
            (Some(sum), None) => sum.clone(),
            (_, Some(want)) if link_hash == want => link_hash,
            (Some(sum), _) => sum.clone(),
            _ => link_hash,
        }
    } else {
        sha256_file(&staged)?
    };

    if let Some(expected) = expected
        && actual != expected
    {
        return Err(LpmError::HashMismatch {
            path: entry.path.clone(),
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::sha256_bytes;

    #[test]
    fn test_format_full() {
        assert_eq!(format_full("1.0", "1"), "1.0-1");
        assert_eq!(format_full("1.0", ""), "1.0");
    }

    #[test]
    fn test_validate_entry_file_hash() {
        let stage = tempfile::tempdir().expect("stage");
        std::fs::write(stage.path().join("file"), b"content").expect("write");
        let good = ManifestEntry {
            path: "/file".into(),
            size: 7,
            sha256: sha256_bytes(b"content"),
            ..ManifestEntry::default()
        };
        validate_entry(stage.path(), &good).expect("valid");

        let bad = ManifestEntry { sha256: sha256_bytes(b"other"), ..good };
        assert!(matches!(
            validate_entry(stage.path(), &bad),
            Err(LpmError::HashMismatch { .. })
        ));
    }

    #[test]
    fn test_validate_entry_symlink_accepts_link_digest() {
        let stage = tempfile::tempdir().expect("stage");
        std::os::unix::fs::symlink("payload", stage.path().join("link")).expect("symlink");
        let entry = ManifestEntry {
            path: "/link".into(),
            sha256: sha256_bytes(b"payload"),
            link: Some("payload".into()),
            ..ManifestEntry::default()
        };
        validate_entry(stage.path(), &entry).expect("link digest accepted");
    }

    #[test]
    fn test_validate_entry_symlink_accepts_payload_digest() {
        let stage = tempfile::tempdir().expect("stage");
        std::fs::write(stage.path().join("real"), b"payload bytes").expect("write");
        std::os::unix::fs::symlink("real", stage.path().join("link")).expect("symlink");
        let entry = ManifestEntry {
            path: "/link".into(),
            sha256: sha256_bytes(b"payload bytes"),
            link: Some("real".into()),
            ..ManifestEntry::default()
        };
        validate_entry(stage.path(), &entry).expect("payload digest accepted");
    }

    #[test]
    fn test_validate_entry_symlink_target_mismatch() {
        let stage = tempfile::tempdir().expect("stage");
        std::os::unix::fs::symlink("actual", stage.path().join("link")).expect("symlink");
        let entry = ManifestEntry {
            path: "/link".into(),
            sha256: sha256_bytes(b"declared"),
            link: Some("declared".into()),
            ..ManifestEntry::default()
        };
        let err = validate_entry(stage.path(), &entry).expect_err("mismatch");
        assert!(err.to_string().contains("link mismatch"));
    }

    #[test]
    fn test_validate_entry_missing_file() {
        let stage = tempfile::tempdir().expect("stage");
        let entry = ManifestEntry { path: "/absent".into(), ..ManifestEntry::default() };
        let err = validate_entry(stage.path(), &entry).expect_err("missing");
        assert!(err.to_string().contains("manifest missing file"));
    }
}
