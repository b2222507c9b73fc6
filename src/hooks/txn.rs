//! Hook dispatch around a transaction.
//!
//! The transaction engine registers one [`TransactionEvent`] per package
//! operation, in operation order. At the pre- and post-transaction points
//! the manager matches events against every hook's triggers, orders the
//! triggered hooks by their declared dependencies, and runs each one once
//! per phase.

use crate::error::{LpmError, Result};
use crate::hooks::{Hook, HookOperation, HookWhen, TriggerType};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Reserve subtracted from `ARG_MAX` before spilling targets to a file.
const ARG_MAX_RESERVE: usize = 4096;

/// One package operation inside the current transaction.
#[derive(Clone, Debug)]
pub struct TransactionEvent {
    /// Package name.
    pub name: String,
    /// Operation performed.
    pub operation: HookOperation,
    /// New version, when known.
    pub version: Option<String>,
    /// New release, when known.
    pub release: Option<String>,
    /// Manifest paths touched by the operation (normalized, deduplicated).
    pub paths: Vec<String>,
}

impl TransactionEvent {
    /// Target string used for Package triggers: `name-version-release`.
    #[must_use]
    pub fn package_target(&self) -> String {
        match (&self.version, &self.release) {
            (Some(version), Some(release)) if !release.is_empty() => {
                format!("{}-{version}-{release}", self.name)
            }
            (Some(version), _) => format!("{}-{version}", self.name),
            _ => self.name.clone(),
        }
    }
}

fn normalize_path(path: &str) -> String {
    if path.is_empty() {
        return String::new();
    }
    let mut text = path.replace('\\', "/");
    if !text.starts_with('/') {
        text.insert(0, '/');
    }
    while text.contains("//") {
        text = text.replace("//", "/");
    }
    text
}

fn dedupe_preserve_order(items: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for item in items {
        if seen.insert(item.clone()) {
            out.push(item);
        }
    }
    out
}

/// Collects events and dispatches hooks at the two transaction phases.
#[derive(Debug)]
pub struct HookTransactionManager {
    hooks: BTreeMap<String, Hook>,
    root: PathBuf,
    base_env: Vec<(String, String)>,
    events: Vec<TransactionEvent>,
    pre_ran: bool,
    post_ran: bool,
}

impl HookTransactionManager {
    /// Create a manager over a loaded hook set.
    #[must_use]
    pub fn new(hooks: BTreeMap<String, Hook>, root: &Path, base_env: Vec<(String, String)>) -> Self {
        Self {
            hooks,
            root: root.to_path_buf(),
            base_env,
            events: Vec::new(),
            pre_ran: false,
            post_ran: false,
        }
    }

    /// What: Register one package operation.
    ///
    /// Details:
    /// - Paths are normalized to absolute form and deduplicated while
    ///   preserving manifest order.
    pub fn add_package_event(
        &mut self,
        name: &str,
        operation: HookOperation,
        version: Option<&str>,
        release: Option<&str>,
        paths: &[String],
    ) {
        let cleaned = dedupe_preserve_order(paths.iter().map(|p| normalize_path(p)));
        self.events.push(TransactionEvent {
            name: name.to_string(),
            operation,
            version: version.map(ToString::to_string),
            release: release.map(ToString::to_string),
            paths: cleaned,
        });
    }

    /// Run `PreTransaction` hooks once, no matter how often it is called.
    pub fn ensure_pre_transaction(&mut self) -> Result<()> {
        if !self.pre_ran {
            self.run_when(HookWhen::PreTransaction)?;
            self.pre_ran = true;
        }
        Ok(())
    }

    /// Run `PostTransaction` hooks once.
    pub fn run_post_transaction(&mut self) -> Result<()> {
        if !self.post_ran {
            // Post without pre still counts pre as spent so retries cannot
            // run pre hooks after the transaction body.
            self.pre_ran = true;
            self.run_when(HookWhen::PostTransaction)?;
            self.post_ran = true;
        }
        Ok(())
    }

    fn gather_matches(&self, trigger: &crate::hooks::HookTrigger) -> Vec<String> {
        let patterns: Vec<glob::Pattern> = trigger
            .targets
            .iter()
            .filter_map(|t| glob::Pattern::new(t).ok())
            .collect();
        let mut matches = Vec::new();
        for event in &self.events {
            if !trigger.operations.contains(&event.operation) {
                continue;
            }
            match trigger.trigger_type {
                TriggerType::Package => {
                    if patterns.iter().any(|p| p.matches(&event.name)) {
                        let target = event.package_target();
                        if !matches.contains(&target) {
                            matches.push(target);
                        }
                    }
                }
                TriggerType::Path => {
                    for path in &event.paths {
                        let stripped = path.trim_start_matches('/');
                        if patterns.iter().any(|p| p.matches(path) || p.matches(stripped))
                            && !matches.contains(path)
                        {
                            matches.push(path.clone());
                        }
                    }
                }
            }
        }
        matches
    }

    fn triggered(&self, when: HookWhen) -> Vec<(&Hook, Vec<String>)> {
        let mut out = Vec::new();
        for hook in self.hooks.values() {
            if hook.action.when != when {
                continue;
            }
            let mut targets = Vec::new();
            for trigger in &hook.triggers {
                targets.extend(self.gather_matches(trigger));
            }
            if !targets.is_empty() {
                out.push((hook, dedupe_preserve_order(targets)));
            }
        }
        out
    }

    /// Kahn's algorithm over the `Depends` edges of the triggered set.
    fn order_by_dependencies<'h>(
        triggered: Vec<(&'h Hook, Vec<String>)>,
    ) -> Result<Vec<(&'h Hook, Vec<String>)>> {
        let by_name: HashMap<&str, (&Hook, Vec<String>)> = triggered
            .into_iter()
            .map(|(hook, targets)| (hook.name.as_str(), (hook, targets)))
            .collect();
        let mut pending: BTreeMap<&str, HashSet<&str>> = BTreeMap::new();
        for (&name, (hook, _)) in &by_name {
            let deps: HashSet<&str> = hook
                .action
                .depends
                .iter()
                .map(String::as_str)
                .filter(|d| by_name.contains_key(d))
                .collect();
            pending.insert(name, deps);
        }
        let mut resolved = Vec::new();
        while !pending.is_empty() {
            let ready: Vec<&str> = pending
                .iter()
                .filter(|(_, deps)| deps.is_empty())
                .map(|(&name, _)| name)
                .collect();
            if ready.is_empty() {
                let stuck: Vec<&str> = pending.keys().copied().collect();
                return Err(LpmError::Hook(format!(
                    "Cyclic or unresolved hook dependencies: {}",
                    stuck.join(", ")
                )));
            }
            for name in ready {
                pending.remove(name);
                for deps in pending.values_mut() {
                    deps.remove(name);
                }
                let (hook, targets) = &by_name[name];
                resolved.push((*hook, targets.clone()));
            }
        }
        Ok(resolved)
    }

    fn run_when(&self, when: HookWhen) -> Result<()> {
        let triggered = self.triggered(when);
        if triggered.is_empty() {
            return Ok(());
        }
        for (hook, targets) in Self::order_by_dependencies(triggered)? {
            self.run_hook(hook, &targets)?;
        }
        Ok(())
    }

    fn hook_env(&self, hook: &Hook) -> Vec<(String, String)> {
        let mut env = self.base_env.clone();
        env.push(("LPM_HOOK_NAME".into(), hook.name.clone()));
        env.push(("LPM_HOOK_PATH".into(), hook.path.display().to_string()));
        env.push(("LPM_HOOK_WHEN".into(), hook.action.when.as_str().to_string()));
        env.push(("LPM_ROOT".into(), self.root.display().to_string()));
        env
    }

    fn run_hook(&self, hook: &Hook, targets: &[String]) -> Result<()> {
        let mut env = self.hook_env(hook);
        let mut argv = hook.action.exec.clone();
        let mut spill = false;
        if hook.action.needs_targets {
            env.push(("LPM_TARGET_COUNT".into(), targets.len().to_string()));
            env.push(("LPM_TARGETS".into(), targets.join("\n")));
            argv.extend(targets.iter().cloned());
            if should_spill(&argv, &env) {
                tracing::info!(
                    "hook {} command line would exceed safe argument limits; \
                     using temporary targets file",
                    hook.name
                );
                spill = true;
            }
        }

        let status = if spill {
            let mut file = tempfile::NamedTempFile::new()?;
            for target in targets {
                writeln!(file, "{target}")?;
            }
            file.flush()?;
            env.retain(|(key, _)| key != "LPM_TARGETS");
            env.push(("LPM_TARGETS_FILE".into(), file.path().display().to_string()));
            let base = &hook.action.exec;
            let result = Command::new(&base[0])
                .args(&base[1..])
                .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
                .status();
            // Temp file removal is unconditional (NamedTempFile drop), even
            // when spawning failed.
            drop(file);
            result
        } else {
            Command::new(&argv[0])
                .args(&argv[1..])
                .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
                .status()
        };

        match status {
            Ok(status) if status.success() => Ok(()),
            Ok(status) => {
                tracing::error!("hook {} failed: {status}", hook.name);
                if hook.action.abort_on_fail {
                    Err(LpmError::Hook(format!("hook {} failed: {status}", hook.name)))
                } else {
                    Ok(())
                }
            }
            Err(err) => {
                tracing::error!("hook {} could not run: {err}", hook.name);
                if hook.action.abort_on_fail {
                    Err(LpmError::Hook(format!("hook {} could not run: {err}", hook.name)))
                } else {
                    Ok(())
                }
            }
        }
    }
}

fn arg_max() -> usize {
    // SAFETY: sysconf is a read-only query.
    let value = unsafe { libc::sysconf(libc::_SC_ARG_MAX) };
    if value > 0 { value as usize } else { 0 }
}

fn estimate_command_size(argv: &[String], env: &[(String, String)]) -> usize {
    let argv_size: usize = argv.iter().map(|a| a.len() + 1).sum();
    let env_size: usize = env.iter().map(|(k, v)| k.len() + v.len() + 2).sum();
    // The parent environment is inherited too.
    let inherited: usize = std::env::vars_os()
        .map(|(k, v)| k.len() + v.len() + 2)
        .sum();
    argv_size + env_size + inherited
}

fn should_spill(argv: &[String], env: &[(String, String)]) -> bool {
    let limit = arg_max();
    if limit == 0 {
        return false;
    }
    let threshold = (limit.saturating_sub(ARG_MAX_RESERVE)).max(limit * 8 / 10);
    estimate_command_size(argv, env) >= threshold
}
