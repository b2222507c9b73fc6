//! Declarative transaction hooks.
//!
//! Hook descriptors are INI-like `*.hook` files with one or more
//! `[Trigger]` blocks and a single `[Action]` block:
//!
//! ```text
//! [Trigger]
//! Type = Path
//! Operation = Install
//! Operation = Upgrade
//! Target = usr/share/applications/*.desktop
//!
//! [Action]
//! When = PostTransaction
//! Exec = /usr/bin/update-desktop-database
//! NeedsTargets
//! ```
//!
//! Invalid descriptors are skipped with a warning; a directory of hooks
//! never takes the package manager down.

pub mod txn;

use crate::error::{LpmError, Result};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

pub use txn::{HookTransactionManager, TransactionEvent};

/// What a trigger matches against.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriggerType {
    /// Match event paths.
    Path,
    /// Match package names.
    Package,
}

/// Package operation a trigger fires on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HookOperation {
    /// First-time install.
    Install,
    /// Replacing an older version.
    Upgrade,
    /// Removal.
    Remove,
}

impl HookOperation {
    fn parse(text: &str) -> Option<Self> {
        match text.trim().to_ascii_lowercase().as_str() {
            "install" => Some(Self::Install),
            "upgrade" => Some(Self::Upgrade),
            "remove" => Some(Self::Remove),
            _ => None,
        }
    }
}

/// Transaction phase an action runs in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookWhen {
    /// Before the first filesystem mutation.
    PreTransaction,
    /// After the last package operation.
    PostTransaction,
}

impl HookWhen {
    fn parse(text: &str) -> Option<Self> {
        match text.trim().to_ascii_lowercase().as_str() {
            "pretransaction" => Some(Self::PreTransaction),
            "posttransaction" => Some(Self::PostTransaction),
            _ => None,
        }
    }

    /// Environment spelling (`LPM_HOOK_WHEN`).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PreTransaction => "PreTransaction",
            Self::PostTransaction => "PostTransaction",
        }
    }
}

/// One `[Trigger]` block.
#[derive(Clone, Debug)]
pub struct HookTrigger {
    /// Path or Package matching.
    pub trigger_type: TriggerType,
    /// Operations this trigger fires on.
    pub operations: HashSet<HookOperation>,
    /// Glob patterns matched per [`TriggerType`].
    pub targets: Vec<String>,
}

/// The `[Action]` block.
#[derive(Clone, Debug)]
pub struct HookAction {
    /// Phase the command runs in.
    pub when: HookWhen,
    /// Command line (already shell-split).
    pub exec: Vec<String>,
    /// Pass matched targets on argv / environment.
    pub needs_targets: bool,
    /// Names of hooks that must run first.
    pub depends: Vec<String>,
    /// Abort the transaction on non-zero exit.
    pub abort_on_fail: bool,
}

/// One parsed hook descriptor.
#[derive(Clone, Debug)]
pub struct Hook {
    /// File stem, used for `Depends` references.
    pub name: String,
    /// Descriptor path.
    pub path: PathBuf,
    /// All trigger blocks.
    pub triggers: Vec<HookTrigger>,
    /// The action block.
    pub action: HookAction,
}

fn truthy(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

struct PendingTrigger {
    trigger_type: Option<TriggerType>,
    operations: HashSet<HookOperation>,
    targets: Vec<String>,
}

impl PendingTrigger {
    fn new() -> Self {
        Self { trigger_type: None, operations: HashSet::new(), targets: Vec::new() }
    }

    fn finalize(self, path: &Path) -> Result<HookTrigger> {
        let trigger_type = self
            .trigger_type
            .ok_or_else(|| LpmError::Hook(format!("{}: Trigger missing Type", path.display())))?;
        if self.operations.is_empty() {
            return Err(LpmError::Hook(format!(
                "{}: Trigger missing Operation",
                path.display()
            )));
        }
        if self.targets.is_empty() {
            return Err(LpmError::Hook(format!("{}: Trigger missing Target", path.display())));
        }
        Ok(HookTrigger {
            trigger_type,
            operations: self.operations,
            targets: self.targets,
        })
    }
}

/// What: Parse one hook descriptor file.
///
/// # Errors
///
/// `LpmError::Hook` naming the file and the offending key for any schema
/// violation (unknown section, missing Type/Operation/Target, missing or
/// repeated Exec, invalid When).
pub fn parse_hook(path: &Path) -> Result<Hook> {
    #[derive(PartialEq)]
    enum Section {
        None,
        Trigger,
        Action,
    }

    let text = std::fs::read_to_string(path)?;
    let mut section = Section::None;
    let mut triggers: Vec<HookTrigger> = Vec::new();
    let mut pending: Option<PendingTrigger> = None;
    let mut action_data: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            if let Some(trigger) = pending.take() {
                triggers.push(trigger.finalize(path)?);
            }
            section = match name.trim() {
                "Trigger" => {
                    pending = Some(PendingTrigger::new());
                    Section::Trigger
                }
                "Action" => Section::Action,
                other => {
                    return Err(LpmError::Hook(format!(
                        "{}: Unknown section {other:?}",
                        path.display()
                    )));
                }
            };
            continue;
        }
        let (key, value) = line
            .split_once('=')
            .map_or((line, "true"), |(k, v)| (k.trim(), v.trim()));
        match section {
            Section::Trigger => {
                let trigger = pending.get_or_insert_with(PendingTrigger::new);
                if key.eq_ignore_ascii_case("type") {
                    trigger.trigger_type = match value.to_ascii_lowercase().as_str() {
                        "path" => Some(TriggerType::Path),
                        "package" => Some(TriggerType::Package),
                        other => {
                            return Err(LpmError::Hook(format!(
                                "{}: Invalid Trigger Type {other:?}",
                                path.display()
                            )));
                        }
                    };
                } else if key.eq_ignore_ascii_case("operation") {
                    let op = HookOperation::parse(value).ok_or_else(|| {
                        LpmError::Hook(format!("{}: Invalid Operation {value:?}", path.display()))
                    })?;
                    trigger.operations.insert(op);
                } else if key.eq_ignore_ascii_case("target") {
                    trigger.targets.push(value.to_string());
                } else {
                    tracing::debug!("ignoring unknown trigger key {key} in {}", path.display());
                }
            }
            Section::Action => {
                action_data
                    .entry(key.to_ascii_lowercase())
                    .or_default()
                    .push(value.to_string());
            }
            Section::None => {
                return Err(LpmError::Hook(format!(
                    "{}: Entry outside of [Trigger]/[Action] sections",
                    path.display()
                )));
            }
        }
    }
    if let Some(trigger) = pending.take() {
        triggers.push(trigger.finalize(path)?);
    }
    if triggers.is_empty() {
        return Err(LpmError::Hook(format!(
            "{}: hook must define at least one [Trigger]",
            path.display()
        )));
    }

    let when_raw = action_data
        .get("when")
        .and_then(|v| v.first())
        .ok_or_else(|| LpmError::Hook(format!("{}: Action missing When", path.display())))?;
    let when = HookWhen::parse(when_raw).ok_or_else(|| {
        LpmError::Hook(format!("{}: Invalid When {when_raw:?}", path.display()))
    })?;

    let exec_values = action_data
        .get("exec")
        .ok_or_else(|| LpmError::Hook(format!("{}: Action missing Exec", path.display())))?;
    if exec_values.len() != 1 {
        return Err(LpmError::Hook(format!(
            "{}: Action Exec must appear exactly once",
            path.display()
        )));
    }
    let exec = shlex::split(&exec_values[0]).filter(|v| !v.is_empty()).ok_or_else(|| {
        LpmError::Hook(format!("{}: Exec command is empty or unparseable", path.display()))
    })?;
    if exec.is_empty() {
        return Err(LpmError::Hook(format!("{}: Exec command is empty", path.display())));
    }

    let needs_targets = action_data
        .get("needstargets")
        .is_some_and(|values| values.iter().any(|v| truthy(v)));
    let abort_on_fail = action_data
        .get("abortonfail")
        .is_some_and(|values| values.iter().any(|v| truthy(v)));
    let depends = action_data
        .get("depends")
        .map(|values| {
            values
                .iter()
                .flat_map(|line| line.split_whitespace())
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default();

    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(Hook {
        name,
        path: path.to_path_buf(),
        triggers,
        action: HookAction { when, exec, needs_targets, depends, abort_on_fail },
    })
}

/// What: Load every `*.hook` file under the given directories.
///
/// Details:
/// - Files are visited in sorted order per directory; later directories
///   override earlier hooks with the same name. Invalid hooks are skipped
///   with a warning.
#[must_use]
pub fn load_hooks(dirs: &[PathBuf]) -> BTreeMap<String, Hook> {
    let mut hooks = BTreeMap::new();
    for dir in dirs {
        let Ok(entries) = std::fs::read_dir(dir) else { continue };
        let mut files: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "hook"))
            .collect();
        files.sort();
        for file in files {
            match parse_hook(&file) {
                Ok(hook) => {
                    hooks.insert(hook.name.clone(), hook);
                }
                Err(err) => {
                    tracing::warn!("ignoring invalid hook {}: {err}", file.display());
                }
            }
        }
    }
    hooks
}
