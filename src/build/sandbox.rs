//! Sandboxed phase execution and the compiler environment contract.

use crate::config::CpuTuning;
use crate::error::{LpmError, Result};
use std::path::{Path, PathBuf};
use std::process::Command;

/// CPU tuning overrides parsed from `@…` build arguments.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CpuOverrides {
    /// `@Override=arch=VALUE`: replace `-march`/`-mtune`.
    pub arch: Option<String>,
    /// `@none!`: drop tuning flags entirely.
    pub disabled: bool,
    /// `@lto!=on` / `@lto!=off`.
    pub lto: Option<bool>,
}

/// What: Parse `@…` override arguments.
///
/// Inputs:
/// - `args`: Raw override strings, e.g. `["@Override=arch=x86-64-v3", "@lto!=on"]`.
///
/// # Errors
///
/// `LpmError::InvalidInput` on an unrecognized override.
pub fn parse_cpu_overrides(args: &[String]) -> Result<CpuOverrides> {
    let mut overrides = CpuOverrides::default();
    for arg in args {
        let arg = arg.trim();
        if arg.is_empty() {
            continue;
        }
        if arg == "@none!" {
            overrides.disabled = true;
        } else if let Some(value) = arg.strip_prefix("@lto!=") {
            overrides.lto = Some(matches!(value.to_ascii_lowercase().as_str(), "on" | "1" | "true"));
        } else if let Some(rest) = arg.strip_prefix("@Override=") {
            match rest.split_once('=') {
                Some(("arch", value)) if !value.is_empty() => {
                    overrides.arch = Some(value.to_string());
                }
                _ => {
                    return Err(LpmError::InvalidInput(format!("unknown override {arg:?}")));
                }
            }
        } else {
            return Err(LpmError::InvalidInput(format!("unknown override {arg:?}")));
        }
    }
    Ok(overrides)
}

/// What: Derive `CFLAGS`/`CXXFLAGS`/`LDFLAGS` from tuning plus overrides.
#[must_use]
pub fn compiler_env(cpu: &CpuTuning, overrides: &CpuOverrides) -> Vec<(String, String)> {
    let mut cflags = format!("-O{}", cpu.level);
    if !overrides.disabled {
        let march = overrides.arch.as_deref().unwrap_or(&cpu.march);
        let mtune = overrides.arch.as_deref().unwrap_or(&cpu.mtune);
        cflags.push_str(&format!(" -march={march} -mtune={mtune}"));
    }
    let mut ldflags = "-Wl,-O1,--sort-common,--as-needed".to_string();
    if overrides.lto == Some(true) {
        cflags.push_str(" -flto");
        ldflags.push_str(" -flto");
    }
    vec![
        ("CFLAGS".into(), cflags.clone()),
        ("CXXFLAGS".into(), cflags),
        ("LDFLAGS".into(), ldflags),
    ]
}

/// How phases are isolated from the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SandboxMode {
    /// bubblewrap: read-only host, writable build tree.
    Bwrap,
    /// Plain child process (bwrap unavailable).
    None,
}

/// What: Pick the strongest available sandbox.
#[must_use]
pub fn detect_sandbox() -> SandboxMode {
    if which::which("bwrap").is_ok() {
        SandboxMode::Bwrap
    } else {
        tracing::debug!("bwrap not found, running build phases unsandboxed");
        SandboxMode::None
    }
}

/// What: Run one recipe phase function as a child process.
///
/// Inputs:
/// - `function`: Shell function to invoke (already alias-resolved).
/// - `recipe`: Recipe script path (sourced by the driver snippet).
/// - `cwd`: Working directory for the phase.
/// - `env`: Environment contract entries appended to the inherited env.
/// - `mode`: Isolation mode.
///
/// Details:
/// - The phase runs under `bash -e`; a missing function is a no-op so
///   recipes only declare the phases they need.
///
/// # Errors
///
/// `LpmError::Build` when the child fails to spawn or exits non-zero.
pub fn run_phase(
    function: &str,
    recipe: &Path,
    cwd: &Path,
    env: &[(String, String)],
    mode: SandboxMode,
) -> Result<()> {
    let snippet = format!(
        "set -e\nsource \"$LPM_RECIPE\"\nif declare -F {function} >/dev/null 2>&1; then {function}; fi"
    );
    let mut command = match mode {
        SandboxMode::Bwrap => {
            let mut c = Command::new("bwrap");
            c.arg("--ro-bind").arg("/").arg("/");
            for writable in writable_roots(env, cwd) {
                c.arg("--bind").arg(&writable).arg(&writable);
            }
            c.arg("--dev").arg("/dev")
                .arg("--proc").arg("/proc")
                .arg("--chdir").arg(cwd)
                .arg("--die-with-parent")
                .arg("bash").arg("-c").arg(&snippet);
            c
        }
        SandboxMode::None => {
            let mut c = Command::new("bash");
            c.arg("-c").arg(&snippet).current_dir(cwd);
            c
        }
    };
    command.env("LPM_RECIPE", recipe);
    for (key, value) in env {
        command.env(key, value);
    }
    let status = command.status().map_err(|err| {
        LpmError::Build(format!("failed to spawn phase {function}: {err}"))
    })?;
    if !status.success() {
        return Err(LpmError::Build(format!("phase {function} failed: {status}")));
    }
    Ok(())
}

/// Directories the sandboxed phase may write: the build tree roots named by
/// the environment contract.
fn writable_roots(env: &[(String, String)], cwd: &Path) -> Vec<PathBuf> {
    let mut roots = vec![cwd.to_path_buf()];
    for (key, value) in env {
        if matches!(key.as_str(), "SRCDIR" | "BUILDROOT" | "pkgdir" | "LPM_SPLIT_SPOOL") {
            let path = PathBuf::from(value);
            if !roots.iter().any(|r| path.starts_with(r)) {
                roots.push(path);
            }
        }
    }
    roots
}
