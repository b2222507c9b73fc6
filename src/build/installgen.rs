//! Embedded install-script generation.
//!
//! After staging, the packager inspects the tree and emits
//! `/.lpm-install.sh` only when something in the payload needs a
//! post-install action: desktop database or icon cache refreshes, ldconfig
//! for shared libraries, and rewriting absolute symlinks to relative ones so
//! installs into alternate roots stay self-contained.

use crate::error::Result;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

fn escape_double_quotes(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Relative path from `start` to `target` (both relative to the same root).
fn relative_path(target: &Path, start: &Path) -> PathBuf {
    let target_parts: Vec<Component<'_>> = target.components().collect();
    let start_parts: Vec<Component<'_>> = start.components().collect();
    let common = target_parts
        .iter()
        .zip(start_parts.iter())
        .take_while(|(a, b)| a == b)
        .count();
    let mut out = PathBuf::new();
    for _ in common..start_parts.len() {
        out.push("..");
    }
    for part in &target_parts[common..] {
        out.push(part);
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

/// What: Generate the embedded install script for a staged tree.
///
/// Output:
/// - The script body, or an empty string when nothing needs doing (the
///   caller skips embedding in that case).
///
/// Details:
/// - Desktop entries trigger `update-desktop-database`; icon themes
///   trigger `gtk-update-icon-cache`; shared objects trigger `ldconfig`
///   (real root only); absolute symlinks are re-pointed relative to their
///   own directory. Every command degrades to a no-op when the tool is
///   absent.
pub fn generate_install_script(stagedir: &Path) -> Result<String> {
    let mut cmds: Vec<String> = Vec::new();

    let apps_dir = stagedir.join("usr/share/applications");
    if apps_dir.is_dir() {
        let has_desktop = WalkDir::new(&apps_dir)
            .into_iter()
            .flatten()
            .any(|e| e.path().extension().is_some_and(|ext| ext == "desktop"));
        if has_desktop {
            cmds.push(
                "command -v update-desktop-database >/dev/null 2>&1 \
                 && update-desktop-database \"${LPM_ROOT:-/}/usr/share/applications\" || true"
                    .to_string(),
            );
        }
    }

    let icons_root = stagedir.join("usr/share/icons");
    if icons_root.is_dir()
        && let Ok(themes) = std::fs::read_dir(&icons_root)
    {
        let mut theme_dirs: Vec<PathBuf> = themes
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.join("index.theme").is_file())
            .collect();
        theme_dirs.sort();
        for theme in theme_dirs {
            if let Ok(rel) = theme.strip_prefix(stagedir) {
                cmds.push(format!(
                    "command -v gtk-update-icon-cache >/dev/null 2>&1 \
                     && gtk-update-icon-cache \"${{LPM_ROOT:-/}}/{}\" || true",
                    rel.display()
                ));
            }
        }
    }

    let lib_dir = stagedir.join("usr/lib");
    if lib_dir.is_dir() {
        let has_shared_objects = WalkDir::new(&lib_dir).into_iter().flatten().any(|e| {
            e.file_type().is_file()
                && e.file_name().to_string_lossy().contains(".so")
        });
        if has_shared_objects {
            cmds.push(
                "[ \"${LPM_ROOT:-/}\" = \"/\" ] && command -v ldconfig >/dev/null 2>&1 \
                 && ldconfig || true"
                    .to_string(),
            );
        }
    }

    // Absolute symlinks become relative so alternate roots resolve.
    for entry in WalkDir::new(stagedir).sort_by_file_name().into_iter().flatten() {
        if !entry.path_is_symlink() {
            continue;
        }
        let Ok(target) = std::fs::read_link(entry.path()) else { continue };
        if !target.is_absolute() {
            continue;
        }
        let Ok(rel_link) = entry.path().strip_prefix(stagedir) else { continue };
        let parent_rel = rel_link.parent().unwrap_or_else(|| Path::new(""));
        let stripped: PathBuf = target.components().skip(1).collect();
        let rel_target = relative_path(&stripped, parent_rel);

        let dest_expr = format!("${{LPM_ROOT:-/}}/{}", rel_link.display());
        cmds.push(format!(
            "[ -L \"{}\" ] && ln -snf \"{}\" \"{}\"",
            escape_double_quotes(&dest_expr),
            escape_double_quotes(&rel_target.display().to_string()),
            escape_double_quotes(&dest_expr),
        ));
    }

    if cmds.is_empty() {
        return Ok(String::new());
    }
    let mut script = String::from("#!/bin/sh\n");
    script.push_str(&cmds.join("\n"));
    script.push('\n');
    Ok(script)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_path() {
        assert_eq!(
            relative_path(Path::new("usr/lib/libz.so.1"), Path::new("usr/bin")),
            PathBuf::from("../lib/libz.so.1")
        );
        assert_eq!(
            relative_path(Path::new("usr/lib/a"), Path::new("usr/lib")),
            PathBuf::from("a")
        );
        assert_eq!(relative_path(Path::new("usr"), Path::new("usr")), PathBuf::from("."));
    }

    #[test]
    fn test_empty_stage_generates_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert_eq!(generate_install_script(dir.path()).expect("gen"), "");
    }

    #[test]
    fn test_desktop_and_ldconfig_commands() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("usr/share/applications")).expect("mkdir");
        std::fs::write(
            dir.path().join("usr/share/applications/tool.desktop"),
            b"[Desktop Entry]\n",
        )
        .expect("write");
        std::fs::create_dir_all(dir.path().join("usr/lib")).expect("mkdir");
        std::fs::write(dir.path().join("usr/lib/libtool.so.1"), b"elf").expect("write");

        let script = generate_install_script(dir.path()).expect("gen");
        assert!(script.starts_with("#!/bin/sh\n"));
        assert!(script.contains("update-desktop-database"));
        assert!(script.contains("ldconfig"));
    }

    #[test]
    fn test_absolute_symlink_rewritten_relative() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("usr/bin")).expect("mkdir");
        std::fs::create_dir_all(dir.path().join("usr/lib")).expect("mkdir");
        std::os::unix::fs::symlink("/usr/lib/tool-real", dir.path().join("usr/bin/tool"))
            .expect("symlink");

        let script = generate_install_script(dir.path()).expect("gen");
        assert!(script.contains("ln -snf \"../lib/tool-real\""));
        assert!(script.contains("usr/bin/tool"));
    }

    #[test]
    fn test_relative_symlink_untouched() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("usr/bin")).expect("mkdir");
        std::os::unix::fs::symlink("tool-real", dir.path().join("usr/bin/tool"))
            .expect("symlink");
        let script = generate_install_script(dir.path()).expect("gen");
        assert!(!script.contains("ln -snf"));
    }
}
