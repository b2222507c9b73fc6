//! Recipe-to-root round trips: build an artifact from a recipe, then
//! install and remove it with the transaction engine.

use lpm::build::{BuildOptions, SandboxMode, run_build};
use lpm::container::read_package_meta;
use lpm::prelude::*;
use std::collections::HashSet;
use std::fs;
use std::path::Path;

fn scratch_config(dir: &Path) -> Config {
    let mut config = Config::from_env();
    config.state_dir = dir.join("state");
    config.root = dir.join("root");
    config.hook_dirs = vec![dir.join("hooks")];
    fs::create_dir_all(&config.root).expect("mkdir root");
    fs::create_dir_all(&config.state_dir).expect("mkdir state");
    config
}

const RECIPE: &str = r#"NAME=greeter
VERSION=0.3
RELEASE=1
ARCH=noarch
SUMMARY="Greets"
prepare(){ :; }
staging(){
  mkdir -p "$pkgdir/usr/bin"
  printf '#!/bin/sh\necho hello\n' > "$pkgdir/usr/bin/greeter"
  chmod 755 "$pkgdir/usr/bin/greeter"
}
"#;

#[test]
fn test_buildpkg_then_installpkg_then_removepkg() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = scratch_config(dir.path());

    let script = dir.path().join("greeter.lpmbuild");
    fs::write(&script, RECIPE).expect("write recipe");

    let opts = BuildOptions {
        sandbox: Some(SandboxMode::None),
        ..BuildOptions::default()
    };
    let output = run_build(&config, &HashSet::new(), &script, &dir.path().join("out"), &opts)
        .expect("build");
    assert_eq!(output.phases_run, 2);
    let (meta, manifest) = read_package_meta(&output.artifact).expect("read");
    assert_eq!(meta.name, "greeter");
    assert!(manifest.iter().any(|e| e.path == "/usr/bin/greeter"));

    // Install the freshly built artifact onto the scratch root.
    let mut store = open_store(&config.db_path(), false).expect("open store");
    let txn_opts = TxnOptions {
        verify: false,
        assume_conflict: Some(ConflictChoice::Replace),
        ..TxnOptions::default()
    };
    let explicit = HashSet::from(["greeter".to_string()]);
    {
        let mut engine = Engine::new(&config, store.as_mut());
        engine
            .install_files(&[output.artifact.clone()], &txn_opts, &explicit, None)
            .expect("install");
    }
    let installed_bin = config.root.join("usr/bin/greeter");
    assert!(installed_bin.exists());
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(&installed_bin).expect("stat").permissions().mode();
        assert_eq!(mode & 0o111, 0o111, "executable bit preserved");
    }

    // And remove it again.
    {
        let mut engine = Engine::new(&config, store.as_mut());
        engine
            .remove(&["greeter".to_string()], &txn_opts)
            .expect("remove");
    }
    assert!(!installed_bin.exists());
    assert!(store.get_installed("greeter").expect("get").is_none());
}

#[test]
fn test_built_artifact_signature_round_trip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = scratch_config(dir.path());
    let script = dir.path().join("greeter.lpmbuild");
    fs::write(&script, RECIPE).expect("write recipe");

    let opts = BuildOptions {
        sandbox: Some(SandboxMode::None),
        ..BuildOptions::default()
    };
    let output = run_build(&config, &HashSet::new(), &script, &dir.path().join("out"), &opts)
        .expect("build");

    lpm::container::sign::generate_keypair(&config.signing_key, &config.verify_key)
        .expect("keygen");
    let sig = lpm::container::sign::sign_artifact(&output.artifact, &config.signing_key)
        .expect("sign");
    lpm::container::sign::verify_signature(&output.artifact, &sig, &config.verify_key)
        .expect("verify");

    // A verified install succeeds end to end.
    let mut store = open_store(&config.db_path(), false).expect("open store");
    let txn_opts = TxnOptions {
        verify: true,
        assume_conflict: Some(ConflictChoice::Replace),
        ..TxnOptions::default()
    };
    let explicit = HashSet::from(["greeter".to_string()]);
    let mut engine = Engine::new(&config, store.as_mut());
    engine
        .install_files(&[output.artifact], &txn_opts, &explicit, None)
        .expect("verified install");
}

#[test]
fn test_install_script_generated_only_when_needed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = scratch_config(dir.path());

    // A library recipe triggers the ldconfig snippet.
    let script = dir.path().join("libfoo.lpmbuild");
    fs::write(
        &script,
        "NAME=libfoo\nVERSION=1\nARCH=noarch\nstaging(){\n  mkdir -p \"$pkgdir/usr/lib\"\n  echo elf > \"$pkgdir/usr/lib/libfoo.so.1\"\n}\n",
    )
    .expect("write recipe");
    let opts = BuildOptions { sandbox: Some(SandboxMode::None), ..BuildOptions::default() };
    let output = run_build(&config, &HashSet::new(), &script, &dir.path().join("out"), &opts)
        .expect("build");
    let (_, manifest) = read_package_meta(&output.artifact).expect("read");
    assert!(manifest.iter().any(|e| e.path == "/.lpm-install.sh"));

    // A plain data recipe gets no embedded script.
    let script = dir.path().join("data.lpmbuild");
    fs::write(
        &script,
        "NAME=data\nVERSION=1\nARCH=noarch\nstaging(){\n  mkdir -p \"$pkgdir/usr/share/data\"\n  echo 1 > \"$pkgdir/usr/share/data/one\"\n}\n",
    )
    .expect("write recipe");
    let output = run_build(&config, &HashSet::new(), &script, &dir.path().join("out2"), &opts)
        .expect("build");
    let (_, manifest) = read_package_meta(&output.artifact).expect("read");
    assert!(manifest.iter().all(|e| e.path != "/.lpm-install.sh"));
}
