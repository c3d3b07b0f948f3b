use assert_cmd::prelude::*;
use std::{fs, process::Command};
use tempfile::TempDir;

fn tunestr(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("tunestr").unwrap();
    cmd.arg("--work-dir")
        .arg(dir.path())
        .env_remove("RUST_LOG");
    cmd
}

fn stderr_of(cmd: &mut Command) -> String {
    let output = cmd.output().unwrap();
    assert!(!output.status.success(), "expected failure");
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn help_lists_connection_flags() {
    let output = Command::cargo_bin("tunestr")
        .unwrap()
        .arg("--help")
        .output()
        .unwrap();
    assert!(output.status.success());
    let help = String::from_utf8_lossy(&output.stdout);
    for flag in ["--relay", "--user", "--ip", "--port", "--auth", "--debug", "--conf"] {
        assert!(help.contains(flag), "{flag} missing from help");
    }
}

#[test]
fn missing_clementine_host_is_a_configuration_error() {
    let dir = TempDir::new().unwrap();
    let err = stderr_of(tunestr(&dir).args(["-u", "alice"]));
    assert!(err.contains("configuration error"), "{err}");
    assert!(err.contains("clementine host"), "{err}");
}

#[test]
fn missing_user_is_a_configuration_error() {
    let dir = TempDir::new().unwrap();
    let err = stderr_of(tunestr(&dir).args(["-i", "127.0.0.1"]));
    assert!(err.contains("configuration error"), "{err}");
    assert!(err.contains("user is required"), "{err}");
}

#[test]
fn config_file_values_are_used() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("tunestr.env"), "CLEMENTINE_HOST=127.0.0.1\n").unwrap();
    // host comes from the file, so only the user is reported missing
    let err = stderr_of(&mut tunestr(&dir));
    assert!(err.contains("user is required"), "{err}");
}

#[test]
fn malformed_number_in_config_is_reported() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("tunestr.env"),
        "CLEMENTINE_HOST=127.0.0.1\nUSER=alice\nCLEMENTINE_PORT=abc\n",
    )
    .unwrap();
    let err = stderr_of(&mut tunestr(&dir));
    assert!(err.contains("CLEMENTINE_PORT"), "{err}");
}

#[test]
fn public_key_only_identity_is_rejected() {
    let dir = TempDir::new().unwrap();
    let npub = "npub1sg6plzptd64u62a878hep2kev88swjh3tw00gjsfl8f237lmu63q0uf63m";
    let err = stderr_of(tunestr(&dir).args(["-i", "127.0.0.1", "-u", npub]));
    assert!(err.contains("configuration error"), "{err}");
}

#[test]
fn unknown_alias_without_key_store_is_rejected() {
    let dir = TempDir::new().unwrap();
    let err = stderr_of(tunestr(&dir).args(["-i", "127.0.0.1", "-u", "alice"]));
    assert!(err.contains("key store"), "{err}");
}
