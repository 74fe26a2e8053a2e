// SPDX-License-Identifier: AGPL-3.0-only
#![forbid(unsafe_code)]

use std::process::Command;

use assert_cmd::cargo::cargo_bin;
use tempfile::TempDir;

fn node(dir: &TempDir) -> Command {
    let mut cmd = Command::new(cargo_bin("diode-node"));
    cmd.arg("--dbpath").arg(dir.path()).arg("--fsync").arg("false");
    cmd
}

fn stdout_of(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

#[test]
fn config_set_list_delete_roundtrip() {
    let dir = TempDir::new().expect("tempdir");

    let set = node(&dir)
        .args(["config", "--set", "fleet=0x6000000000000000000000000000000000000000"])
        .output()
        .expect("run set");
    assert!(set.status.success(), "set failed: {set:?}");

    let list = node(&dir).args(["config", "--list"]).output().expect("run list");
    assert!(list.status.success());
    let text = stdout_of(&list);
    assert!(text.contains("fleet"), "missing key in: {text}");
    assert!(text.contains("0x6000000000000000000000000000000000000000"));

    let del = node(&dir)
        .args(["config", "--delete", "fleet"])
        .output()
        .expect("run delete");
    assert!(del.status.success());

    let list = node(&dir).args(["config", "--list"]).output().expect("relist");
    assert!(!stdout_of(&list).contains("fleet"));
}

#[test]
fn config_hides_private_key_without_unsafe() {
    let dir = TempDir::new().expect("tempdir");
    let reset = node(&dir).args(["reset", "--force"]).output().expect("reset");
    assert!(reset.status.success(), "reset failed: {reset:?}");
    assert!(stdout_of(&reset).contains("new account 0x"));

    let list = node(&dir).args(["config", "--list"]).output().expect("list");
    assert!(!stdout_of(&list).contains("private"));

    let unsafe_list = node(&dir)
        .args(["config", "--list", "--unsafe"])
        .output()
        .expect("unsafe list");
    assert!(stdout_of(&unsafe_list).contains("private"));
}

#[test]
fn config_refuses_private_overwrite() {
    let dir = TempDir::new().expect("tempdir");
    let set = node(&dir)
        .args(["config", "--set", "private=0x00"])
        .output()
        .expect("run");
    assert!(!set.status.success());
    assert_eq!(set.status.code(), Some(129), "config errors are fatal at startup");
}

#[test]
fn reset_requires_force() {
    let dir = TempDir::new().expect("tempdir");
    let refused = node(&dir).arg("reset").output().expect("run");
    assert_eq!(refused.status.code(), Some(1));
}

#[test]
fn reset_rotates_account() {
    let dir = TempDir::new().expect("tempdir");
    let first = node(&dir).args(["reset", "--force"]).output().expect("first");
    let second = node(&dir).args(["reset", "--force"]).output().expect("second");
    let a = stdout_of(&first);
    let b = stdout_of(&second);
    assert!(a.starts_with("new account 0x"));
    assert!(b.starts_with("new account 0x"));
    assert_ne!(a, b, "reset must rotate the key");
}

#[test]
fn missing_subcommand_is_usage_error() {
    let dir = TempDir::new().expect("tempdir");
    let out = node(&dir).output().expect("run");
    assert_eq!(out.status.code(), Some(2));
}

#[test]
fn bns_without_flags_is_usage_error() {
    let dir = TempDir::new().expect("tempdir");
    let out = node(&dir).arg("bns").output().expect("run");
    assert_eq!(out.status.code(), Some(2));
}

#[test]
fn publish_without_ports_fails() {
    let dir = TempDir::new().expect("tempdir");
    let out = node(&dir).arg("publish").output().expect("run");
    assert_eq!(out.status.code(), Some(1));
}

#[test]
fn publish_rejects_bad_mapping() {
    let dir = TempDir::new().expect("tempdir");
    let out = node(&dir)
        .args(["publish", "--public", "eighty:80"])
        .output()
        .expect("run");
    assert_eq!(out.status.code(), Some(129));
}

#[test]
fn update_reports_version() {
    let dir = TempDir::new().expect("tempdir");
    let out = node(&dir).arg("update").output().expect("run");
    assert!(out.status.success());
    assert!(stdout_of(&out).contains(env!("CARGO_PKG_VERSION")));
}

#[test]
#[ignore] // braucht Netz und einen Gateway
fn time_against_prenet() {
    let dir = TempDir::new().expect("tempdir");
    let out = node(&dir).arg("time").output().expect("run");
    assert!(out.status.success());
    assert!(stdout_of(&out).contains("unix time"));
}
