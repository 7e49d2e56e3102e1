//! CLI argument parsing tests.
//!
//! These exercise only parsing and startup validation, so every invocation
//! exits promptly; nothing here starts a serving loop.

#![allow(deprecated)] // Command::cargo_bin is deprecated but replacement requires newer assert_cmd

use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn version_flag_shows_version() {
    Command::cargo_bin("granite")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("granite"));
}

#[test]
fn help_flag_shows_options() {
    Command::cargo_bin("granite")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--workers"))
        .stdout(predicate::str::contains("--max-connections"))
        .stdout(predicate::str::contains("--root"))
        .stdout(predicate::str::contains("--tls"));
}

#[test]
fn unknown_flag_is_rejected() {
    Command::cargo_bin("granite")
        .unwrap()
        .arg("--definitely-not-a-flag")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unexpected argument"));
}

#[test]
fn non_numeric_port_is_rejected() {
    Command::cargo_bin("granite")
        .unwrap()
        .args(["--http-port", "not-a-port"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid value"));
}

#[test]
fn invalid_bind_address_is_rejected() {
    Command::cargo_bin("granite")
        .unwrap()
        .args(["--bind-v4", "256.1.2.3"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid value"));
}

#[test]
fn missing_document_root_fails_startup() {
    Command::cargo_bin("granite")
        .unwrap()
        .args(["--root", "/definitely/not/a/real/dir", "--http-port", "0"])
        .assert()
        .failure();
}

#[test]
fn zero_workers_fails_startup() {
    Command::cargo_bin("granite")
        .unwrap()
        .args(["--workers", "0", "--http-port", "0"])
        .assert()
        .failure();
}

#[test]
fn tls_without_key_material_fails_startup() {
    let temp = tempfile::tempdir().unwrap();
    Command::cargo_bin("granite")
        .unwrap()
        .args([
            "--root",
            temp.path().to_str().unwrap(),
            "--tls",
            "--tls-cert",
            "/nonexistent/cert.pem",
            "--tls-key",
            "/nonexistent/key.pem",
            "--http-port",
            "0",
            "--https-port",
            "0",
        ])
        .assert()
        .failure();
}
