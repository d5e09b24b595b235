//! CLI integration tests for the offline subcommands.
//!
//! Uses `assert_cmd` to spawn the `jitgate` binary and verify
//! exit codes, stdout content, and stderr content.

use assert_cmd::cargo::cargo_bin_cmd;
use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn jitgate() -> Command {
    let mut cmd = cargo_bin_cmd!("jitgate");
    cmd.env("JITGATE_SECRET_KEY", "cli-test-secret");
    cmd.env_remove("RUST_LOG");
    cmd
}

#[test]
fn help_exits_0_with_description() {
    jitgate()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "Just-in-time privilege and step-up verification service",
        ));
}

#[test]
fn version_exits_0() {
    jitgate()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("jitgate"));
}

#[test]
fn unknown_subcommand_fails() {
    jitgate().arg("frobnicate").assert().failure();
}

#[test]
fn hash_answer_prints_salted_digest() {
    jitgate()
        .args(["hash-answer", "  June "])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("sha256$"));
}

#[test]
fn hash_answer_json_output() {
    let output = jitgate()
        .args(["--output", "json", "hash-answer", "iphone"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert!(value["digest"].as_str().unwrap().starts_with("sha256$"));
}

#[test]
fn seed_creates_demo_users_once() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("gate.db");

    jitgate()
        .args(["seed", "--db"])
        .arg(&db)
        .assert()
        .success()
        .stdout(predicate::str::contains("cs1@example.com"))
        .stdout(predicate::str::contains("3 challenge questions"));

    jitgate()
        .args(["seed", "--db"])
        .arg(&db)
        .assert()
        .failure()
        .stderr(predicate::str::contains("already seeded"));
}

#[test]
fn audit_of_fresh_database_is_empty() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("gate.db");
    jitgate().args(["seed", "--db"]).arg(&db).assert().success();

    let output = jitgate()
        .args(["--output", "json", "audit", "--db"])
        .arg(&db)
        .output()
        .unwrap();
    assert!(output.status.success());
    let rows: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(rows, serde_json::json!([]));
}

#[test]
fn audit_requires_an_existing_database() {
    let dir = TempDir::new().unwrap();
    jitgate()
        .args(["audit", "--db"])
        .arg(dir.path().join("missing.db"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("no database"));
}

#[test]
fn audit_case_and_reports_conflict() {
    jitgate()
        .args(["audit", "--case", "1", "--reports"])
        .assert()
        .failure();
}
