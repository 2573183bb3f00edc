//! Integration tests for the abr-bench command-line interface
//!
//! None of these reach the network substrate: they cover argument parsing,
//! the preset listing, and failures that happen before any namespace exists.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn cli_command() -> Command {
    Command::cargo_bin("abr-bench").expect("Failed to find abr-bench binary")
}

#[test]
fn test_cli_help() {
    let mut cmd = cli_command();
    cmd.arg("--help");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Usage:"))
        .stdout(predicate::str::contains("--list"))
        .stdout(predicate::str::contains("--scenario"))
        .stdout(predicate::str::contains("[INDEX]"));
}

#[test]
fn test_cli_version() {
    let mut cmd = cli_command();
    cmd.arg("--version");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("abr-bench"));
}

#[test]
fn test_cli_missing_index() {
    let mut cmd = cli_command();

    cmd.assert()
        .code(2)
        .stderr(predicate::str::contains("required"));
}

#[test]
fn test_cli_index_out_of_range() {
    for arg in ["0", "11", "abc"] {
        let mut cmd = cli_command();
        cmd.arg(arg);

        cmd.assert()
            .code(2)
            .stderr(predicate::str::contains("invalid value"));
    }
}

#[test]
fn test_cli_extra_arguments() {
    let mut cmd = cli_command();
    cmd.args(["1", "2"]);

    cmd.assert().code(2);
}

#[test]
fn test_cli_list() {
    let mut cmd = cli_command();
    cmd.arg("--list");

    let assert = cmd.assert().success();
    let output = String::from_utf8_lossy(&assert.get_output().stdout).to_string();
    for i in 1..=10 {
        assert!(
            output.contains(&format!("testcase{}", i)),
            "missing testcase{} in:\n{}",
            i,
            output
        );
    }
}

#[test]
fn test_cli_list_conflicts_with_index() {
    let mut cmd = cli_command();
    cmd.args(["--list", "3"]);

    cmd.assert().code(2);
}

#[test]
fn test_cli_invalid_scenario_file() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("broken.json");
    fs::write(&path, "{ \"name\": \"broken\" ").unwrap();

    let mut cmd = cli_command();
    cmd.arg("--scenario").arg(&path).arg("--work-dir").arg(temp_dir.path());

    cmd.assert()
        .code(1)
        .stdout(predicate::str::contains("invalid scenario file"));
}

#[test]
fn test_cli_missing_scenario_file() {
    let mut cmd = cli_command();
    cmd.args(["--scenario", "/nonexistent/scenario.json"]);

    cmd.assert()
        .code(1)
        .stdout(predicate::str::contains("cannot read scenario file"));
}

#[test]
fn test_cli_missing_config_file() {
    let mut cmd = cli_command();
    cmd.args(["--config", "/nonexistent/harness.json", "1"]);

    cmd.assert().code(1);
}

#[test]
fn test_cli_scenario_conflicts_with_index() {
    let mut cmd = cli_command();
    cmd.args(["--scenario", "x.json", "2"]);

    cmd.assert().code(2);
}
