//! CLI surface tests for the deputy binary.

use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn help_documents_the_surface() {
    Command::cargo_bin("posse-deputy")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--id"))
        .stdout(predicate::str::contains("--bus-url"))
        .stdout(predicate::str::contains("--log-file"));
}

#[test]
fn version_prints() {
    Command::cargo_bin("posse-deputy")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("posse-deputy"));
}

#[test]
fn bad_bus_url_exits_with_code_1() {
    Command::cargo_bin("posse-deputy")
        .unwrap()
        .args(["--bus-url", "tcp://not-a-bus"])
        .assert()
        .code(1);
}
