//! Command-line behaviour: exit codes, output shapes, flag handling.

mod common;
use common::{numbered_lines, RepoFixture, DAY, EPOCH};

use assert_cmd::Command;
use predicates::prelude::*;

fn strata() -> Command {
    Command::cargo_bin("strata").expect("strata binary")
}

fn fixture_with_history() -> RepoFixture {
    let fixture = RepoFixture::new();
    let a = fixture.commit(&[], &[("code.txt", &numbered_lines(1..=10))], &[], "alice", EPOCH);
    let b = fixture.commit(
        &[a],
        &[("code.txt", &numbered_lines(1..=12))],
        &[],
        "bob",
        EPOCH + DAY,
    );
    fixture.set_head(b);
    fixture
}

#[test]
fn missing_repository_is_a_usage_error() {
    strata().assert().failure().code(2);
}

#[test]
fn unknown_flag_is_a_usage_error() {
    let fixture = fixture_with_history();
    strata()
        .arg(fixture.path())
        .arg("--no-such-analysis")
        .assert()
        .failure()
        .code(2);
}

#[test]
fn no_selected_analyses_is_a_config_error() {
    let fixture = fixture_with_history();
    strata()
        .arg(fixture.path())
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("no analyses selected"));
}

#[test]
fn disabled_stub_is_a_config_error_naming_the_reason() {
    let fixture = fixture_with_history();
    strata()
        .arg(fixture.path())
        .arg("--sentiment")
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("disabled"))
        .stderr(predicate::str::contains("sentiment"));
}

#[test]
fn unreadable_repository_is_a_runtime_error() {
    strata()
        .arg("/nonexistent/not-a-repo")
        .arg("--burndown")
        .assert()
        .failure()
        .code(1);
}

#[test]
fn text_report_has_header_and_item_blocks() {
    let fixture = fixture_with_history();
    strata()
        .arg(fixture.path())
        .args(["--burndown", "--devs", "--quiet"])
        .assert()
        .success()
        .stdout(predicate::str::contains("header:"))
        .stdout(predicate::str::contains("commit_count: 2"))
        .stdout(predicate::str::contains("burndown:"))
        .stdout(predicate::str::contains("devs:"));
}

#[test]
fn binary_report_carries_the_magic() {
    let fixture = fixture_with_history();
    let output = strata()
        .arg(fixture.path())
        .args(["--burndown", "--pb", "--quiet"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    assert!(output.starts_with(b"STRA"), "record stream starts with magic");
}

#[test]
fn tick_size_is_validated() {
    let fixture = fixture_with_history();
    strata()
        .arg(fixture.path())
        .args(["--burndown", "--tick-size", "eleven"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("duration"));
}

#[test]
fn dump_plan_prints_actions_without_running() {
    let fixture = fixture_with_history();
    strata()
        .arg(fixture.path())
        .arg("--dump-plan")
        .assert()
        .success()
        .stdout(predicate::str::contains("emerge"));
}

#[test]
fn typos_analysis_reports_candidates() {
    let fixture = RepoFixture::new();
    let a = fixture.commit(
        &[],
        &[("doc.txt", b"the quick borwn fox\nsecond line\n")],
        &[],
        "alice",
        EPOCH,
    );
    let b = fixture.commit(
        &[a],
        &[("doc.txt", b"the quick brown fox\nsecond line\n")],
        &[],
        "alice",
        EPOCH + DAY,
    );
    fixture.set_head(b);
    strata()
        .arg(fixture.path())
        .args(["--typos", "--quiet"])
        .assert()
        .success()
        .stdout(predicate::str::contains("typos:"))
        .stdout(predicate::str::contains("count: 1"))
        .stdout(predicate::str::contains("borwn"));
}
