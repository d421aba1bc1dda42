//! End-to-end engine scenarios over real throwaway repositories.

mod common;
use common::*;

use pretty_assertions::assert_eq;
use strata::commits::HistoryOptions;
use strata::item::OptionValue;
use strata::items::burndown::BurndownReport;
use strata::items::devs::DevsReport;
use strata::items::file_history::FileHistoryReport;
use strata::plan::ActionKind;

const FINE: &[(&str, OptionValue)] = &[
    ("burndown-granularity", OptionValue::Int(1)),
    ("burndown-sampling", OptionValue::Int(1)),
];

fn decode<T: serde::de::DeserializeOwned>(outcome: &strata::pipeline::RunOutcome, name: &str) -> T {
    let bytes = outcome.results[name].to_bytes().expect("payload bytes");
    bincode::deserialize(&bytes).expect("payload decode")
}

fn final_alive_lines(report: &BurndownReport) -> i64 {
    report
        .project
        .values()
        .last()
        .map(|bands| bands.values().sum())
        .unwrap_or(0)
}

#[test]
fn linear_chain() {
    // Three commits by one author: create ten lines, rewrite three, drop the
    // last three.
    let fixture = RepoFixture::new();
    let mut middle = numbered_lines(1..=10);
    middle = String::from_utf8(middle)
        .unwrap()
        .replace("line number 3", "rewritten three")
        .replace("line number 4", "rewritten four")
        .replace("line number 5", "rewritten five")
        .into_bytes();
    let shortened: Vec<u8> = String::from_utf8(middle.clone())
        .unwrap()
        .lines()
        .take(7)
        .map(|l| format!("{l}\n"))
        .collect::<String>()
        .into_bytes();

    let a = fixture.commit(&[], &[("code.txt", &numbered_lines(1..=10))], &[], "alice", EPOCH);
    let b = fixture.commit(&[a], &[("code.txt", &middle)], &[], "alice", EPOCH + DAY);
    let c = fixture.commit(&[b], &[("code.txt", &shortened)], &[], "alice", EPOCH + 2 * DAY);
    fixture.set_head(c);

    let (plan, outcome) = run_analyses(
        &fixture,
        &["burndown", "devs"],
        FINE,
        None,
        HistoryOptions::default(),
    );

    let kinds: Vec<ActionKind> = plan.actions.iter().map(|a| a.kind).collect();
    assert_eq!(
        kinds,
        vec![
            ActionKind::Emerge,
            ActionKind::Commit,
            ActionKind::Commit,
            ActionKind::Commit
        ]
    );
    assert_eq!(outcome.commit_count, 3);
    assert_eq!(outcome.begin_tick, 0);
    assert_eq!(outcome.end_tick, 2);

    let burndown: BurndownReport = decode(&outcome, "burndown");
    assert_eq!(final_alive_lines(&burndown), 7);

    let devs: DevsReport = decode(&outcome, "devs");
    assert_eq!(devs.people.len(), 1, "a single author across the chain");
    assert_eq!(devs.ticks[&0][&0].lines_added, 10);
}

#[test]
fn diamond_with_rename_across_merge() {
    // One branch renames the file, the other edits it; the merge keeps both:
    // the new name, and every line (nothing is dropped).
    let fixture = RepoFixture::new();
    let base = numbered_lines(1..=10);
    let edited: Vec<u8> = String::from_utf8(base.clone())
        .unwrap()
        .replace("line number 6", "edited six")
        .replace("line number 7", "edited seven")
        .into_bytes();

    let a = fixture.commit(&[], &[("old.txt", &base)], &[], "alice", EPOCH);
    let b = fixture.commit(&[a], &[("new.txt", &base)], &["old.txt"], "bob", EPOCH + DAY);
    let c = fixture.commit(&[a], &[("old.txt", &edited)], &[], "carol", EPOCH + 2 * DAY);
    let d = fixture.commit(
        &[b, c],
        &[("new.txt", &edited)],
        &["old.txt"],
        "dave",
        EPOCH + 3 * DAY,
    );
    fixture.set_head(d);

    let (plan, outcome) = run_analyses(
        &fixture,
        &["burndown", "file-history"],
        FINE,
        None,
        HistoryOptions::default(),
    );

    assert_eq!(plan.merges, 1);
    assert!(plan.actions.iter().any(|a| a.kind == ActionKind::Fork));
    assert_eq!(outcome.commit_count, 4);

    let burndown: BurndownReport = decode(&outcome, "burndown");
    assert_eq!(final_alive_lines(&burndown), 10, "no interval dropped by the merge");

    let files: FileHistoryReport = decode(&outcome, "file_history");
    let log = files.files.get("new.txt").expect("renamed file is known");
    assert_eq!(log.renames.len(), 1);
    let (_, from, to) = log.renames.iter().next().unwrap();
    assert_eq!((from.as_str(), to.as_str()), ("old.txt", "new.txt"));
}

#[test]
fn binary_files_are_outside_line_history() {
    let fixture = RepoFixture::new();
    let a = fixture.commit(
        &[],
        &[
            ("img.bin", b"\x00\x01\x02\x03 definitely not text"),
            ("text.txt", &numbered_lines(1..=3)),
        ],
        &[],
        "alice",
        EPOCH,
    );
    fixture.set_head(a);

    let (_, outcome) = run_analyses(
        &fixture,
        &["burndown", "file-history"],
        FINE,
        None,
        HistoryOptions::default(),
    );

    let burndown: BurndownReport = decode(&outcome, "burndown");
    assert_eq!(final_alive_lines(&burndown), 3, "only the text file has lines");

    // The tree-level view still observes the binary insert.
    let files: FileHistoryReport = decode(&outcome, "file_history");
    assert!(files.files.contains_key("img.bin"));
}

#[test]
fn hibernation_does_not_change_results() {
    // A diamond run with aggressive hibernation must agree, byte for byte,
    // with the plain run.
    let fixture = RepoFixture::new();
    let base = numbered_lines(1..=10);
    let left: Vec<u8> = String::from_utf8(base.clone())
        .unwrap()
        .replace("line number 3", "left three")
        .into_bytes();
    let right: Vec<u8> = String::from_utf8(base.clone())
        .unwrap()
        .replace("line number 8", "right eight")
        .into_bytes();
    let merged: Vec<u8> = String::from_utf8(left.clone())
        .unwrap()
        .replace("line number 8", "right eight")
        .into_bytes();

    let a = fixture.commit(&[], &[("f.txt", &base)], &[], "alice", EPOCH);
    let b = fixture.commit(&[a], &[("f.txt", &left)], &[], "bob", EPOCH + DAY);
    let c = fixture.commit(&[a], &[("f.txt", &right)], &[], "carol", EPOCH + 2 * DAY);
    let d = fixture.commit(&[b, c], &[("f.txt", &merged)], &[], "dave", EPOCH + 3 * DAY);
    fixture.set_head(d);

    let (_, plain) = run_analyses(
        &fixture,
        &["burndown", "devs"],
        FINE,
        None,
        HistoryOptions::default(),
    );
    let (hibernating_plan, hibernated) = run_analyses(
        &fixture,
        &["burndown", "devs"],
        FINE,
        Some(0),
        HistoryOptions::default(),
    );

    assert!(
        hibernating_plan
            .actions
            .iter()
            .any(|a| a.kind == ActionKind::Hibernate),
        "the aggressive plan actually hibernates"
    );
    for name in ["burndown", "devs"] {
        assert_eq!(
            plain.results[name].to_bytes().unwrap(),
            hibernated.results[name].to_bytes().unwrap(),
            "{name} diverged under hibernation"
        );
    }
}

#[test]
fn head_only_analyses_one_commit() {
    let fixture = RepoFixture::new();
    let a = fixture.commit(&[], &[("f.txt", &numbered_lines(1..=5))], &[], "alice", EPOCH);
    let b = fixture.commit(&[a], &[("g.txt", &numbered_lines(1..=2))], &[], "alice", EPOCH + DAY);
    fixture.set_head(b);

    let (plan, outcome) = run_analyses(
        &fixture,
        &["burndown"],
        FINE,
        None,
        HistoryOptions {
            head_only: true,
            ..Default::default()
        },
    );
    assert_eq!(plan.commit_count(), 1);
    assert_eq!(outcome.commit_count, 1);
    // HEAD's whole tree counts as inserted at once.
    let burndown: BurndownReport = decode(&outcome, "burndown");
    assert_eq!(final_alive_lines(&burndown), 7);
}

#[test]
fn first_parent_skips_the_side_branch() {
    let fixture = RepoFixture::new();
    let base = numbered_lines(1..=4);
    let a = fixture.commit(&[], &[("f.txt", &base)], &[], "alice", EPOCH);
    let b = fixture.commit(&[a], &[("g.txt", &numbered_lines(1..=2))], &[], "alice", EPOCH + DAY);
    let c = fixture.commit(&[a], &[("h.txt", &numbered_lines(1..=9))], &[], "bob", EPOCH + DAY);
    let d = fixture.commit(
        &[b, c],
        &[("h.txt", &numbered_lines(1..=9))],
        &[],
        "alice",
        EPOCH + 2 * DAY,
    );
    fixture.set_head(d);

    let (plan, outcome) = run_analyses(
        &fixture,
        &["burndown"],
        FINE,
        None,
        HistoryOptions {
            first_parent: true,
            ..Default::default()
        },
    );
    assert_eq!(plan.merges, 0, "first-parent history is linear");
    assert_eq!(outcome.commit_count, 3);
}
