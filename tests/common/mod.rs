//! Shared fixtures: throwaway repositories with hand-built commit graphs.

#![allow(dead_code)]

use git2::{Oid, Repository, Signature, Time};
use std::path::Path;
use std::rc::Rc;
use tempfile::TempDir;

use strata::commits::{collect_history, HistoryOptions};
use strata::item::{Facts, OptionValue};
use strata::pipeline::{Pipeline, RunOutcome};
use strata::plan::RunPlan;
use strata::planner::{build_plan, PlannerOptions};
use strata::registry::Registry;

pub struct RepoFixture {
    pub dir: TempDir,
    pub repo: Repository,
}

impl RepoFixture {
    pub fn new() -> RepoFixture {
        let dir = TempDir::new().expect("temp dir");
        let repo = Repository::init(dir.path()).expect("repository init");
        RepoFixture { dir, repo }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Create a commit: parent 0's tree plus `writes`, minus `removes`.
    /// Paths are root-level names (the fixtures never need directories).
    pub fn commit(
        &self,
        parents: &[Oid],
        writes: &[(&str, &[u8])],
        removes: &[&str],
        author: &str,
        when: i64,
    ) -> Oid {
        let base_tree = parents.first().map(|&p| {
            self.repo
                .find_commit(p)
                .expect("parent commit")
                .tree()
                .expect("parent tree")
        });
        let mut builder = self
            .repo
            .treebuilder(base_tree.as_ref())
            .expect("tree builder");
        for (path, content) in writes {
            let blob = self.repo.blob(content).expect("blob write");
            builder.insert(*path, blob, 0o100644).expect("tree insert");
        }
        for path in removes {
            builder.remove(*path).expect("tree remove");
        }
        let tree_id = builder.write().expect("tree write");
        let tree = self.repo.find_tree(tree_id).expect("tree lookup");

        let sig = Signature::new(author, &format!("{author}@example.com"), &Time::new(when, 0))
            .expect("signature");
        let parent_commits: Vec<git2::Commit<'_>> = parents
            .iter()
            .map(|&p| self.repo.find_commit(p).expect("parent commit"))
            .collect();
        let parent_refs: Vec<&git2::Commit<'_>> = parent_commits.iter().collect();
        self.repo
            .commit(None, &sig, &sig, "change", &tree, &parent_refs)
            .expect("commit")
    }

    pub fn set_head(&self, oid: Oid) {
        self.repo.set_head_detached(oid).expect("detach head");
    }
}

/// Distinct numbered lines; the standard fixture file body.
pub fn numbered_lines(range: std::ops::RangeInclusive<u32>) -> Vec<u8> {
    range
        .map(|i| format!("line number {i}\n"))
        .collect::<String>()
        .into_bytes()
}

pub const DAY: i64 = 24 * 60 * 60;
pub const EPOCH: i64 = 1_600_000_000;

/// Drive the whole engine over the fixture's history.
pub fn run_analyses(
    fixture: &RepoFixture,
    selected: &[&str],
    options: &[(&str, OptionValue)],
    hibernation_distance: Option<usize>,
    history: HistoryOptions,
) -> (RunPlan, RunOutcome) {
    let repo = Repository::open(fixture.path()).expect("open fixture repository");
    let commits = collect_history(&repo, history).expect("collect history");
    let plan = build_plan(
        &commits,
        &PlannerOptions {
            traceback_merges: true,
            hibernation_distance,
        },
    );
    let items = Registry::builtin().resolve(selected).expect("resolve items");

    let mut facts = Facts::new(commits);
    facts.repository_uri = fixture.path().display().to_string();
    facts.repository = Some(Rc::new(repo));
    for (name, value) in options {
        facts.options.insert(name.to_string(), value.clone());
    }

    let mut pipeline = Pipeline::new(items);
    pipeline.initialise(facts).expect("pipeline initialise");
    let outcome = pipeline.run(&plan).expect("pipeline run");
    (plan, outcome)
}
