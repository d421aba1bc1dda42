use git2::{Oid, Repository, Sort};
use smallvec::SmallVec;
use std::collections::HashMap;
use tracing::debug;

use crate::errors::Result;

// -------------------------------------------------------------------------------------------------
// CommitMeta
// -------------------------------------------------------------------------------------------------
/// The slice of a commit the engine needs, extracted up front so that the
/// planner and scheduler never hold libgit2 objects.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitMeta {
    pub id: Oid,
    /// Parent ids in first-parent order, deduplicated.
    pub parents: SmallVec<[Oid; 2]>,
    pub tree: Oid,
    pub author_name: String,
    pub author_email: String,
    /// Author timestamp, seconds since the UNIX epoch, UTC.
    pub when: i64,
}

impl CommitMeta {
    pub fn is_merge(&self) -> bool {
        self.parents.len() > 1
    }

    /// The seven-character abbreviated hash used in progress and report output.
    pub fn short_id(&self) -> String {
        short_hash(&self.id)
    }
}

pub fn short_hash(oid: &Oid) -> String {
    let mut s = oid.to_string();
    s.truncate(7);
    s
}

fn meta_of(commit: &git2::Commit<'_>) -> CommitMeta {
    let author = commit.author();
    let mut parents: SmallVec<[Oid; 2]> = SmallVec::new();
    for p in commit.parent_ids() {
        if !parents.contains(&p) {
            parents.push(p);
        }
    }
    CommitMeta {
        id: commit.id(),
        parents,
        tree: commit.tree_id(),
        author_name: author.name().unwrap_or("").to_string(),
        author_email: author.email().unwrap_or("").to_string(),
        when: author.when().seconds(),
    }
}

// -------------------------------------------------------------------------------------------------
// history collection
// -------------------------------------------------------------------------------------------------
/// How much of the history to collect.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HistoryOptions {
    /// Follow only the first parent of each commit.
    pub first_parent: bool,
    /// Collect only the HEAD commit.
    pub head_only: bool,
}

/// Collect the commits reachable from HEAD, honouring `options`.
///
/// Parent lists are kept as recorded on each commit; parents that fall outside
/// the collected set are truncated later, by the DAG builder.
pub fn collect_history(repo: &Repository, options: HistoryOptions) -> Result<Vec<CommitMeta>> {
    let head = repo.head()?.peel_to_commit()?;
    if options.head_only {
        return Ok(vec![meta_of(&head)]);
    }

    let mut walk = repo.revwalk()?;
    walk.set_sorting(Sort::TOPOLOGICAL)?;
    if options.first_parent {
        walk.simplify_first_parent()?;
    }
    walk.push(head.id())?;

    let mut commits = Vec::new();
    for oid in walk {
        let oid = oid?;
        let commit = repo.find_commit(oid)?;
        let mut meta = meta_of(&commit);
        if options.first_parent {
            meta.parents.truncate(1);
        }
        commits.push(meta);
    }
    debug!("collected {} commits from {}", commits.len(), head.id());
    Ok(commits)
}

/// Index a commit list by id.
pub fn index_commits(commits: &[CommitMeta]) -> HashMap<Oid, CommitMeta> {
    commits.iter().map(|c| (c.id, c.clone())).collect()
}
