use git2::Oid;
use smallvec::SmallVec;
use std::collections::{HashMap, HashSet};

use crate::commits::short_hash;

/// Index of a concurrent line of development inside a run-plan.
///
/// Branch indices are allocated by the planner, never reused, and are opaque
/// to analysis items. They are unrelated to VCS branch names.
pub type BranchIndex = u32;

// -------------------------------------------------------------------------------------------------
// Action
// -------------------------------------------------------------------------------------------------
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ActionKind {
    /// Create a branch at the start of a lineage.
    Emerge,
    /// Consume one commit on one branch.
    Commit,
    /// Split one branch's state into several.
    Fork,
    /// Reconcile several branches into the smallest incoming index.
    Merge,
    /// Retire a branch and drop its state.
    Delete,
    /// Spill an idle branch's state to the hibernation store.
    Hibernate,
    /// Restore a hibernated branch's state.
    Boot,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Action {
    pub kind: ActionKind,
    /// The commit consumed (`Commit`) or being merged (`Merge`).
    pub commit: Option<Oid>,
    /// For `Commit` actions, the merge commit this work eventually flows into,
    /// when traceback was requested and one exists.
    pub next_merge: Option<Oid>,
    /// Branch indices. `Commit`/`Emerge`/`Delete`/`Hibernate`/`Boot` carry one;
    /// `Fork` carries `[source, new...]`; `Merge` carries the merged set.
    pub branches: SmallVec<[BranchIndex; 2]>,
}

impl Action {
    pub fn commit_on(branch: BranchIndex, commit: Oid) -> Action {
        Action {
            kind: ActionKind::Commit,
            commit: Some(commit),
            next_merge: None,
            branches: SmallVec::from_slice(&[branch]),
        }
    }

    pub fn single(kind: ActionKind, branch: BranchIndex) -> Action {
        Action {
            kind,
            commit: None,
            next_merge: None,
            branches: SmallVec::from_slice(&[branch]),
        }
    }

    /// The short form shown by progress reporting: the abbreviated commit hash
    /// for `Commit`, the lowercase action name otherwise.
    pub fn label(&self) -> String {
        match self.kind {
            ActionKind::Commit => self
                .commit
                .map(|c| short_hash(&c))
                .unwrap_or_else(|| "commit".to_string()),
            ActionKind::Emerge => "emerge".to_string(),
            ActionKind::Fork => "fork".to_string(),
            ActionKind::Merge => "merge".to_string(),
            ActionKind::Delete => "delete".to_string(),
            ActionKind::Hibernate => "hibernate".to_string(),
            ActionKind::Boot => "boot".to_string(),
        }
    }
}

// -------------------------------------------------------------------------------------------------
// RunPlan
// -------------------------------------------------------------------------------------------------
/// A finite, ordered sequence of actions driving one engine run.
#[derive(Clone, Debug, Default)]
pub struct RunPlan {
    pub actions: Vec<Action>,
    /// Number of merge actions, for sizing hibernation-adjacent state.
    pub merges: usize,
}

impl RunPlan {
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn commit_count(&self) -> usize {
        self.actions
            .iter()
            .filter(|a| a.kind == ActionKind::Commit)
            .count()
    }

    /// Check the structural invariants of a plan. Used by tests and by the
    /// planner's own debug assertions; the error message names the first
    /// violation encountered.
    pub fn validate(&self) -> std::result::Result<(), String> {
        #[derive(PartialEq, Clone, Copy, Debug)]
        enum BranchState {
            Live,
            Hibernated,
            Retired,
        }
        let mut states: HashMap<BranchIndex, BranchState> = HashMap::new();
        let mut seen_commits: HashSet<Oid> = HashSet::new();

        let expect_live = |states: &HashMap<BranchIndex, BranchState>,
                           b: BranchIndex,
                           i: usize,
                           what: &str|
         -> std::result::Result<(), String> {
            match states.get(&b) {
                Some(BranchState::Live) => Ok(()),
                Some(other) => Err(format!("action {i}: {what} on {other:?} branch {b}")),
                None => Err(format!("action {i}: {what} on unknown branch {b}")),
            }
        };

        for (i, action) in self.actions.iter().enumerate() {
            match action.kind {
                ActionKind::Emerge => {
                    let b = action.branches[0];
                    if states.contains_key(&b) {
                        return Err(format!("action {i}: emerge of existing branch {b}"));
                    }
                    states.insert(b, BranchState::Live);
                }
                ActionKind::Commit => {
                    let b = action.branches[0];
                    expect_live(&states, b, i, "commit")?;
                    let c = action
                        .commit
                        .ok_or_else(|| format!("action {i}: commit without a commit id"))?;
                    seen_commits.insert(c);
                }
                ActionKind::Fork => {
                    let src = action.branches[0];
                    expect_live(&states, src, i, "fork")?;
                    for &b in &action.branches[1..] {
                        if states.contains_key(&b) {
                            return Err(format!("action {i}: fork recreates branch {b}"));
                        }
                        states.insert(b, BranchState::Live);
                    }
                }
                ActionKind::Merge => {
                    if action.branches.len() < 2 {
                        return Err(format!("action {i}: merge of fewer than two branches"));
                    }
                    for &b in &action.branches {
                        expect_live(&states, b, i, "merge")?;
                    }
                }
                ActionKind::Delete => {
                    let b = action.branches[0];
                    expect_live(&states, b, i, "delete")?;
                    states.insert(b, BranchState::Retired);
                }
                ActionKind::Hibernate => {
                    let b = action.branches[0];
                    expect_live(&states, b, i, "hibernate")?;
                    states.insert(b, BranchState::Hibernated);
                }
                ActionKind::Boot => {
                    let b = action.branches[0];
                    match states.get(&b) {
                        Some(BranchState::Hibernated) => {
                            states.insert(b, BranchState::Live);
                        }
                        other => {
                            return Err(format!("action {i}: boot of {other:?} branch {b}"));
                        }
                    }
                }
            }
        }

        // A hibernated branch must have been booted or deleted by plan end.
        for (b, state) in &states {
            if *state == BranchState::Hibernated {
                return Err(format!("branch {b} left hibernated at plan end"));
            }
        }
        Ok(())
    }
}
