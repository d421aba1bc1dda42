use git2::Oid;
use smallvec::SmallVec;
use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::debug;

use crate::commits::CommitMeta;
use crate::dag::CommitDag;
use crate::plan::{Action, ActionKind, BranchIndex, RunPlan};

// -------------------------------------------------------------------------------------------------
// PlannerOptions
// -------------------------------------------------------------------------------------------------
#[derive(Clone, Debug, Default)]
pub struct PlannerOptions {
    /// Record on every commit the merge commit its work eventually flows into.
    pub traceback_merges: bool,
    /// When set, insert hibernate/boot pairs around branch idle stretches
    /// longer than this many actions.
    pub hibernation_distance: Option<usize>,
}

/// Linearise a commit set into a run-plan.
///
/// Only the largest weakly-connected component is planned; linear chains are
/// coalesced before the topological walk so the branch-assignment pass scales
/// with the number of forks and merges rather than the number of commits.
pub fn build_plan(commits: &[CommitMeta], options: &PlannerOptions) -> RunPlan {
    let dag = CommitDag::build(commits).keep_root_component();
    if dag.is_empty() {
        return RunPlan::default();
    }
    let chains = dag.coalesce();
    let order = chains.topo_order();

    let mut emit = Emitter {
        dag: &dag,
        actions: Vec::with_capacity(dag.len() + chains.len()),
        merges: 0,
        next_branch: 0,
        branch_at_tip: HashMap::new(),
        fork_queues: HashMap::new(),
    };

    for chain_idx in order {
        let chain = chains.chain(chain_idx);
        let first = chain.commits[0];
        let parents = emit.dag.parents_of(first);

        let branch = match parents.len() {
            0 => {
                let b = emit.alloc();
                emit.actions.push(Action::single(ActionKind::Emerge, b));
                b
            }
            1 => emit.claim(parents[0]),
            _ => {
                let mut incoming: Vec<BranchIndex> =
                    parents.iter().map(|&p| emit.claim(p)).collect();
                incoming.sort_unstable();
                incoming.dedup();
                if incoming.len() == 1 {
                    incoming[0]
                } else {
                    emit.merges += 1;
                    emit.actions.push(Action {
                        kind: ActionKind::Merge,
                        commit: Some(first),
                        next_merge: None,
                        branches: SmallVec::from_vec(incoming.clone()),
                    });
                    incoming[0]
                }
            }
        };

        for &c in &chain.commits {
            emit.actions.push(Action::commit_on(branch, c));
        }
        emit.branch_at_tip
            .insert(*chain.commits.last().expect("chain is non-empty"), branch);
    }
    let Emitter {
        mut actions, merges, ..
    } = emit;

    garbage_collect_branches(&mut actions);
    if options.traceback_merges {
        assign_traceback_merges(&mut actions);
    }
    if let Some(distance) = options.hibernation_distance {
        insert_hibernations(&mut actions, distance);
    }

    let plan = RunPlan { actions, merges };
    debug!(
        "planned {} actions over {} commits, {} merges",
        plan.len(),
        plan.commit_count(),
        plan.merges
    );
    debug_assert_eq!(plan.validate(), Ok(()));
    plan
}

/// The branch-assignment walker: tracks which branch sits at each chain tip
/// and which indices a fork has pre-allocated for its pending children.
struct Emitter<'a> {
    dag: &'a CommitDag,
    actions: Vec<Action>,
    merges: usize,
    next_branch: BranchIndex,
    branch_at_tip: HashMap<Oid, BranchIndex>,
    fork_queues: HashMap<Oid, VecDeque<BranchIndex>>,
}

impl Emitter<'_> {
    fn alloc(&mut self) -> BranchIndex {
        let b = self.next_branch;
        self.next_branch += 1;
        b
    }

    /// Claim the branch on which a child of `parent` continues. The first
    /// child keeps the parent's branch; the fork emitted just before it
    /// allocates the indices the remaining children will claim.
    fn claim(&mut self, parent: Oid) -> BranchIndex {
        let kids = self.dag.child_count(parent);
        if kids <= 1 {
            return self.branch_at_tip[&parent];
        }
        if let Some(queue) = self.fork_queues.get_mut(&parent) {
            return queue.pop_front().expect("fork queue exhausted");
        }
        let src = self.branch_at_tip[&parent];
        let fresh: Vec<BranchIndex> = (0..kids - 1).map(|_| self.alloc()).collect();
        let mut branches: SmallVec<[BranchIndex; 2]> = SmallVec::from_slice(&[src]);
        branches.extend_from_slice(&fresh);
        self.actions.push(Action {
            kind: ActionKind::Fork,
            commit: None,
            next_merge: None,
            branches,
        });
        self.fork_queues.insert(parent, fresh.into());
        src
    }
}

// -------------------------------------------------------------------------------------------------
// plan passes
// -------------------------------------------------------------------------------------------------
/// Insert `Delete` actions for branches consumed by a merge, right after that
/// merge. Branches still holding state at plan end (the result lineages) are
/// left alive for finalisation.
fn garbage_collect_branches(actions: &mut Vec<Action>) {
    let mut last_use: HashMap<BranchIndex, usize> = HashMap::new();
    for (i, action) in actions.iter().enumerate() {
        for &b in &action.branches {
            last_use.insert(b, i);
        }
    }

    let mut deletes: BTreeMap<usize, Vec<BranchIndex>> = BTreeMap::new();
    for (i, action) in actions.iter().enumerate() {
        if action.kind != ActionKind::Merge {
            continue;
        }
        for &b in &action.branches[1..] {
            if last_use[&b] == i {
                deletes.entry(i).or_default().push(b);
            }
        }
    }
    if deletes.is_empty() {
        return;
    }

    let mut rebuilt = Vec::with_capacity(actions.len() + deletes.len());
    for (i, action) in actions.drain(..).enumerate() {
        rebuilt.push(action);
        if let Some(branches) = deletes.get(&i) {
            let mut branches = branches.clone();
            branches.sort_unstable();
            for b in branches {
                rebuilt.push(Action::single(ActionKind::Delete, b));
            }
        }
    }
    *actions = rebuilt;
}

/// Walk the plan backward and record on each commit the nearest later merge
/// commit consuming its branch.
fn assign_traceback_merges(actions: &mut [Action]) {
    let mut next_merge: HashMap<BranchIndex, Oid> = HashMap::new();
    for action in actions.iter_mut().rev() {
        match action.kind {
            ActionKind::Merge => {
                let m = action.commit.expect("merge carries its commit");
                for &b in &action.branches {
                    next_merge.insert(b, m);
                }
            }
            ActionKind::Commit => {
                action.next_merge = next_merge.get(&action.branches[0]).copied();
            }
            ActionKind::Fork => {
                // The new branches are born here; nothing earlier can refer
                // to them. The source keeps the pointer established by its
                // own later commits.
                for &b in &action.branches[1..] {
                    next_merge.remove(&b);
                }
            }
            _ => {}
        }
    }
}

/// Insert hibernate/boot pairs around idle stretches: a branch unused for more
/// than `distance` actions (with at least one intervening action) is spilled
/// after its last use and restored just before the next one. Stretches ending
/// in the branch's deletion are left alone.
fn insert_hibernations(actions: &mut Vec<Action>, distance: usize) {
    let mut uses: BTreeMap<BranchIndex, Vec<usize>> = BTreeMap::new();
    for (i, action) in actions.iter().enumerate() {
        for &b in &action.branches {
            uses.entry(b).or_default().push(i);
        }
    }

    let mut spill_after: BTreeMap<usize, Vec<BranchIndex>> = BTreeMap::new();
    let mut restore_before: BTreeMap<usize, Vec<BranchIndex>> = BTreeMap::new();
    for (&b, idxs) in &uses {
        for pair in idxs.windows(2) {
            let (i, j) = (pair[0], pair[1]);
            if j - i > distance.max(1) && actions[j].kind != ActionKind::Delete {
                spill_after.entry(i).or_default().push(b);
                restore_before.entry(j).or_default().push(b);
            }
        }
    }
    if spill_after.is_empty() {
        return;
    }

    let mut rebuilt = Vec::with_capacity(actions.len() + spill_after.len() * 2);
    for (i, action) in actions.drain(..).enumerate() {
        if let Some(branches) = restore_before.get(&i) {
            for &b in branches {
                rebuilt.push(Action::single(ActionKind::Boot, b));
            }
        }
        rebuilt.push(action);
        if let Some(branches) = spill_after.get(&i) {
            for &b in branches {
                rebuilt.push(Action::single(ActionKind::Hibernate, b));
            }
        }
    }
    *actions = rebuilt;
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::plan::ActionKind::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn oid(n: u8) -> Oid {
        Oid::from_bytes(&[n; 20]).unwrap()
    }

    fn meta(id: u8, parents: &[u8]) -> CommitMeta {
        CommitMeta {
            id: oid(id),
            parents: parents.iter().map(|&p| oid(p)).collect(),
            tree: Oid::zero(),
            author_name: String::new(),
            author_email: String::new(),
            when: 0,
        }
    }

    fn kinds(plan: &RunPlan) -> Vec<ActionKind> {
        plan.actions.iter().map(|a| a.kind).collect()
    }

    #[test]
    fn linear_chain_plan() {
        // A -> B -> C
        let commits = vec![meta(1, &[]), meta(2, &[1]), meta(3, &[2])];
        let plan = build_plan(&commits, &PlannerOptions::default());
        assert_eq!(kinds(&plan), vec![Emerge, Commit, Commit, Commit]);
        assert!(plan.actions[1..].iter().all(|a| a.branches[0] == 0));
        assert_eq!(plan.merges, 0);
        assert_eq!(plan.validate(), Ok(()));
    }

    #[test]
    fn diamond_plan() {
        // A -> B, A -> C, {B, C} -> D
        let commits = vec![meta(1, &[]), meta(2, &[1]), meta(3, &[1]), meta(4, &[2, 3])];
        let plan = build_plan(&commits, &PlannerOptions::default());
        assert_eq!(plan.validate(), Ok(()));
        assert_eq!(plan.merges, 1);
        assert_eq!(
            kinds(&plan),
            vec![Emerge, Commit, Fork, Commit, Commit, Merge, Commit, Delete]
        );
        let fork = &plan.actions[2];
        assert_eq!(fork.branches.as_slice(), &[0, 1]);
        let merge = &plan.actions[5];
        assert_eq!(merge.branches.as_slice(), &[0, 1]);
        assert_eq!(merge.commit, Some(oid(4)));
        // The merge commit lands on the smallest incoming branch.
        assert_eq!(plan.actions[6], Action::commit_on(0, oid(4)));
        // The consumed branch is retired right after the merge.
        assert_eq!(plan.actions[7], Action::single(Delete, 1));
    }

    #[test]
    fn traceback_assigns_next_merge() {
        let commits = vec![meta(1, &[]), meta(2, &[1]), meta(3, &[1]), meta(4, &[2, 3])];
        let plan = build_plan(
            &commits,
            &PlannerOptions {
                traceback_merges: true,
                ..Default::default()
            },
        );
        for action in &plan.actions {
            if action.kind == Commit && action.commit != Some(oid(4)) {
                assert_eq!(action.next_merge, Some(oid(4)), "{action:?}");
            }
            if action.commit == Some(oid(4)) && action.kind == Commit {
                assert_eq!(action.next_merge, None);
            }
        }
    }

    #[test]
    fn hibernation_wraps_idle_stretch() {
        // A diamond with distance 0 hibernates the idle side branch.
        let commits = vec![meta(1, &[]), meta(2, &[1]), meta(3, &[1]), meta(4, &[2, 3])];
        let plan = build_plan(
            &commits,
            &PlannerOptions {
                hibernation_distance: Some(0),
                ..Default::default()
            },
        );
        assert_eq!(plan.validate(), Ok(()));
        let hibernates: Vec<_> = plan
            .actions
            .iter()
            .filter(|a| a.kind == Hibernate)
            .collect();
        assert!(!hibernates.is_empty(), "{:?}", kinds(&plan));
        // Every hibernate is followed by a boot on the same branch before the
        // branch's next commit (validate() checks the full protocol).
        let boots = plan.actions.iter().filter(|a| a.kind == Boot).count();
        assert_eq!(hibernates.len(), boots);
    }

    #[test]
    fn multi_way_fork_and_merge() {
        // 1 fans out to 2, 3, 4; all merge into 5.
        let commits = vec![
            meta(1, &[]),
            meta(2, &[1]),
            meta(3, &[1]),
            meta(4, &[1]),
            meta(5, &[2, 3, 4]),
        ];
        let plan = build_plan(&commits, &PlannerOptions::default());
        assert_eq!(plan.validate(), Ok(()));
        let fork = plan
            .actions
            .iter()
            .find(|a| a.kind == Fork)
            .expect("plan has a fork");
        assert_eq!(fork.branches.len(), 3);
        let merge = plan
            .actions
            .iter()
            .find(|a| a.kind == Merge)
            .expect("plan has a merge");
        assert_eq!(merge.branches.as_slice(), &[0, 1, 2]);
        // Both consumed branches retired after the merge.
        let deletes: Vec<_> = plan.actions.iter().filter(|a| a.kind == Delete).collect();
        assert_eq!(deletes.len(), 2);
    }

    #[test]
    fn second_component_is_dropped() {
        let commits = vec![meta(1, &[]), meta(2, &[1]), meta(7, &[]), meta(8, &[7]), meta(9, &[8])];
        // component {7,8,9} is larger and wins
        let plan = build_plan(&commits, &PlannerOptions::default());
        assert_eq!(plan.commit_count(), 3);
        let planned: Vec<Oid> = plan.actions.iter().filter_map(|a| a.commit).collect();
        assert!(planned.contains(&oid(7)));
        assert!(!planned.contains(&oid(1)));
    }

    #[test]
    fn empty_input_yields_empty_plan() {
        let plan = build_plan(&[], &PlannerOptions::default());
        assert!(plan.is_empty());
    }

    /// Each branch's restricted action sequence must open with its birth
    /// (emerge, or the fork that created it) and only then commit.
    fn check_branch_lifecycles(plan: &RunPlan) {
        use std::collections::HashSet;
        let mut born: HashSet<BranchIndex> = HashSet::new();
        for action in &plan.actions {
            match action.kind {
                Emerge => {
                    assert!(born.insert(action.branches[0]));
                }
                Fork => {
                    assert!(born.contains(&action.branches[0]));
                    for &b in &action.branches[1..] {
                        assert!(born.insert(b));
                    }
                }
                _ => {
                    for &b in &action.branches {
                        assert!(born.contains(&b), "use of unborn branch {b}");
                    }
                }
            }
        }
    }

    proptest! {
        /// Random DAGs: the plan always validates, covers the retained
        /// component exactly once per commit, and respects branch lifecycles.
        #[test]
        fn random_dags_produce_valid_plans(
            parent_picks in proptest::collection::vec((0usize..100, 0usize..100), 1..40),
            hibernation in proptest::option::of(0usize..4),
        ) {
            let n = parent_picks.len();
            let mut commits = Vec::with_capacity(n);
            for (i, &(p1, p2)) in parent_picks.iter().enumerate() {
                let mut parents: Vec<u8> = Vec::new();
                if i > 0 {
                    let a = (p1 % i) as u8 + 1;
                    let b = (p2 % i) as u8 + 1;
                    parents.push(a);
                    if b != a && p2 % 3 == 0 {
                        parents.push(b);
                    }
                }
                commits.push(meta(i as u8 + 1, &parents));
            }
            let options = PlannerOptions {
                traceback_merges: true,
                hibernation_distance: hibernation,
            };
            let plan = build_plan(&commits, &options);
            prop_assert_eq!(plan.validate(), Ok(()));
            check_branch_lifecycles(&plan);

            // Every planned commit is unique.
            let mut seen = std::collections::HashSet::new();
            for action in &plan.actions {
                if action.kind == Commit {
                    prop_assert!(seen.insert(action.commit.unwrap()));
                }
            }
            // The retained component is planned in full: the component always
            // contains commit 1's lineage or a larger one, never nothing.
            prop_assert!(plan.commit_count() > 0);
        }
    }
}
