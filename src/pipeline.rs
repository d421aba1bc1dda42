use git2::Oid;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error};

use crate::commits::{short_hash, CommitMeta};
use crate::errors::{Error, Result};
use crate::hibernation::{pack_states, unpack_states, HibernationStore};
use crate::item::{keys, AnalysisItem, Bag, CommitContext, Facts};
use crate::plan::{Action, ActionKind, BranchIndex, RunPlan};
use crate::report::Report;

// -------------------------------------------------------------------------------------------------
// CancellationToken
// -------------------------------------------------------------------------------------------------
/// Cooperative cancellation: the scheduler checks it at every action boundary
/// and returns with whatever aggregation completed.
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> CancellationToken {
        CancellationToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// `(step, total, label)` observer for progress reporting.
pub type ProgressObserver = Box<dyn FnMut(usize, usize, &str)>;

// -------------------------------------------------------------------------------------------------
// RunOutcome
// -------------------------------------------------------------------------------------------------
/// What a run produced: per-item results plus the common metadata every
/// report header carries.
pub struct RunOutcome {
    pub results: BTreeMap<String, Box<dyn Report>>,
    pub begin_tick: u32,
    pub end_tick: u32,
    pub commit_count: u64,
    pub elapsed: Duration,
    pub item_timings: BTreeMap<&'static str, Duration>,
    /// True when the run stopped at an action boundary because the
    /// cancellation token tripped; results hold the partial aggregation.
    pub cancelled: bool,
}

impl RunOutcome {
    fn empty() -> RunOutcome {
        RunOutcome {
            results: BTreeMap::new(),
            begin_tick: 0,
            end_tick: 0,
            commit_count: 0,
            elapsed: Duration::ZERO,
            item_timings: BTreeMap::new(),
            cancelled: false,
        }
    }
}

// -------------------------------------------------------------------------------------------------
// Pipeline
// -------------------------------------------------------------------------------------------------
/// The scheduler: owns every branch's ordered item instances, walks the
/// run-plan sequentially, and routes each commit through the items in
/// dependency order, folding their outputs into the per-commit bag.
pub struct Pipeline {
    pending: Vec<Box<dyn AnalysisItem>>,
    branches: HashMap<BranchIndex, Vec<Box<dyn AnalysisItem>>>,
    pristine: Vec<Box<dyn AnalysisItem>>,
    commits: HashMap<Oid, CommitMeta>,
    facts: Option<Facts>,
    observer: Option<ProgressObserver>,
    cancel: CancellationToken,
    dry_run: bool,
    store: HibernationStore,
    hibernation_fatal: bool,
    begin_tick: Option<u32>,
    end_tick: u32,
    item_timings: BTreeMap<&'static str, Duration>,
    initialised: bool,
}

impl Pipeline {
    /// Admit the given items. Admission is idempotent on name: a second item
    /// with an already-admitted name is dropped.
    pub fn new(items: Vec<Box<dyn AnalysisItem>>) -> Pipeline {
        let mut seen = std::collections::HashSet::new();
        let mut pending = Vec::with_capacity(items.len());
        for item in items {
            if seen.insert(item.name()) {
                pending.push(item);
            }
        }
        Pipeline {
            pending,
            branches: HashMap::new(),
            pristine: Vec::new(),
            commits: HashMap::new(),
            facts: None,
            observer: None,
            cancel: CancellationToken::new(),
            dry_run: false,
            store: HibernationStore::in_memory(),
            hibernation_fatal: false,
            begin_tick: None,
            end_tick: 0,
            item_timings: BTreeMap::new(),
            initialised: false,
        }
    }

    /// Walk plans without configuring or consuming; used by introspection
    /// paths that only want the plan trace.
    pub fn dry_run(&mut self, yes: bool) {
        self.dry_run = yes;
    }

    pub fn on_progress(&mut self, observer: ProgressObserver) {
        self.observer = Some(observer);
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn hibernate_with(&mut self, store: HibernationStore, fatal: bool) {
        self.store = store;
        self.hibernation_fatal = fatal;
    }

    /// Build the dependency order, configure every item, and initialise the
    /// root branch. Fails with `UnsatisfiedDependency` when a required key has
    /// no provider, `CyclicDependency` when no topological order exists, and
    /// whatever an item's own configuration rejects.
    pub fn initialise(&mut self, mut facts: Facts) -> Result<()> {
        if self.dry_run {
            self.initialised = true;
            return Ok(());
        }
        let mut items = std::mem::take(&mut self.pending);
        items = order_items(items)?;

        for item in &mut items {
            item.configure(&mut facts)?;
        }
        for item in &mut items {
            item.initialise(&facts)?;
        }

        self.commits = facts.commits.iter().map(|c| (c.id, c.clone())).collect();
        self.pristine = fork_all(&mut items);
        self.branches.insert(0, items);
        self.facts = Some(facts);
        self.initialised = true;
        Ok(())
    }

    pub fn facts(&self) -> Option<&Facts> {
        self.facts.as_ref()
    }

    fn observe(&mut self, step: usize, total: usize, label: &str) {
        if let Some(observer) = &mut self.observer {
            observer(step, total, label);
        }
    }

    /// Execute the plan and aggregate the results.
    pub fn run(&mut self, plan: &RunPlan) -> Result<RunOutcome> {
        if !self.initialised {
            return Err(Error::config("pipeline run before initialisation"));
        }
        let started = Instant::now();
        let total = plan.len() + 2;
        let mut outcome = RunOutcome::empty();

        for (i, action) in plan.actions.iter().enumerate() {
            if self.cancel.is_cancelled() {
                outcome.cancelled = true;
                break;
            }
            self.observe(i + 1, total, &action.label());
            if self.dry_run {
                continue;
            }
            self.execute(i, action)?;
        }

        if !outcome.cancelled {
            self.observe(total - 1, total, "finalize");
        }
        if !self.dry_run {
            outcome.results = self.finalise();
        }
        self.observe(total, total, "");

        outcome.begin_tick = self.begin_tick.unwrap_or(0);
        outcome.end_tick = self.end_tick;
        outcome.commit_count = plan.commit_count() as u64;
        outcome.elapsed = started.elapsed();
        outcome.item_timings = std::mem::take(&mut self.item_timings);
        Ok(outcome)
    }

    fn execute(&mut self, index: usize, action: &Action) -> Result<()> {
        match action.kind {
            ActionKind::Emerge => {
                let branch = action.branches[0];
                if !self.branches.contains_key(&branch) {
                    let fresh = fork_all(&mut self.pristine);
                    self.branches.insert(branch, fresh);
                }
            }
            ActionKind::Commit => {
                let commit = action.commit.expect("commit action carries its hash");
                self.consume_commit(action.branches[0], commit, index, action.next_merge, false)?;
            }
            ActionKind::Fork => {
                let source = action.branches[0];
                let fresh = action.branches.len() - 1;
                let items = self
                    .branches
                    .get_mut(&source)
                    .expect("fork of a live branch");
                let mut lists: Vec<Vec<Box<dyn AnalysisItem>>> =
                    (0..fresh).map(|_| Vec::with_capacity(items.len())).collect();
                for item in items.iter_mut() {
                    let forked = item.fork(fresh);
                    debug_assert_eq!(forked.len(), fresh);
                    for (slot, instance) in forked.into_iter().enumerate() {
                        lists[slot].push(instance);
                    }
                }
                for (slot, list) in lists.into_iter().enumerate() {
                    self.branches.insert(action.branches[slot + 1], list);
                }
            }
            ActionKind::Merge => {
                let commit = action.commit.expect("merge action carries its commit");
                // Replay the merge commit on every incoming branch, against
                // that branch's own predecessor snapshot. One-shot items sit
                // the replays out; they observe the merge commit at its own
                // commit action on the survivor, right after this merge.
                for &branch in &action.branches {
                    self.consume_commit(branch, commit, index, None, true)?;
                }
                let survivor = *action
                    .branches
                    .iter()
                    .min()
                    .expect("merge of at least two branches");
                let positions = self
                    .branches
                    .get(&survivor)
                    .map(|items| items.len())
                    .unwrap_or(0);
                let mut per_position: Vec<Vec<Box<dyn AnalysisItem>>> =
                    (0..positions).map(|_| Vec::new()).collect();
                for &branch in &action.branches {
                    if branch == survivor {
                        continue;
                    }
                    let donor = self
                        .branches
                        .get_mut(&branch)
                        .map(std::mem::take)
                        .unwrap_or_default();
                    for (position, instance) in donor.into_iter().enumerate() {
                        per_position[position].push(instance);
                    }
                }
                let items = self
                    .branches
                    .get_mut(&survivor)
                    .expect("survivor branch is live");
                for (position, donors) in per_position.into_iter().enumerate() {
                    items[position].merge(donors);
                }
            }
            ActionKind::Delete => {
                let branch = action.branches[0];
                self.store.discard(branch);
                if let Some(mut items) = self.branches.remove(&branch) {
                    for item in &mut items {
                        item.dispose();
                    }
                }
            }
            ActionKind::Hibernate => {
                let branch = action.branches[0];
                if let Err(e) = self.hibernate_branch(branch) {
                    if self.hibernation_fatal {
                        return Err(e);
                    }
                    error!("{e}; aborting branch {branch}");
                    self.branches.remove(&branch);
                }
            }
            ActionKind::Boot => {
                let branch = action.branches[0];
                if let Err(e) = self.boot_branch(branch) {
                    if self.hibernation_fatal {
                        return Err(e);
                    }
                    error!("{e}; aborting branch {branch}");
                    self.branches.remove(&branch);
                }
            }
        }
        Ok(())
    }

    fn consume_commit(
        &mut self,
        branch: BranchIndex,
        commit: Oid,
        sequence: usize,
        next_merge: Option<Oid>,
        replay: bool,
    ) -> Result<()> {
        let meta = self
            .commits
            .get(&commit)
            .ok_or_else(|| {
                Error::config(format!(
                    "plan references commit {} outside the collected set",
                    short_hash(&commit)
                ))
            })?
            .clone();
        let ctx = CommitContext {
            is_merge: meta.is_merge(),
            meta,
            branch,
            next_merge,
            sequence,
        };

        let items = self
            .branches
            .get_mut(&branch)
            .ok_or_else(|| Error::config(format!("commit on unknown branch {branch}")))?;
        let mut bag = Bag::new();
        for item in items.iter_mut() {
            if replay && item.one_shot_under_merges() {
                continue;
            }
            let t0 = Instant::now();
            let out = item.consume(&ctx, &bag).map_err(|e| match e {
                e @ Error::InvalidConfig(_) => e,
                e => Error::ItemFailure {
                    item: item.name().to_string(),
                    commit: ctx.meta.short_id(),
                    reason: e.to_string(),
                },
            })?;
            *self.item_timings.entry(item.name()).or_default() += t0.elapsed();
            if let Some(&tick) = out.get::<u32>(keys::TICK) {
                self.begin_tick = Some(self.begin_tick.map_or(tick, |b| b.min(tick)));
                self.end_tick = self.end_tick.max(tick);
            }
            bag.absorb(out);
        }
        Ok(())
    }

    fn hibernate_branch(&mut self, branch: BranchIndex) -> Result<()> {
        let items = match self.branches.get_mut(&branch) {
            Some(items) => items,
            None => return Ok(()),
        };
        let mut states: Vec<(String, Vec<u8>)> = Vec::new();
        for item in items.iter_mut() {
            if let Some(bytes) = item.hibernate()? {
                states.push((item.name().to_string(), bytes));
            }
        }
        if states.is_empty() {
            return Ok(());
        }
        let packed = pack_states(&states, branch)?;
        self.store.save(branch, packed)?;
        debug!("branch {branch} hibernated ({} item states)", states.len());
        Ok(())
    }

    fn boot_branch(&mut self, branch: BranchIndex) -> Result<()> {
        if !self.store.holds(branch) {
            // Hibernate had nothing to spill; boot is the matching no-op.
            return Ok(());
        }
        let buffer = self.store.load(branch)?;
        let states = unpack_states(buffer.as_ref(), branch)?;
        let items = match self.branches.get_mut(&branch) {
            Some(items) => items,
            None => return Ok(()),
        };
        for (name, bytes) in states {
            let item = items
                .iter_mut()
                .find(|i| i.name() == name)
                .ok_or_else(|| Error::Hibernation {
                    branch,
                    reason: format!("image names unknown item `{name}`"),
                })?;
            item.boot(&bytes)?;
        }
        Ok(())
    }

    /// Merge any branches still alive at plan end into the lowest index, then
    /// collect every leaf's report.
    fn finalise(&mut self) -> BTreeMap<String, Box<dyn Report>> {
        let mut live: Vec<BranchIndex> = self.branches.keys().copied().collect();
        live.sort_unstable();
        let survivor = match live.first() {
            Some(&b) => b,
            None => return BTreeMap::new(),
        };
        if live.len() > 1 {
            let positions = self.branches[&survivor].len();
            let mut per_position: Vec<Vec<Box<dyn AnalysisItem>>> =
                (0..positions).map(|_| Vec::new()).collect();
            for &branch in &live[1..] {
                let donor = self
                    .branches
                    .remove(&branch)
                    .expect("live branch has items");
                for (position, instance) in donor.into_iter().enumerate() {
                    per_position[position].push(instance);
                }
            }
            let items = self
                .branches
                .get_mut(&survivor)
                .expect("survivor branch is live");
            for (position, donors) in per_position.into_iter().enumerate() {
                items[position].merge(donors);
            }
        }

        let mut results = BTreeMap::new();
        if let Some(items) = self.branches.get_mut(&survivor) {
            for item in items.iter_mut() {
                let t0 = Instant::now();
                if let Some(report) = item.finalise() {
                    results.insert(item.name().to_string(), report);
                }
                *self.item_timings.entry(item.name()).or_default() += t0.elapsed();
            }
        }
        results
    }
}

fn fork_all(items: &mut [Box<dyn AnalysisItem>]) -> Vec<Box<dyn AnalysisItem>> {
    items
        .iter_mut()
        .map(|item| {
            item.fork(1)
                .pop()
                .expect("fork(1) yields exactly one instance")
        })
        .collect()
}

/// Topologically order items by their bag-key dependencies. Ties go to the
/// earlier-listed item, so the order is stable across runs.
fn order_items(items: Vec<Box<dyn AnalysisItem>>) -> Result<Vec<Box<dyn AnalysisItem>>> {
    let mut provider_of: HashMap<&'static str, usize> = HashMap::new();
    for (index, item) in items.iter().enumerate() {
        for &key in item.provides() {
            if let Some(&existing) = provider_of.get(key) {
                return Err(Error::config(format!(
                    "both `{}` and `{}` provide `{key}`",
                    items[existing].name(),
                    item.name()
                )));
            }
            provider_of.insert(key, index);
        }
    }

    let mut dependants: Vec<Vec<usize>> = vec![Vec::new(); items.len()];
    let mut in_degree: Vec<usize> = vec![0; items.len()];
    for (index, item) in items.iter().enumerate() {
        for &key in item.requires() {
            let provider = *provider_of.get(key).ok_or_else(|| {
                Error::UnsatisfiedDependency {
                    item: item.name().to_string(),
                    key: key.to_string(),
                }
            })?;
            dependants[provider].push(index);
            in_degree[index] += 1;
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, &d)| d == 0)
        .map(|(i, _)| Reverse(i))
        .collect();
    let mut order: Vec<usize> = Vec::with_capacity(items.len());
    while let Some(Reverse(index)) = ready.pop() {
        order.push(index);
        for &next in &dependants[index] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.push(Reverse(next));
            }
        }
    }
    if order.len() != items.len() {
        let stuck = in_degree
            .iter()
            .position(|&d| d > 0)
            .expect("cycle leaves positive in-degrees");
        return Err(Error::CyclicDependency(items[stuck].name().to_string()));
    }

    let mut slots: Vec<Option<Box<dyn AnalysisItem>>> = items.into_iter().map(Some).collect();
    Ok(order
        .into_iter()
        .map(|i| slots[i].take().expect("each item placed once"))
        .collect())
}
