use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use similar::{capture_diff_slices_deadline, Algorithm, DiffOp};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::{error, warn};

use crate::blobs::{hash_lines, BlobFacts};
use crate::errors::{Error, Result};
use crate::extractor::{ExtractorRegistry, Selector, SyntaxNode};
use crate::identity::MISSING_AUTHOR;
use crate::item::{keys, AnalysisItem, Bag, CommitContext, Facts, ItemOption, Key, OptionValue};
use crate::line_index::{LineIndex, LineTag};
use crate::tree_changes::{ChangeEntry, TreeChange};

/// Stable identifier of a path within one engine run; renames preserve it.
pub type FileId = u32;

/// The in-index tag of lines written by a merge commit during per-branch
/// replay, resolved away when the branches reconcile.
pub const MERGE_MARK_AUTHOR: i32 = i32::MIN;

/// `prev` tag of a pure insertion.
pub const MISSING_TAG: LineTag = LineTag {
    author: MISSING_AUTHOR,
    tick: 0,
};

/// Default per-file diff budget, in milliseconds.
pub const DIFF_BUDGET_MS: i64 = 1000;

// -------------------------------------------------------------------------------------------------
// LineChange
// -------------------------------------------------------------------------------------------------
/// One attribution delta: `delta > 0` lines written by `curr`, `delta < 0`
/// lines previously attributed to `prev` removed by `curr`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct LineChange {
    pub file: FileId,
    pub prev: LineTag,
    pub curr: LineTag,
    pub delta: i64,
}

/// Full live-line census `(tag, lines)`, emitted once right after a merge so
/// accumulating analyses can rebase instead of double counting replayed work.
pub type LineCensus = Vec<(LineTag, i64)>;

// -------------------------------------------------------------------------------------------------
// FileIdRegistry
// -------------------------------------------------------------------------------------------------
/// Run-global path→id allocation, shared by every branch instance of the
/// engine so ids agree across forks.
#[derive(Default)]
pub struct FileIdRegistry {
    by_path: HashMap<String, FileId>,
    next: FileId,
}

impl FileIdRegistry {
    pub fn id_of(&mut self, path: &str) -> FileId {
        if let Some(&id) = self.by_path.get(path) {
            return id;
        }
        let id = self.next;
        self.next += 1;
        self.by_path.insert(path.to_string(), id);
        id
    }

    /// Bind a renamed path to the file's existing id.
    pub fn alias(&mut self, path: &str, id: FileId) {
        self.by_path.insert(path.to_string(), id);
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct FileRecord {
    id: FileId,
    path: String,
    index: LineIndex,
    /// Global sequence number of the file's latest rename; merges keep the
    /// newest name.
    name_seq: u64,
}

/// Hibernation image of the branch state. Ordered maps so a
/// hibernate/boot/hibernate cycle is byte-identical.
#[derive(Serialize, Deserialize)]
struct HibernatedState {
    files: BTreeMap<FileId, FileRecord>,
    by_path: BTreeMap<String, FileId>,
}

// -------------------------------------------------------------------------------------------------
// diff plans
// -------------------------------------------------------------------------------------------------
struct DiffPlan {
    ops: Vec<DiffOp>,
    new_hashes: Vec<u64>,
    timed_out: bool,
}

fn diff_blobs(from: &BlobFacts, to: &BlobFacts, ignore_ws: bool, budget: Duration) -> DiffPlan {
    let old_hashes = hash_lines(&from.bytes, ignore_ws);
    let new_hashes = hash_lines(&to.bytes, ignore_ws);
    let started = Instant::now();
    let deadline = if budget.is_zero() {
        None
    } else {
        Some(started + budget)
    };
    let ops = capture_diff_slices_deadline(Algorithm::Myers, &old_hashes, &new_hashes, deadline);
    let timed_out = !budget.is_zero() && started.elapsed() >= budget;
    DiffPlan {
        ops,
        new_hashes,
        timed_out,
    }
}

/// Shift insertion boundaries sliding inside adjacent equal runs so that as
/// many syntactic regions as possible fall wholly inside the insertion. The
/// file content is unchanged by construction (the slid lines hash equal);
/// only the attribution boundary moves.
fn refine_insert_boundaries(
    mut ops: Vec<DiffOp>,
    new_hashes: &[u64],
    nodes: &[SyntaxNode],
) -> Vec<DiffOp> {
    if nodes.is_empty() {
        return ops;
    }
    for i in 0..ops.len() {
        let (old_index, new_index, new_len) = match ops[i] {
            DiffOp::Insert {
                old_index,
                new_index,
                new_len,
            } if new_len > 0 => (old_index, new_index, new_len),
            _ => continue,
        };
        let prev_equal = match i.checked_sub(1).map(|j| ops[j]) {
            Some(DiffOp::Equal { len, .. }) => len,
            _ => 0,
        };
        let next_equal = match ops.get(i + 1) {
            Some(DiffOp::Equal { len, .. }) => *len,
            _ => 0,
        };

        let mut max_left = 0usize;
        while max_left < prev_equal
            && max_left < new_index
            && new_hashes[new_index - max_left - 1] == new_hashes[new_index + new_len - max_left - 1]
        {
            max_left += 1;
        }
        let mut max_right = 0usize;
        while max_right < next_equal
            && new_index + new_len + max_right < new_hashes.len()
            && new_hashes[new_index + max_right] == new_hashes[new_index + new_len + max_right]
        {
            max_right += 1;
        }
        if max_left == 0 && max_right == 0 {
            continue;
        }

        let contained = |offset: i64| -> usize {
            let start = (new_index as i64 + offset) as u32 + 1; // 1-based
            let end = start + new_len as u32; // exclusive
            nodes.iter().filter(|n| n.within_lines(start, end)).count()
        };
        let mut best_offset = 0i64;
        let mut best_score = contained(0);
        for offset in -(max_left as i64)..=(max_right as i64) {
            let score = contained(offset);
            if score > best_score
                || (score == best_score && offset.abs() < best_offset.abs())
            {
                best_score = score;
                best_offset = offset;
            }
        }
        if best_offset == 0 {
            continue;
        }

        let shift = best_offset;
        ops[i] = DiffOp::Insert {
            old_index: (old_index as i64 + shift) as usize,
            new_index: (new_index as i64 + shift) as usize,
            new_len,
        };
        if let Some(DiffOp::Equal {
            old_index,
            new_index,
            len,
        }) = i.checked_sub(1).map(|j| ops[j])
        {
            ops[i - 1] = DiffOp::Equal {
                old_index,
                new_index,
                len: (len as i64 + shift) as usize,
            };
        }
        if let Some(&DiffOp::Equal {
            old_index,
            new_index,
            len,
        }) = ops.get(i + 1)
        {
            ops[i + 1] = DiffOp::Equal {
                old_index: (old_index as i64 + shift) as usize,
                new_index: (new_index as i64 + shift) as usize,
                len: (len as i64 - shift) as usize,
            };
        }
    }
    ops
}

// -------------------------------------------------------------------------------------------------
// LineHistoryItem
// -------------------------------------------------------------------------------------------------
/// The line-attribution engine: for every live file on the branch, an interval
/// map of `(author, tick)` tags, advanced by each commit's tree changes and
/// publishing the resulting deltas for downstream analyses.
pub struct LineHistoryItem {
    files: HashMap<FileId, FileRecord>,
    by_path: HashMap<String, FileId>,
    ids: Rc<RefCell<FileIdRegistry>>,
    rename_seq: Rc<Cell<u64>>,
    extractors: Rc<ExtractorRegistry>,
    pool: Option<Rc<rayon::ThreadPool>>,
    ignore_whitespace: bool,
    diff_budget: Duration,
    hibernation_threshold: usize,
    last_merge_tag: Option<LineTag>,
    pending_census: Option<LineCensus>,
}

impl LineHistoryItem {
    pub const NAME: &'static str = "line_history";

    pub fn new() -> LineHistoryItem {
        LineHistoryItem {
            files: HashMap::new(),
            by_path: HashMap::new(),
            ids: Rc::new(RefCell::new(FileIdRegistry::default())),
            rename_seq: Rc::new(Cell::new(0)),
            extractors: Rc::new(ExtractorRegistry::default()),
            pool: None,
            ignore_whitespace: false,
            diff_budget: Duration::from_millis(DIFF_BUDGET_MS as u64),
            hibernation_threshold: 0,
            last_merge_tag: None,
            pending_census: None,
        }
    }

    pub fn live_lines(&self) -> u64 {
        self.files.values().map(|r| u64::from(r.index.len())).sum()
    }

    /// Snapshot of one file's intervals, for tests and scenario checks.
    pub fn file_intervals(&self, path: &str) -> Option<Vec<(u32, u32, LineTag)>> {
        let id = self.by_path.get(path)?;
        Some(self.files.get(id)?.index.scan().collect())
    }

    fn census(&self) -> LineCensus {
        let mut counts: BTreeMap<LineTag, i64> = BTreeMap::new();
        for record in self.files.values() {
            for (start, end, tag) in record.index.scan() {
                *counts.entry(tag).or_insert(0) += i64::from(end - start);
            }
        }
        counts.into_iter().collect()
    }

    fn track_insert(&mut self, entry: &ChangeEntry, tag: LineTag, deltas: &mut DeltaSink) {
        let lines = entry.blob.line_count as u32;
        let id = self.ids.borrow_mut().id_of(&entry.path);
        // A re-created path silently drops any stale record.
        self.files.insert(
            id,
            FileRecord {
                id,
                path: entry.path.clone(),
                index: LineIndex::new(lines, tag),
                name_seq: 0,
            },
        );
        self.by_path.insert(entry.path.clone(), id);
        if lines > 0 {
            deltas.inserted(id, i64::from(lines));
        }
    }

    fn track_delete(&mut self, path: &str, deltas: &mut DeltaSink) {
        if let Some(id) = self.by_path.remove(path) {
            if let Some(record) = self.files.remove(&id) {
                for (start, end, tag) in record.index.scan() {
                    deltas.deleted(id, tag, i64::from(end - start));
                }
            }
        }
    }

    fn track_rename(&mut self, from: &ChangeEntry, to: &ChangeEntry, index_tag: LineTag, deltas: &mut DeltaSink) {
        match self.by_path.remove(&from.path) {
            Some(id) => {
                let seq = self.rename_seq.get() + 1;
                self.rename_seq.set(seq);
                let record = self.files.get_mut(&id).expect("record for tracked path");
                record.path = to.path.clone();
                record.name_seq = seq;
                self.by_path.insert(to.path.clone(), id);
                self.ids.borrow_mut().alias(&to.path, id);
            }
            None => {
                // The source was never tracked (binary, or state discarded):
                // pick the file up fresh under its new name.
                if !to.blob.binary {
                    self.track_insert(to, index_tag, deltas);
                }
            }
        }
    }

    fn apply_modify(
        &mut self,
        from: &ChangeEntry,
        to: &ChangeEntry,
        plan: Option<&DiffPlan>,
        index_tag: LineTag,
        deltas: &mut DeltaSink,
    ) {
        let tracked = self.by_path.get(&to.path).copied();
        let id = match tracked {
            Some(id) => id,
            None => {
                // Untracked text file surfacing through a modify (it was
                // binary before, or its state was discarded).
                if !to.blob.binary {
                    self.track_insert(to, index_tag, deltas);
                }
                return;
            }
        };
        if to.blob.binary {
            // Text file turned binary: it leaves line history.
            self.track_delete(&to.path, deltas);
            return;
        }
        let record = self.files.get_mut(&id).expect("record for tracked path");
        if record.index.len() as usize != from.blob.line_count {
            error!(
                "line index of `{}` holds {} lines but its blob has {}; discarding the file",
                to.path,
                record.index.len(),
                from.blob.line_count
            );
            self.files.remove(&id);
            self.by_path.remove(&to.path);
            return;
        }

        let plan = plan.expect("diff plan for modify");
        let mut staged = DeltaSink::default();
        if plan.timed_out {
            warn!(
                "diff of `{}` exceeded its budget; treating the file as rewritten",
                to.path
            );
            let len = record.index.len();
            if len > 0 {
                record
                    .index
                    .delete_range(1, len + 1, |tag, n| staged.deleted(id, tag, i64::from(n)));
            }
            let new_len = to.blob.line_count as u32;
            if new_len > 0 {
                record.index.insert_at(1, new_len, index_tag);
                staged.inserted(id, i64::from(new_len));
            }
        } else {
            let ops = if self.extractors.supports(&to.path) {
                let nodes = self
                    .extractors
                    .extract(&to.path, &to.blob.bytes, Selector::Structures);
                refine_insert_boundaries(plan.ops.clone(), &plan.new_hashes, &nodes)
            } else {
                plan.ops.clone()
            };
            for op in ops {
                match op {
                    DiffOp::Equal { .. } => {}
                    DiffOp::Delete {
                        old_len, new_index, ..
                    } => {
                        let start = new_index as u32 + 1;
                        record.index.delete_range(start, start + old_len as u32, |tag, n| {
                            staged.deleted(id, tag, i64::from(n))
                        });
                    }
                    DiffOp::Insert {
                        new_index, new_len, ..
                    } => {
                        record
                            .index
                            .insert_at(new_index as u32 + 1, new_len as u32, index_tag);
                        staged.inserted(id, new_len as i64);
                    }
                    DiffOp::Replace {
                        old_len,
                        new_index,
                        new_len,
                        ..
                    } => {
                        let start = new_index as u32 + 1;
                        record.index.delete_range(start, start + old_len as u32, |tag, n| {
                            staged.deleted(id, tag, i64::from(n))
                        });
                        record
                            .index
                            .insert_at(start, new_len as u32, index_tag);
                        staged.inserted(id, new_len as i64);
                    }
                }
            }
        }

        if record.index.len() as usize != to.blob.line_count {
            // An inconsistency is fatal for this file only: drop its state,
            // withhold its deltas, leave every other file untouched.
            error!(
                "applying the diff of `{}` produced {} lines, expected {}; discarding the file",
                to.path,
                record.index.len(),
                to.blob.line_count
            );
            self.files.remove(&id);
            self.by_path.remove(&to.path);
            return;
        }
        deltas.absorb(staged);
    }
}

impl Default for LineHistoryItem {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-commit delta accumulator: deletions keyed by `(file, source tag)`,
/// insertions keyed by file.
#[derive(Default)]
struct DeltaSink {
    deletions: BTreeMap<(FileId, LineTag), i64>,
    insertions: BTreeMap<FileId, i64>,
}

impl DeltaSink {
    fn deleted(&mut self, file: FileId, tag: LineTag, n: i64) {
        *self.deletions.entry((file, tag)).or_insert(0) += n;
    }

    fn inserted(&mut self, file: FileId, n: i64) {
        *self.insertions.entry(file).or_insert(0) += n;
    }

    fn absorb(&mut self, other: DeltaSink) {
        for ((file, tag), n) in other.deletions {
            *self.deletions.entry((file, tag)).or_insert(0) += n;
        }
        for (file, n) in other.insertions {
            *self.insertions.entry(file).or_insert(0) += n;
        }
    }

    fn into_changes(self, curr: LineTag) -> Vec<LineChange> {
        let mut out = Vec::with_capacity(self.deletions.len() + self.insertions.len());
        for ((file, prev), delta) in self.deletions {
            if delta != 0 {
                out.push(LineChange {
                    file,
                    prev,
                    curr,
                    delta: -delta,
                });
            }
        }
        for (file, delta) in self.insertions {
            if delta != 0 {
                out.push(LineChange {
                    file,
                    prev: MISSING_TAG,
                    curr,
                    delta,
                });
            }
        }
        out.sort();
        out
    }
}

impl AnalysisItem for LineHistoryItem {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn provides(&self) -> &'static [Key] {
        &[keys::LINE_CHANGES, keys::LINE_CENSUS]
    }

    fn requires(&self) -> &'static [Key] {
        &[keys::TREE_CHANGES, keys::AUTHOR, keys::TICK]
    }

    fn description(&self) -> &'static str {
        "Tracks, for every live line of every file, the author and tick that last touched it."
    }

    fn options(&self) -> Vec<ItemOption> {
        vec![
            ItemOption {
                name: "lines-ignore-whitespace",
                help: "ignore whitespace-only differences when diffing lines",
                default: OptionValue::Bool(false),
            },
            ItemOption {
                name: "lines-diff-timeout",
                help: "per-file diff budget in milliseconds; 0 removes the bound",
                default: OptionValue::Int(DIFF_BUDGET_MS),
            },
        ]
    }

    fn configure(&mut self, facts: &mut Facts) -> Result<()> {
        self.ignore_whitespace = facts.bool_option("lines-ignore-whitespace", false);
        let budget = facts.int_option("lines-diff-timeout", DIFF_BUDGET_MS);
        if budget < 0 {
            return Err(Error::config(format!(
                "lines-diff-timeout must be non-negative, got {budget}"
            )));
        }
        self.diff_budget = Duration::from_millis(budget as u64);
        self.hibernation_threshold =
            facts.int_option("lines-hibernation-threshold", 0).max(0) as usize;
        self.extractors = Rc::clone(&facts.extractors);
        if facts.workers > 1 && self.pool.is_none() {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(facts.workers)
                .build()
                .map_err(|e| Error::config(format!("cannot build diff worker pool: {e}")))?;
            self.pool = Some(Rc::new(pool));
        }
        Ok(())
    }

    fn consume(&mut self, ctx: &CommitContext, deps: &Bag) -> Result<Bag> {
        let changes = deps.expect::<Vec<TreeChange>>(keys::TREE_CHANGES)?;
        let author = *deps.expect::<i32>(keys::AUTHOR)?;
        let tick = *deps.expect::<u32>(keys::TICK)?;

        let mut out = Bag::new();
        if let Some(census) = self.pending_census.take() {
            out.insert(keys::LINE_CENSUS, census);
        }

        let commit_tag = LineTag::new(author, tick);
        // Lines written by a merge replay are marked in the index and
        // resolved when the branches reconcile; emitted deltas always carry
        // the real author.
        let index_tag = if ctx.is_merge {
            self.last_merge_tag = Some(commit_tag);
            LineTag::new(MERGE_MARK_AUTHOR, tick)
        } else {
            commit_tag
        };

        // Diffs of independent files are computed up front, in parallel when
        // a worker pool is configured.
        let inputs: Vec<(usize, &BlobFacts, &BlobFacts)> = changes
            .iter()
            .enumerate()
            .filter_map(|(i, change)| match change {
                TreeChange::Modify { from, to }
                    if !to.blob.binary && self.by_path.contains_key(&to.path) =>
                {
                    Some((i, &*from.blob, &*to.blob))
                }
                _ => None,
            })
            .collect();
        let ignore_ws = self.ignore_whitespace;
        let budget = self.diff_budget;
        let plans: HashMap<usize, DiffPlan> = match &self.pool {
            Some(pool) => pool.install(|| {
                inputs
                    .par_iter()
                    .map(|&(i, from, to)| (i, diff_blobs(from, to, ignore_ws, budget)))
                    .collect()
            }),
            None => inputs
                .iter()
                .map(|&(i, from, to)| (i, diff_blobs(from, to, ignore_ws, budget)))
                .collect(),
        };

        let mut deltas = DeltaSink::default();
        for (i, change) in changes.iter().enumerate() {
            match change {
                TreeChange::Insert { to } => {
                    if !to.blob.binary {
                        self.track_insert(to, index_tag, &mut deltas);
                    }
                }
                TreeChange::Delete { from } => {
                    self.track_delete(&from.path, &mut deltas);
                }
                TreeChange::Rename { from, to } => {
                    self.track_rename(from, to, index_tag, &mut deltas);
                }
                TreeChange::Modify { from, to } => {
                    self.apply_modify(from, to, plans.get(&i), index_tag, &mut deltas);
                }
            }
        }

        out.insert(keys::LINE_CHANGES, deltas.into_changes(commit_tag));
        Ok(out)
    }

    fn fork(&mut self, n: usize) -> Vec<Box<dyn AnalysisItem>> {
        (0..n)
            .map(|_| {
                Box::new(LineHistoryItem {
                    files: self.files.clone(),
                    by_path: self.by_path.clone(),
                    ids: Rc::clone(&self.ids),
                    rename_seq: Rc::clone(&self.rename_seq),
                    extractors: Rc::clone(&self.extractors),
                    pool: self.pool.clone(),
                    ignore_whitespace: self.ignore_whitespace,
                    diff_budget: self.diff_budget,
                    hibernation_threshold: self.hibernation_threshold,
                    last_merge_tag: self.last_merge_tag,
                    pending_census: None,
                }) as Box<dyn AnalysisItem>
            })
            .collect()
    }

    fn merge(&mut self, mut others: Vec<Box<dyn AnalysisItem>>) {
        let mut branches: Vec<(HashMap<FileId, FileRecord>, Option<LineTag>)> = Vec::new();
        for other in &mut others {
            let other = other
                .as_any_mut()
                .downcast_mut::<LineHistoryItem>()
                .expect("merging line_history instances");
            branches.push((
                std::mem::take(&mut other.files),
                other.last_merge_tag.take(),
            ));
            other.by_path.clear();
        }
        let merge_tag = self
            .last_merge_tag
            .take()
            .or_else(|| branches.iter().find_map(|(_, t)| *t))
            .unwrap_or(MISSING_TAG);

        let mut ids: BTreeSet<FileId> = self.files.keys().copied().collect();
        for (files, _) in &branches {
            ids.extend(files.keys().copied());
        }

        for id in ids {
            let mut records: Vec<FileRecord> = Vec::new();
            if let Some(r) = self.files.remove(&id) {
                records.push(r);
            }
            for (files, _) in &mut branches {
                if let Some(r) = files.remove(&id) {
                    records.push(r);
                }
            }
            let merged = reconcile_file(records, merge_tag);
            self.files.insert(id, merged);
        }

        self.by_path.clear();
        for record in self.files.values() {
            self.by_path.insert(record.path.clone(), record.id);
        }
        self.pending_census = Some(self.census());
    }

    fn hibernate(&mut self) -> Result<Option<Vec<u8>>> {
        if self.files.is_empty() {
            return Ok(None);
        }
        if self.hibernation_threshold > 0
            && (self.live_lines() as usize) < self.hibernation_threshold
        {
            return Ok(None);
        }
        let state = HibernatedState {
            files: self.files.drain().collect(),
            by_path: self.by_path.drain().collect(),
        };
        let bytes = bincode::serialize(&state).map_err(|e| Error::Hibernation {
            branch: 0,
            reason: e.to_string(),
        })?;
        Ok(Some(bytes))
    }

    fn boot(&mut self, bytes: &[u8]) -> Result<()> {
        let state: HibernatedState =
            bincode::deserialize(bytes).map_err(|e| Error::Hibernation {
                branch: 0,
                reason: e.to_string(),
            })?;
        self.files = state.files.into_iter().collect();
        self.by_path = state.by_path.into_iter().collect();
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

/// Merge one file's per-branch records. All branches replayed the merge
/// commit, so their lengths agree; marked lines take the first unmarked tag in
/// branch order, agreeing or survivor-held tags stay, and lines marked
/// everywhere get the merge commit's own tag. The newest name wins.
fn reconcile_file(mut records: Vec<FileRecord>, merge_tag: LineTag) -> FileRecord {
    debug_assert!(!records.is_empty());
    if records.len() == 1 {
        return records.pop().expect("checked length");
    }
    let reference_len = records[0].index.len();
    if records.iter().any(|r| r.index.len() != reference_len) {
        warn!(
            "diverged line counts for `{}` across merged branches; keeping the survivor's view",
            records[0].path
        );
        return records.swap_remove(0);
    }

    let per_branch: Vec<Vec<LineTag>> = records.iter().map(|r| r.index.to_lines()).collect();
    let mut resolved = Vec::with_capacity(reference_len as usize);
    for line in 0..reference_len as usize {
        let tag = if per_branch[0][line].author != MERGE_MARK_AUTHOR {
            per_branch[0][line]
        } else {
            per_branch
                .iter()
                .map(|lines| lines[line])
                .find(|t| t.author != MERGE_MARK_AUTHOR)
                .unwrap_or(merge_tag)
        };
        resolved.push(tag);
    }

    let newest = records
        .iter()
        .enumerate()
        .max_by_key(|(i, r)| (r.name_seq, usize::MAX - i))
        .map(|(i, _)| i)
        .expect("non-empty records");
    let name_seq = records[newest].name_seq;
    let path = records[newest].path.clone();
    FileRecord {
        id: records[0].id,
        path,
        index: LineIndex::from_lines(&resolved),
        name_seq,
    }
}
