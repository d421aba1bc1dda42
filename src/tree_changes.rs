use bstr::ByteSlice;
use git2::{Delta, DiffOptions, Oid, Repository};
use std::collections::HashMap;
use std::rc::Rc;
use tracing::warn;

use crate::blobs::{hash_lines, BlobCache, BlobFacts};
use crate::errors::{Error, Result};
use crate::item::{keys, AnalysisItem, Bag, CommitContext, Facts, ItemOption, Key, OptionValue};

/// Default similarity (percent of matching lines) above which a delete/insert
/// pair is reported as a rename.
pub const RENAME_SIMILARITY: i64 = 80;

// -------------------------------------------------------------------------------------------------
// TreeChange
// -------------------------------------------------------------------------------------------------
/// One side of a tree change: the path and the blob it points at.
#[derive(Clone, Debug)]
pub struct ChangeEntry {
    pub path: String,
    pub blob: Rc<BlobFacts>,
}

/// The typed diff of one commit's tree against its branch predecessor.
#[derive(Clone, Debug)]
pub enum TreeChange {
    Insert { to: ChangeEntry },
    Delete { from: ChangeEntry },
    Modify { from: ChangeEntry, to: ChangeEntry },
    Rename { from: ChangeEntry, to: ChangeEntry },
}

impl TreeChange {
    /// The change's current path: the destination for everything but a
    /// deletion.
    pub fn path(&self) -> &str {
        match self {
            TreeChange::Insert { to } => &to.path,
            TreeChange::Delete { from } => &from.path,
            TreeChange::Modify { to, .. } => &to.path,
            TreeChange::Rename { to, .. } => &to.path,
        }
    }

    /// Whether any side of the change is a binary blob.
    pub fn touches_binary(&self) -> bool {
        match self {
            TreeChange::Insert { to } => to.blob.binary,
            TreeChange::Delete { from } => from.blob.binary,
            TreeChange::Modify { from, to } | TreeChange::Rename { from, to } => {
                from.blob.binary || to.blob.binary
            }
        }
    }
}

// -------------------------------------------------------------------------------------------------
// rename detection
// -------------------------------------------------------------------------------------------------
/// Percentage of matching lines between two text blobs: the size of the
/// multiset intersection of line hashes over the larger line count.
pub fn content_similarity(a: &BlobFacts, b: &BlobFacts) -> i64 {
    if a.id == b.id {
        return 100;
    }
    if a.line_count == 0 && b.line_count == 0 {
        return 100;
    }
    let larger = a.line_count.max(b.line_count);
    if larger == 0 {
        return 0;
    }
    let mut counts: HashMap<u64, i64> = HashMap::new();
    for h in hash_lines(&a.bytes, false) {
        *counts.entry(h).or_insert(0) += 1;
    }
    let mut common = 0i64;
    for h in hash_lines(&b.bytes, false) {
        if let Some(c) = counts.get_mut(&h) {
            if *c > 0 {
                *c -= 1;
                common += 1;
            }
        }
    }
    common * 100 / larger as i64
}

/// Match deleted against inserted entries: exact blob ids first, then content
/// similarity above `threshold` for text pairs of comparable shape. Matched
/// pairs become renames; the leftovers stay deletions and insertions.
fn detect_renames(
    deletes: Vec<ChangeEntry>,
    inserts: Vec<ChangeEntry>,
    threshold: i64,
) -> Vec<TreeChange> {
    let mut matched_delete = vec![false; deletes.len()];
    let mut matched_insert = vec![false; inserts.len()];
    let mut renames: Vec<(usize, usize)> = Vec::new();

    // Phase 1: exact matches.
    for (di, del) in deletes.iter().enumerate() {
        for (ii, ins) in inserts.iter().enumerate() {
            if matched_insert[ii] {
                continue;
            }
            if del.blob.id == ins.blob.id {
                matched_delete[di] = true;
                matched_insert[ii] = true;
                renames.push((di, ii));
                break;
            }
        }
    }

    // Phase 2: fuzzy matches over text pairs whose shapes are comparable.
    if threshold < 100 {
        for (di, del) in deletes.iter().enumerate() {
            if matched_delete[di] || del.blob.binary {
                continue;
            }
            for (ii, ins) in inserts.iter().enumerate() {
                if matched_insert[ii] || ins.blob.binary {
                    continue;
                }
                let small = del.blob.line_count.min(ins.blob.line_count);
                let large = del.blob.line_count.max(ins.blob.line_count);
                // Shape guard: a pair cannot shrink or grow past the
                // similarity bound and still match it.
                if large > 0 && (small * 100) / large < threshold as usize {
                    continue;
                }
                if content_similarity(&del.blob, &ins.blob) >= threshold {
                    matched_delete[di] = true;
                    matched_insert[ii] = true;
                    renames.push((di, ii));
                    break;
                }
            }
        }
    }

    let mut deletes: Vec<Option<ChangeEntry>> = deletes.into_iter().map(Some).collect();
    let mut inserts: Vec<Option<ChangeEntry>> = inserts.into_iter().map(Some).collect();
    let mut out = Vec::new();
    for (di, ii) in renames {
        let from = deletes[di].take().expect("rename source");
        let to = inserts[ii].take().expect("rename target");
        out.push(TreeChange::Rename { from, to });
    }
    out.extend(deletes.into_iter().flatten().map(|from| TreeChange::Delete { from }));
    out.extend(inserts.into_iter().flatten().map(|to| TreeChange::Insert { to }));
    out
}

// -------------------------------------------------------------------------------------------------
// TreeChangesItem
// -------------------------------------------------------------------------------------------------
/// The plumbing item producing every commit's typed tree diff.
///
/// Each branch instance holds the tree of the last commit it consumed and
/// diffs the incoming commit against that snapshot; for linear commits that is
/// parent 0, for merge replays the respective parent of each branch.
pub struct TreeChangesItem {
    repo: Option<Rc<Repository>>,
    prev_tree: Option<Oid>,
    cache: BlobCache,
    rename_similarity: i64,
}

impl TreeChangesItem {
    pub const NAME: &'static str = "tree_changes";

    pub fn new() -> TreeChangesItem {
        TreeChangesItem {
            repo: None,
            prev_tree: None,
            cache: BlobCache::default(),
            rename_similarity: RENAME_SIMILARITY,
        }
    }

    fn load(&mut self, id: Oid, path: &str) -> Option<ChangeEntry> {
        let repo = self.repo.as_ref().expect("configured with a repository");
        match self.cache.get_or_load(repo, id, path) {
            Ok(blob) => Some(ChangeEntry {
                path: path.to_string(),
                blob,
            }),
            Err(e) => {
                // A blob we cannot materialise skips its change; the rest of
                // the commit still goes through.
                warn!("{e}");
                None
            }
        }
    }
}

impl Default for TreeChangesItem {
    fn default() -> Self {
        Self::new()
    }
}

impl AnalysisItem for TreeChangesItem {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn provides(&self) -> &'static [Key] {
        &[keys::TREE_CHANGES]
    }

    fn description(&self) -> &'static str {
        "Computes the typed tree diff of each commit against its branch predecessor."
    }

    fn options(&self) -> Vec<ItemOption> {
        vec![ItemOption {
            name: "renames-similarity",
            help: "minimum percentage of matching lines for rename detection",
            default: OptionValue::Int(RENAME_SIMILARITY),
        }]
    }

    fn configure(&mut self, facts: &mut Facts) -> Result<()> {
        let similarity = facts.int_option("renames-similarity", RENAME_SIMILARITY);
        if !(0..=100).contains(&similarity) {
            return Err(Error::config(format!(
                "renames-similarity must be within [0, 100], got {similarity}"
            )));
        }
        self.rename_similarity = similarity;
        self.repo = facts.repository.clone();
        Ok(())
    }

    fn initialise(&mut self, _facts: &Facts) -> Result<()> {
        if self.repo.is_none() {
            return Err(Error::config(
                "tree_changes needs a repository; none was configured",
            ));
        }
        self.prev_tree = None;
        Ok(())
    }

    fn consume(&mut self, ctx: &CommitContext, _deps: &Bag) -> Result<Bag> {
        let repo = Rc::clone(self.repo.as_ref().expect("configured with a repository"));
        let new_tree = repo.find_tree(ctx.meta.tree)?;
        let old_tree = match self.prev_tree {
            Some(oid) => Some(repo.find_tree(oid)?),
            None => None,
        };

        let mut opts = DiffOptions::new();
        let diff =
            repo.diff_tree_to_tree(old_tree.as_ref(), Some(&new_tree), Some(&mut opts))?;

        let mut inserts: Vec<ChangeEntry> = Vec::new();
        let mut deletes: Vec<ChangeEntry> = Vec::new();
        let mut modifies: Vec<(ChangeEntry, ChangeEntry)> = Vec::new();
        for delta in diff.deltas() {
            match delta.status() {
                Delta::Added => {
                    let file = delta.new_file();
                    let path = path_of(&file);
                    if let Some(entry) = self.load(file.id(), &path) {
                        inserts.push(entry);
                    }
                }
                Delta::Deleted => {
                    let file = delta.old_file();
                    let path = path_of(&file);
                    if let Some(entry) = self.load(file.id(), &path) {
                        deletes.push(entry);
                    }
                }
                Delta::Modified | Delta::Typechange => {
                    let old = delta.old_file();
                    let new = delta.new_file();
                    let from = self.load(old.id(), &path_of(&old));
                    let to = self.load(new.id(), &path_of(&new));
                    if let (Some(from), Some(to)) = (from, to) {
                        modifies.push((from, to));
                    }
                }
                _ => {}
            }
        }

        let mut changes = detect_renames(deletes, inserts, self.rename_similarity);
        changes.extend(
            modifies
                .into_iter()
                .map(|(from, to)| TreeChange::Modify { from, to }),
        );
        changes.sort_by(|a, b| a.path().cmp(b.path()));

        self.prev_tree = Some(ctx.meta.tree);
        self.cache.clear();

        let mut out = Bag::new();
        out.insert(keys::TREE_CHANGES, changes);
        Ok(out)
    }

    fn fork(&mut self, n: usize) -> Vec<Box<dyn AnalysisItem>> {
        (0..n)
            .map(|_| {
                Box::new(TreeChangesItem {
                    repo: self.repo.clone(),
                    prev_tree: self.prev_tree,
                    cache: BlobCache::default(),
                    rename_similarity: self.rename_similarity,
                }) as Box<dyn AnalysisItem>
            })
            .collect()
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

// Git paths are byte strings; anything non-UTF-8 degrades lossily for
// reporting but still keys consistently within the run.
fn path_of(file: &git2::DiffFile<'_>) -> String {
    file.path_bytes()
        .map(|b| b.to_str_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn entry(path: &str, first_byte: u8, content: &[u8]) -> ChangeEntry {
        let mut id = [0u8; 20];
        id[0] = first_byte;
        ChangeEntry {
            path: path.to_string(),
            blob: Rc::new(BlobFacts::derive(Oid::from_bytes(&id).unwrap(), content.to_vec())),
        }
    }

    #[test]
    fn similarity_extremes() {
        let a = entry("a", 1, b"x\ny\nz\n");
        let b = entry("b", 2, b"x\ny\nz\n");
        assert_eq!(content_similarity(&a.blob, &b.blob), 100);
        let c = entry("c", 3, b"1\n2\n3\n");
        assert_eq!(content_similarity(&a.blob, &c.blob), 0);
        let d = entry("d", 4, b"x\ny\nq\n");
        assert_eq!(content_similarity(&a.blob, &d.blob), 66);
    }

    #[test]
    fn exact_rename_detected() {
        let changes = detect_renames(
            vec![entry("old.go", 1, b"same\ncontent\n")],
            vec![entry("new.go", 1, b"same\ncontent\n")],
            80,
        );
        assert_eq!(changes.len(), 1);
        match &changes[0] {
            TreeChange::Rename { from, to } => {
                assert_eq!(from.path, "old.go");
                assert_eq!(to.path, "new.go");
            }
            other => panic!("expected rename, got {other:?}"),
        }
    }

    #[test]
    fn fuzzy_rename_detected_above_threshold() {
        let from = entry("a.rs", 1, b"one\ntwo\nthree\nfour\nfive\n");
        let to = entry("b.rs", 2, b"one\ntwo\nthree\nfour\nFIVE\n");
        let changes = detect_renames(vec![from], vec![to], 80);
        assert!(matches!(changes[0], TreeChange::Rename { .. }));
    }

    #[test]
    fn dissimilar_pair_stays_delete_insert() {
        let from = entry("a.rs", 1, b"one\ntwo\n");
        let to = entry("b.rs", 2, b"alpha\nbeta\ngamma\ndelta\nepsilon\nzeta\n");
        let changes = detect_renames(vec![from], vec![to], 80);
        assert_eq!(changes.len(), 2);
        assert!(changes.iter().any(|c| matches!(c, TreeChange::Delete { .. })));
        assert!(changes.iter().any(|c| matches!(c, TreeChange::Insert { .. })));
    }

    #[test]
    fn binary_pairs_only_match_exactly() {
        let from = entry("a.bin", 1, b"\x00binary");
        let to = entry("b.bin", 2, b"\x00binary!");
        let changes = detect_renames(vec![from], vec![to], 80);
        assert_eq!(changes.len(), 2, "no fuzzy match for binary blobs");

        let from = entry("a.bin", 3, b"\x00binary");
        let to = entry("b.bin", 3, b"\x00binary");
        let changes = detect_renames(vec![from], vec![to], 80);
        assert!(matches!(changes[0], TreeChange::Rename { .. }));
    }

    #[test]
    fn touches_binary_and_path() {
        let c = TreeChange::Modify {
            from: entry("f", 1, b"text\n"),
            to: entry("f", 2, b"\x00"),
        };
        assert!(c.touches_binary());
        assert_eq!(c.path(), "f");
    }
}
