use itertools::Itertools;
use serde::{Deserialize, Serialize};
use similar::{capture_diff_slices, Algorithm, DiffOp};
use std::collections::BTreeMap;
use std::io;
use std::rc::Rc;

use crate::blobs::hash_lines;
use crate::errors::{Error, Result};
use crate::extractor::{ExtractorRegistry, Selector};
use crate::item::{keys, AnalysisItem, Bag, CommitContext, Facts, Key};
use crate::report::{Report, TextWriter};
use crate::tree_changes::TreeChange;

/// Upper bound on units touched by one commit that still produce pairwise
/// couples; beyond it only the touch counts are kept.
const MAX_COUPLED_UNITS: usize = 100;

type UnitCounts = BTreeMap<String, u64>;
type UnitPairs = BTreeMap<(String, String), u64>;

fn add_counts(dst: &mut UnitCounts, src: &UnitCounts, sign: i64) {
    for (unit, &n) in src {
        let entry = dst.entry(unit.clone()).or_insert(0);
        *entry = (*entry as i64 + sign * n as i64).max(0) as u64;
    }
}

fn add_pairs(dst: &mut UnitPairs, src: &UnitPairs, sign: i64) {
    for (pair, &n) in src {
        let entry = dst.entry(pair.clone()).or_insert(0);
        *entry = (*entry as i64 + sign * n as i64).max(0) as u64;
    }
}

// -------------------------------------------------------------------------------------------------
// ShotnessItem
// -------------------------------------------------------------------------------------------------
/// Structural hotness: how often each syntactic unit (function, class) is
/// touched, and which units are touched together. Files without a registered
/// syntax extractor contribute nothing.
pub struct ShotnessItem {
    extractors: Rc<ExtractorRegistry>,
    units: UnitCounts,
    pairs: UnitPairs,
    units_base: UnitCounts,
    pairs_base: UnitPairs,
}

impl ShotnessItem {
    pub const NAME: &'static str = "shotness";

    pub fn new() -> ShotnessItem {
        ShotnessItem {
            extractors: Rc::new(ExtractorRegistry::default()),
            units: UnitCounts::new(),
            pairs: UnitPairs::new(),
            units_base: UnitCounts::new(),
            pairs_base: UnitPairs::new(),
        }
    }

    /// New-file line ranges touched by the change, from a line diff.
    fn changed_ranges(old: &[u8], new: &[u8]) -> Vec<(u32, u32)> {
        let old_hashes = hash_lines(old, false);
        let new_hashes = hash_lines(new, false);
        let mut ranges = Vec::new();
        for op in capture_diff_slices(Algorithm::Myers, &old_hashes, &new_hashes) {
            match op {
                DiffOp::Equal { .. } => {}
                DiffOp::Delete { new_index, .. } => {
                    // A pure deletion touches the seam it leaves behind.
                    let line = new_index as u32 + 1;
                    ranges.push((line.saturating_sub(1).max(1), line));
                }
                DiffOp::Insert {
                    new_index, new_len, ..
                }
                | DiffOp::Replace {
                    new_index, new_len, ..
                } => {
                    let start = new_index as u32 + 1;
                    ranges.push((start, start + new_len as u32 - 1));
                }
            }
        }
        ranges
    }

    fn touched_units(&self, path: &str, old: &[u8], new: &[u8]) -> Vec<String> {
        let nodes = self.extractors.extract(path, new, Selector::Structures);
        if nodes.is_empty() {
            return Vec::new();
        }
        let ranges = Self::changed_ranges(old, new);
        let mut touched: Vec<String> = nodes
            .iter()
            .filter(|n| {
                ranges
                    .iter()
                    .any(|&(start, end)| n.start_line <= end && start <= n.end_line)
            })
            .map(|n| format!("{path}#{}:{}", n.kind, n.name))
            .collect();
        touched.sort();
        touched.dedup();
        touched
    }
}

impl Default for ShotnessItem {
    fn default() -> Self {
        Self::new()
    }
}

impl AnalysisItem for ShotnessItem {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn flag(&self) -> Option<&'static str> {
        Some("shotness")
    }

    fn requires(&self) -> &'static [Key] {
        &[keys::TREE_CHANGES]
    }

    fn description(&self) -> &'static str {
        "Touch counts and co-change couples of syntactic units."
    }

    fn configure(&mut self, facts: &mut Facts) -> Result<()> {
        self.extractors = Rc::clone(&facts.extractors);
        Ok(())
    }

    fn consume(&mut self, _ctx: &CommitContext, deps: &Bag) -> Result<Bag> {
        let changes = deps.expect::<Vec<TreeChange>>(keys::TREE_CHANGES)?;
        let mut commit_units: Vec<String> = Vec::new();
        for change in changes {
            if change.touches_binary() {
                continue;
            }
            match change {
                TreeChange::Modify { from, to } => {
                    commit_units.extend(self.touched_units(
                        &to.path,
                        &from.blob.bytes,
                        &to.blob.bytes,
                    ));
                }
                TreeChange::Insert { to } => {
                    commit_units.extend(self.touched_units(&to.path, &[], &to.blob.bytes));
                }
                _ => {}
            }
        }
        commit_units.sort();
        commit_units.dedup();

        for unit in &commit_units {
            *self.units.entry(unit.clone()).or_insert(0) += 1;
        }
        if commit_units.len() <= MAX_COUPLED_UNITS {
            for (a, b) in commit_units.iter().tuple_combinations() {
                *self.pairs.entry((a.clone(), b.clone())).or_insert(0) += 1;
            }
        }
        Ok(Bag::new())
    }

    fn one_shot_under_merges(&self) -> bool {
        true
    }

    fn fork(&mut self, n: usize) -> Vec<Box<dyn AnalysisItem>> {
        (0..n)
            .map(|_| {
                Box::new(ShotnessItem {
                    extractors: Rc::clone(&self.extractors),
                    units: self.units.clone(),
                    pairs: self.pairs.clone(),
                    units_base: self.units.clone(),
                    pairs_base: self.pairs.clone(),
                }) as Box<dyn AnalysisItem>
            })
            .collect()
    }

    fn merge(&mut self, others: Vec<Box<dyn AnalysisItem>>) {
        for other in others {
            let other = other
                .as_any()
                .downcast_ref::<ShotnessItem>()
                .expect("merging shotness instances");
            add_counts(&mut self.units, &other.units, 1);
            add_counts(&mut self.units, &other.units_base, -1);
            add_pairs(&mut self.pairs, &other.pairs, 1);
            add_pairs(&mut self.pairs, &other.pairs_base, -1);
        }
    }

    fn finalise(&mut self) -> Option<Box<dyn Report>> {
        Some(Box::new(ShotnessReport {
            units: self.units.clone(),
            couples: self
                .pairs
                .iter()
                .filter(|(_, &n)| n > 0)
                .map(|((a, b), &n)| (a.clone(), b.clone(), n))
                .collect(),
        }))
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

// -------------------------------------------------------------------------------------------------
// ShotnessReport
// -------------------------------------------------------------------------------------------------
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShotnessReport {
    pub units: UnitCounts,
    pub couples: Vec<(String, String, u64)>,
}

impl Report for ShotnessReport {
    fn write_text(&self, out: &mut TextWriter<'_>) -> io::Result<()> {
        out.open("units")?;
        for (unit, n) in &self.units {
            out.field(format!("{unit:?}"), n)?;
        }
        out.close();
        out.open("couples")?;
        for (a, b, n) in &self.couples {
            out.field(format!("{a:?} & {b:?}"), n)?;
        }
        out.close();
        Ok(())
    }

    fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::config(e.to_string()))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::blobs::BlobFacts;
    use crate::extractor::{SyntaxExtractor, SyntaxNode};
    use crate::tree_changes::ChangeEntry;
    use git2::Oid;
    use pretty_assertions::assert_eq;
    use smallvec::SmallVec;

    /// Fake extractor: every run of lines starting with `fn ` opens a
    /// ten-line unit named by its first word suffix.
    struct LineMarkers;

    impl SyntaxExtractor for LineMarkers {
        fn handles(&self, path: &str) -> bool {
            path.ends_with(".zz")
        }

        fn extract(&self, _path: &str, bytes: &[u8], _selector: Selector) -> Vec<SyntaxNode> {
            let text = String::from_utf8_lossy(bytes);
            let mut out = Vec::new();
            for (i, line) in text.lines().enumerate() {
                if let Some(name) = line.strip_prefix("fn ") {
                    out.push(SyntaxNode {
                        kind: "function".into(),
                        name: name.to_string(),
                        start_line: i as u32 + 1,
                        end_line: i as u32 + 3,
                        start_col: 0,
                        end_col: 0,
                        text: String::new(),
                    });
                }
            }
            out
        }
    }

    fn ctx() -> CommitContext {
        CommitContext {
            meta: crate::commits::CommitMeta {
                id: Oid::zero(),
                parents: SmallVec::new(),
                tree: Oid::zero(),
                author_name: String::new(),
                author_email: String::new(),
                when: 0,
            },
            branch: 0,
            is_merge: false,
            next_merge: None,
            sequence: 0,
        }
    }

    fn entry(path: &str, content: &[u8]) -> ChangeEntry {
        ChangeEntry {
            path: path.to_string(),
            blob: std::rc::Rc::new(BlobFacts::derive(Oid::zero(), content.to_vec())),
        }
    }

    fn item() -> ShotnessItem {
        let mut registry = ExtractorRegistry::default();
        registry.register(Box::new(LineMarkers));
        let mut item = ShotnessItem::new();
        item.extractors = Rc::new(registry);
        item
    }

    #[test]
    fn touched_units_counted() {
        let mut item = item();
        let old = b"fn alpha\na\nb\nfn beta\nc\nd\n";
        let new = b"fn alpha\na\nCHANGED\nfn beta\nc\nd\n";
        let mut bag = Bag::new();
        bag.insert(
            keys::TREE_CHANGES,
            vec![TreeChange::Modify {
                from: entry("m.zz", old),
                to: entry("m.zz", new),
            }],
        );
        item.consume(&ctx(), &bag).unwrap();
        // Line 3 changed: inside alpha's span (1..=3), outside beta's (4..=6).
        assert_eq!(item.units.get("m.zz#function:alpha"), Some(&1));
        assert_eq!(item.units.get("m.zz#function:beta"), None);
    }

    #[test]
    fn unsupported_files_contribute_nothing() {
        let mut item = item();
        let mut bag = Bag::new();
        bag.insert(
            keys::TREE_CHANGES,
            vec![TreeChange::Insert {
                to: entry("plain.txt", b"fn alpha\nx\n"),
            }],
        );
        item.consume(&ctx(), &bag).unwrap();
        assert!(item.units.is_empty());
    }

    #[test]
    fn report_roundtrip() {
        let mut item = item();
        let mut bag = Bag::new();
        bag.insert(
            keys::TREE_CHANGES,
            vec![TreeChange::Insert {
                to: entry("m.zz", b"fn alpha\nbody\n"),
            }],
        );
        item.consume(&ctx(), &bag).unwrap();
        let bytes = item.finalise().unwrap().to_bytes().unwrap();
        let decoded: ShotnessReport = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded.units.get("m.zz#function:alpha"), Some(&1));
        assert_eq!(bincode::serialize(&decoded).unwrap(), bytes);
    }

    #[test]
    fn couples_between_units() {
        let mut item = item();
        let old = b"fn alpha\na\nb\nfn beta\nc\nd\n";
        let new = b"fn alpha\nX\nb\nfn beta\nY\nd\n";
        let mut bag = Bag::new();
        bag.insert(
            keys::TREE_CHANGES,
            vec![TreeChange::Modify {
                from: entry("m.zz", old),
                to: entry("m.zz", new),
            }],
        );
        item.consume(&ctx(), &bag).unwrap();
        assert_eq!(
            item.pairs
                .get(&("m.zz#function:alpha".into(), "m.zz#function:beta".into())),
            Some(&1)
        );
    }
}
