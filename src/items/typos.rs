use serde::{Deserialize, Serialize};
use similar::{capture_diff_slices, Algorithm, DiffOp};
use std::collections::BTreeSet;
use std::io;

use crate::blobs::{hash_lines, split_lines};
use crate::errors::{Error, Result};
use crate::item::{keys, AnalysisItem, Bag, CommitContext, Facts, ItemOption, Key, OptionValue};
use crate::report::{Report, TextWriter};
use crate::tree_changes::TreeChange;

pub const DEFAULT_MAX_DISTANCE: i64 = 4;
/// Lines shorter than this are too noisy to call a fix a typo fix.
const MIN_LINE_LEN: usize = 4;
/// Per-commit cap on recorded candidates.
const MAX_PER_COMMIT: usize = 50;

/// One suspected typo fix: a line replaced by a nearly identical line.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypoCandidate {
    pub commit: String,
    pub file: String,
    /// 1-based line in the fixed file.
    pub line: u32,
    pub before: String,
    pub after: String,
}

/// Band-limited Levenshtein distance: anything beyond `cap` comes back as
/// `cap + 1`.
pub fn edit_distance(a: &[u8], b: &[u8], cap: usize) -> usize {
    if a.len().abs_diff(b.len()) > cap {
        return cap + 1;
    }
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];
    for (i, &ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        let mut row_min = curr[0];
        for (j, &cb) in b.iter().enumerate() {
            let substitute = prev[j] + usize::from(ca != cb);
            curr[j + 1] = substitute.min(prev[j + 1] + 1).min(curr[j] + 1);
            row_min = row_min.min(curr[j + 1]);
        }
        if row_min > cap {
            return cap + 1;
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()].min(cap + 1)
}

// -------------------------------------------------------------------------------------------------
// TyposItem
// -------------------------------------------------------------------------------------------------
/// Typo-fix extraction: paired one-for-one line replacements whose edit
/// distance is small and positive.
pub struct TyposItem {
    max_distance: usize,
    found: BTreeSet<TypoCandidate>,
}

impl TyposItem {
    pub const NAME: &'static str = "typos";

    pub fn new() -> TyposItem {
        TyposItem {
            max_distance: DEFAULT_MAX_DISTANCE as usize,
            found: BTreeSet::new(),
        }
    }
}

impl Default for TyposItem {
    fn default() -> Self {
        Self::new()
    }
}

impl AnalysisItem for TyposItem {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn flag(&self) -> Option<&'static str> {
        Some("typos")
    }

    fn requires(&self) -> &'static [Key] {
        &[keys::TREE_CHANGES]
    }

    fn description(&self) -> &'static str {
        "Collects lines fixed by nearly identical replacements: typo-fix candidates."
    }

    fn options(&self) -> Vec<ItemOption> {
        vec![ItemOption {
            name: "typos-max-distance",
            help: "maximum edit distance between the broken and fixed line",
            default: OptionValue::Int(DEFAULT_MAX_DISTANCE),
        }]
    }

    fn configure(&mut self, facts: &mut Facts) -> Result<()> {
        let max = facts.int_option("typos-max-distance", DEFAULT_MAX_DISTANCE);
        if max <= 0 {
            return Err(Error::config(format!(
                "typos-max-distance must be positive, got {max}"
            )));
        }
        self.max_distance = max as usize;
        Ok(())
    }

    fn consume(&mut self, ctx: &CommitContext, deps: &Bag) -> Result<Bag> {
        let changes = deps.expect::<Vec<TreeChange>>(keys::TREE_CHANGES)?;
        let commit = ctx.meta.short_id();
        let mut recorded = 0usize;

        for change in changes {
            let (from, to) = match change {
                TreeChange::Modify { from, to } if !change.touches_binary() => (from, to),
                _ => continue,
            };
            let old_lines = split_lines(&from.blob.bytes);
            let new_lines = split_lines(&to.blob.bytes);
            let old_hashes = hash_lines(&from.blob.bytes, false);
            let new_hashes = hash_lines(&to.blob.bytes, false);

            for op in capture_diff_slices(Algorithm::Myers, &old_hashes, &new_hashes) {
                let (old_index, old_len, new_index, new_len) = match op {
                    DiffOp::Replace {
                        old_index,
                        old_len,
                        new_index,
                        new_len,
                    } => (old_index, old_len, new_index, new_len),
                    _ => continue,
                };
                // Only one-for-one replacements are typo-shaped.
                if old_len != new_len {
                    continue;
                }
                for offset in 0..old_len {
                    let before = old_lines[old_index + offset];
                    let after = new_lines[new_index + offset];
                    if before.len() < MIN_LINE_LEN || after.len() < MIN_LINE_LEN {
                        continue;
                    }
                    let distance = edit_distance(before, after, self.max_distance);
                    if distance == 0 || distance > self.max_distance {
                        continue;
                    }
                    if recorded >= MAX_PER_COMMIT {
                        break;
                    }
                    recorded += 1;
                    self.found.insert(TypoCandidate {
                        commit: commit.clone(),
                        file: to.path.clone(),
                        line: (new_index + offset) as u32 + 1,
                        before: String::from_utf8_lossy(before).into_owned(),
                        after: String::from_utf8_lossy(after).into_owned(),
                    });
                }
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
                Box::new(TyposItem {
                    max_distance: self.max_distance,
                    found: self.found.clone(),
                }) as Box<dyn AnalysisItem>
            })
            .collect()
    }

    fn merge(&mut self, others: Vec<Box<dyn AnalysisItem>>) {
        // Candidates are keyed by (commit, file, line): a set union dedups
        // the shared history.
        for other in others {
            let other = other
                .as_any()
                .downcast_ref::<TyposItem>()
                .expect("merging typos instances");
            self.found.extend(other.found.iter().cloned());
        }
    }

    fn finalise(&mut self) -> Option<Box<dyn Report>> {
        Some(Box::new(TyposReport {
            typos: self.found.iter().cloned().collect(),
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
// TyposReport
// -------------------------------------------------------------------------------------------------
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TyposReport {
    pub typos: Vec<TypoCandidate>,
}

impl Report for TyposReport {
    fn write_text(&self, out: &mut TextWriter<'_>) -> io::Result<()> {
        out.field("count", self.typos.len())?;
        for typo in &self.typos {
            out.open(format!("{}:{}:{}", typo.commit, typo.file, typo.line))?;
            out.text_field("before", &typo.before)?;
            out.text_field("after", &typo.after)?;
            out.close();
        }
        Ok(())
    }

    fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::config(e.to_string()))
    }
}
