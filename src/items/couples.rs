use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;

use crate::errors::{Error, Result};
use crate::item::{keys, AnalysisItem, Bag, CommitContext, Facts, ItemOption, Key, OptionValue};
use crate::report::{Report, TextWriter};
use crate::tree_changes::TreeChange;

/// Commits touching more files than this are treated as mechanical sweeps and
/// skipped: coupling signal drowns in them.
pub const DEFAULT_MAX_COMMIT_FILES: i64 = 500;

type PairCounts = BTreeMap<(String, String), u64>;
type PeopleFiles = BTreeMap<i32, BTreeMap<String, u64>>;

fn add_pairs(dst: &mut PairCounts, src: &PairCounts, sign: i64) {
    for (pair, &n) in src {
        let entry = dst.entry(pair.clone()).or_insert(0);
        *entry = (*entry as i64 + sign * n as i64).max(0) as u64;
    }
}

fn add_people(dst: &mut PeopleFiles, src: &PeopleFiles, sign: i64) {
    for (&author, files) in src {
        let mine = dst.entry(author).or_default();
        for (path, &n) in files {
            let entry = mine.entry(path.clone()).or_insert(0);
            *entry = (*entry as i64 + sign * n as i64).max(0) as u64;
        }
    }
}

// -------------------------------------------------------------------------------------------------
// CouplesItem
// -------------------------------------------------------------------------------------------------
/// Change coupling: how often pairs of files change in the same commit, and
/// how often each author touches each file.
pub struct CouplesItem {
    max_commit_files: usize,
    pairs: PairCounts,
    people: PeopleFiles,
    pairs_base: PairCounts,
    people_base: PeopleFiles,
}

impl CouplesItem {
    pub const NAME: &'static str = "couples";

    pub fn new() -> CouplesItem {
        CouplesItem {
            max_commit_files: DEFAULT_MAX_COMMIT_FILES as usize,
            pairs: PairCounts::new(),
            people: PeopleFiles::new(),
            pairs_base: PairCounts::new(),
            people_base: PeopleFiles::new(),
        }
    }
}

impl Default for CouplesItem {
    fn default() -> Self {
        Self::new()
    }
}

impl AnalysisItem for CouplesItem {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn flag(&self) -> Option<&'static str> {
        Some("couples")
    }

    fn requires(&self) -> &'static [Key] {
        &[keys::TREE_CHANGES, keys::AUTHOR]
    }

    fn description(&self) -> &'static str {
        "Files that change together, and who changes what."
    }

    fn options(&self) -> Vec<ItemOption> {
        vec![ItemOption {
            name: "couples-max-commit-files",
            help: "skip commits touching more files than this",
            default: OptionValue::Int(DEFAULT_MAX_COMMIT_FILES),
        }]
    }

    fn configure(&mut self, facts: &mut Facts) -> Result<()> {
        let max = facts.int_option("couples-max-commit-files", DEFAULT_MAX_COMMIT_FILES);
        if max <= 0 {
            return Err(Error::config(format!(
                "couples-max-commit-files must be positive, got {max}"
            )));
        }
        self.max_commit_files = max as usize;
        Ok(())
    }

    fn consume(&mut self, _ctx: &CommitContext, deps: &Bag) -> Result<Bag> {
        let changes = deps.expect::<Vec<TreeChange>>(keys::TREE_CHANGES)?;
        let author = *deps.expect::<i32>(keys::AUTHOR)?;

        let mut paths: Vec<&str> = changes
            .iter()
            .filter(|c| !matches!(c, TreeChange::Delete { .. }))
            .map(|c| c.path())
            .collect();
        paths.sort_unstable();
        paths.dedup();
        if paths.len() > self.max_commit_files {
            return Ok(Bag::new());
        }

        for path in &paths {
            *self
                .people
                .entry(author)
                .or_default()
                .entry(path.to_string())
                .or_insert(0) += 1;
        }
        for (a, b) in paths.iter().tuple_combinations() {
            *self
                .pairs
                .entry((a.to_string(), b.to_string()))
                .or_insert(0) += 1;
        }
        Ok(Bag::new())
    }

    fn one_shot_under_merges(&self) -> bool {
        true
    }

    fn fork(&mut self, n: usize) -> Vec<Box<dyn AnalysisItem>> {
        (0..n)
            .map(|_| {
                Box::new(CouplesItem {
                    max_commit_files: self.max_commit_files,
                    pairs: self.pairs.clone(),
                    people: self.people.clone(),
                    pairs_base: self.pairs.clone(),
                    people_base: self.people.clone(),
                }) as Box<dyn AnalysisItem>
            })
            .collect()
    }

    fn merge(&mut self, others: Vec<Box<dyn AnalysisItem>>) {
        for other in others {
            let other = other
                .as_any()
                .downcast_ref::<CouplesItem>()
                .expect("merging couples instances");
            add_pairs(&mut self.pairs, &other.pairs, 1);
            add_pairs(&mut self.pairs, &other.pairs_base, -1);
            add_people(&mut self.people, &other.people, 1);
            add_people(&mut self.people, &other.people_base, -1);
        }
    }

    fn finalise(&mut self) -> Option<Box<dyn Report>> {
        Some(Box::new(CouplesReport {
            file_pairs: self
                .pairs
                .iter()
                .filter(|(_, &n)| n > 0)
                .map(|((a, b), &n)| (a.clone(), b.clone(), n))
                .collect(),
            people_files: self.people.clone(),
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
// CouplesReport
// -------------------------------------------------------------------------------------------------
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CouplesReport {
    pub file_pairs: Vec<(String, String, u64)>,
    pub people_files: PeopleFiles,
}

impl Report for CouplesReport {
    fn write_text(&self, out: &mut TextWriter<'_>) -> io::Result<()> {
        out.open("file_pairs")?;
        for (a, b, n) in &self.file_pairs {
            out.field(format!("{:?} & {:?}", a, b), n)?;
        }
        out.close();
        out.open("people_files")?;
        for (author, files) in &self.people_files {
            out.array(
                author,
                files.iter().map(|(path, n)| format!("{path:?}: {n}")),
            )?;
        }
        out.close();
        Ok(())
    }

    fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::config(e.to_string()))
    }
}
