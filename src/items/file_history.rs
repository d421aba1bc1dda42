use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io;

use crate::errors::{Error, Result};
use crate::item::{keys, AnalysisItem, Bag, CommitContext, Facts, Key};
use crate::report::{Report, TextWriter};
use crate::tree_changes::TreeChange;

/// The recorded life of one path.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileLog {
    pub created_tick: Option<u32>,
    pub deleted_tick: Option<u32>,
    /// `(tick, from, to)` rename events; their count is the file's
    /// refactoring intensity.
    pub renames: BTreeSet<(u32, String, String)>,
    /// Abbreviated hashes of the commits touching the file.
    pub commits: BTreeSet<String>,
    pub authors: BTreeSet<i32>,
}

impl FileLog {
    fn union(&mut self, other: &FileLog) {
        self.created_tick = match (self.created_tick, other.created_tick) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        // A file deleted on one branch but alive on another survives a merge.
        self.deleted_tick = match (self.deleted_tick, other.deleted_tick) {
            (Some(a), Some(b)) => Some(a.max(b)),
            _ => None,
        };
        self.renames.extend(other.renames.iter().cloned());
        self.commits.extend(other.commits.iter().cloned());
        self.authors.extend(other.authors.iter().copied());
    }
}

// -------------------------------------------------------------------------------------------------
// FileHistoryItem
// -------------------------------------------------------------------------------------------------
/// Per-file lifecycle: creation, deletion, rename chain, contributors, and
/// touch counts. Hotspot risk is read from the touch counts downstream.
pub struct FileHistoryItem {
    files: BTreeMap<String, FileLog>,
}

impl FileHistoryItem {
    pub const NAME: &'static str = "file_history";

    pub fn new() -> FileHistoryItem {
        FileHistoryItem {
            files: BTreeMap::new(),
        }
    }

    fn touch(&mut self, path: &str, commit: &str, author: i32) -> &mut FileLog {
        let log = self.files.entry(path.to_string()).or_default();
        log.commits.insert(commit.to_string());
        log.authors.insert(author);
        log
    }
}

impl Default for FileHistoryItem {
    fn default() -> Self {
        Self::new()
    }
}

impl AnalysisItem for FileHistoryItem {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn flag(&self) -> Option<&'static str> {
        Some("file-history")
    }

    fn requires(&self) -> &'static [Key] {
        &[keys::TREE_CHANGES, keys::AUTHOR, keys::TICK]
    }

    fn description(&self) -> &'static str {
        "Creation, deletion, renames and contributors of every file."
    }

    fn configure(&mut self, _facts: &mut Facts) -> Result<()> {
        Ok(())
    }

    fn consume(&mut self, ctx: &CommitContext, deps: &Bag) -> Result<Bag> {
        let changes = deps.expect::<Vec<TreeChange>>(keys::TREE_CHANGES)?;
        let author = *deps.expect::<i32>(keys::AUTHOR)?;
        let tick = *deps.expect::<u32>(keys::TICK)?;
        let commit = ctx.meta.short_id();

        for change in changes {
            match change {
                TreeChange::Insert { to } => {
                    let log = self.touch(&to.path, &commit, author);
                    log.created_tick.get_or_insert(tick);
                    log.deleted_tick = None;
                }
                TreeChange::Delete { from } => {
                    let log = self.touch(&from.path, &commit, author);
                    log.deleted_tick = Some(tick);
                }
                TreeChange::Modify { to, .. } => {
                    self.touch(&to.path, &commit, author);
                }
                TreeChange::Rename { from, to } => {
                    let mut log = self.files.remove(&from.path).unwrap_or_default();
                    log.commits.insert(commit.clone());
                    log.authors.insert(author);
                    log.renames
                        .insert((tick, from.path.clone(), to.path.clone()));
                    match self.files.get_mut(&to.path) {
                        Some(existing) => existing.union(&log),
                        None => {
                            self.files.insert(to.path.clone(), log);
                        }
                    }
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
                Box::new(FileHistoryItem {
                    files: self.files.clone(),
                }) as Box<dyn AnalysisItem>
            })
            .collect()
    }

    fn merge(&mut self, others: Vec<Box<dyn AnalysisItem>>) {
        // Logs are sets keyed by commit hash, so unioning both branches
        // dedups the shared prefix by construction.
        for other in others {
            let other = other
                .as_any()
                .downcast_ref::<FileHistoryItem>()
                .expect("merging file_history instances");
            for (path, log) in &other.files {
                match self.files.get_mut(path) {
                    Some(mine) => mine.union(log),
                    None => {
                        self.files.insert(path.clone(), log.clone());
                    }
                }
            }
        }
    }

    fn finalise(&mut self) -> Option<Box<dyn Report>> {
        Some(Box::new(FileHistoryReport {
            files: self.files.clone(),
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
// FileHistoryReport
// -------------------------------------------------------------------------------------------------
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHistoryReport {
    pub files: BTreeMap<String, FileLog>,
}

impl Report for FileHistoryReport {
    fn write_text(&self, out: &mut TextWriter<'_>) -> io::Result<()> {
        for (path, log) in &self.files {
            out.open(format!("{path:?}"))?;
            if let Some(t) = log.created_tick {
                out.field("created_tick", t)?;
            }
            if let Some(t) = log.deleted_tick {
                out.field("deleted_tick", t)?;
            }
            out.field("touches", log.commits.len())?;
            out.array("authors", log.authors.iter())?;
            if !log.renames.is_empty() {
                out.array(
                    "renames",
                    log.renames
                        .iter()
                        .map(|(t, from, to)| format!("{t}: {from:?} -> {to:?}")),
                )?;
            }
            out.close();
        }
        Ok(())
    }

    fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::config(e.to_string()))
    }
}
