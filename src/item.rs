use git2::Oid;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::rc::Rc;

use crate::commits::CommitMeta;
use crate::errors::{Error, Result};
use crate::extractor::ExtractorRegistry;
use crate::identity::IdentityResolver;
use crate::plan::BranchIndex;
use crate::report::Report;
use crate::ticks::TickClock;

/// A key into the per-commit bag. Items name what they produce and consume
/// with these; the scheduler orders items so producers run first.
pub type Key = &'static str;

/// The bag keys produced by the built-in plumbing items.
pub mod keys {
    use super::Key;

    /// `Vec<TreeChange>`: the commit's typed tree diff.
    pub const TREE_CHANGES: Key = "tree_changes";
    /// `i32`: the resolved author identity of the commit.
    pub const AUTHOR: Key = "author";
    /// `u32`: the tick index of the commit.
    pub const TICK: Key = "tick";
    /// `Vec<LineChange>`: the line-attribution deltas of the commit.
    pub const LINE_CHANGES: Key = "line_changes";
    /// `Vec<CensusEntry>`: full live-line census, emitted once after a merge.
    pub const LINE_CENSUS: Key = "line_census";
}

// -------------------------------------------------------------------------------------------------
// Bag
// -------------------------------------------------------------------------------------------------
/// The per-commit key→value bag. Each item's consume output is folded in so
/// that downstream items can read it; values are shared, never mutated.
#[derive(Default)]
pub struct Bag {
    values: HashMap<Key, Rc<dyn Any>>,
}

impl Bag {
    pub fn new() -> Bag {
        Bag::default()
    }

    pub fn insert<T: 'static>(&mut self, key: Key, value: T) {
        self.values.insert(key, Rc::new(value));
    }

    pub fn get<T: 'static>(&self, key: Key) -> Option<&T> {
        self.values.get(key).and_then(|v| v.downcast_ref::<T>())
    }

    /// Fetch a value an upstream item is contractually obliged to have
    /// produced; the scheduler's dependency check makes absence a bug.
    pub fn expect<T: 'static>(&self, key: Key) -> Result<&T> {
        self.get(key).ok_or_else(|| {
            Error::config(format!("bag key `{key}` missing or of the wrong type"))
        })
    }

    pub fn contains(&self, key: Key) -> bool {
        self.values.contains_key(key)
    }

    /// Fold another bag's entries into this one.
    pub fn absorb(&mut self, other: Bag) {
        self.values.extend(other.values);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

// -------------------------------------------------------------------------------------------------
// options
// -------------------------------------------------------------------------------------------------
/// A typed option value, parsed from the command line or supplied by a caller.
#[derive(Clone, Debug, PartialEq)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Text(String),
}

impl OptionValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            OptionValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            OptionValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            OptionValue::Text(v) => Some(v),
            _ => None,
        }
    }
}

/// One introspectable item option, surfaced on the command line as
/// `--<name> <value>`.
#[derive(Clone, Debug)]
pub struct ItemOption {
    pub name: &'static str,
    pub help: &'static str,
    pub default: OptionValue,
}

// -------------------------------------------------------------------------------------------------
// Facts
// -------------------------------------------------------------------------------------------------
/// Shared configuration handed to every item at configure time. Plumbing items
/// publish the resolvers they build (identity, tick clock) back into the facts
/// so downstream configuration can see them.
pub struct Facts {
    pub repository: Option<Rc<git2::Repository>>,
    /// Human-readable locator of the repository, for report headers.
    pub repository_uri: String,
    pub commits: Rc<Vec<CommitMeta>>,
    pub head: Option<Oid>,
    pub identity: Option<Rc<IdentityResolver>>,
    pub clock: Option<TickClock>,
    pub extractors: Rc<ExtractorRegistry>,
    pub options: BTreeMap<String, OptionValue>,
    /// Upper bound on intra-commit parallelism.
    pub workers: usize,
    /// Scratch directory for spill files.
    pub scratch_dir: PathBuf,
}

impl Facts {
    pub fn new(commits: Vec<CommitMeta>) -> Facts {
        Facts {
            repository: None,
            repository_uri: String::new(),
            commits: Rc::new(commits),
            head: None,
            identity: None,
            clock: None,
            extractors: Rc::new(ExtractorRegistry::default()),
            options: BTreeMap::new(),
            workers: 1,
            scratch_dir: std::env::temp_dir(),
        }
    }

    pub fn bool_option(&self, name: &str, default: bool) -> bool {
        self.options
            .get(name)
            .and_then(|v| v.as_bool())
            .unwrap_or(default)
    }

    pub fn int_option(&self, name: &str, default: i64) -> i64 {
        self.options
            .get(name)
            .and_then(|v| v.as_int())
            .unwrap_or(default)
    }

    pub fn text_option<'a>(&'a self, name: &str, default: &'a str) -> &'a str {
        self.options
            .get(name)
            .and_then(|v| v.as_text())
            .unwrap_or(default)
    }
}

// -------------------------------------------------------------------------------------------------
// CommitContext
// -------------------------------------------------------------------------------------------------
/// Everything the scheduler knows about the commit being consumed.
#[derive(Clone, Debug)]
pub struct CommitContext {
    pub meta: CommitMeta,
    pub branch: BranchIndex,
    pub is_merge: bool,
    /// The merge this commit's work eventually flows into, when traceback was
    /// requested and one exists.
    pub next_merge: Option<Oid>,
    /// Zero-based position of this consume step within the run.
    pub sequence: usize,
}

// -------------------------------------------------------------------------------------------------
// AnalysisItem
// -------------------------------------------------------------------------------------------------
/// The contract every analysis item implements.
///
/// Instances are value-like: the scheduler owns one list of them per branch,
/// forks produce independent successors, merges reconcile them. Items must not
/// retain references into the bag across consume calls.
pub trait AnalysisItem {
    /// Unique key of this item.
    fn name(&self) -> &'static str;

    /// Bag keys this item writes for downstream items.
    fn provides(&self) -> &'static [Key] {
        &[]
    }

    /// Bag keys this item reads; each must be provided by some selected item.
    fn requires(&self) -> &'static [Key] {
        &[]
    }

    fn description(&self) -> &'static str;

    /// The command-line flag enabling this item. Leaf analyses return one;
    /// plumbing items, resolved only through dependencies, return `None`.
    fn flag(&self) -> Option<&'static str> {
        None
    }

    /// Options surfaced on the command line.
    fn options(&self) -> Vec<ItemOption> {
        Vec::new()
    }

    /// Accept shared configuration. Called exactly once per instance before
    /// initialisation; plumbing items may publish resolvers into `facts`.
    fn configure(&mut self, _facts: &mut Facts) -> Result<()> {
        Ok(())
    }

    /// Allocate branch-local state for the root branch.
    fn initialise(&mut self, _facts: &Facts) -> Result<()> {
        Ok(())
    }

    /// Consume one commit; the returned bag is folded into the per-commit bag
    /// visible to downstream items. Errors abort the run.
    fn consume(&mut self, ctx: &CommitContext, deps: &Bag) -> Result<Bag>;

    /// Produce `n` independent successors for newly forked branches. Items
    /// that are immutable under consume may return cheap handles to shared
    /// state; items that mutate must deep-clone.
    fn fork(&mut self, n: usize) -> Vec<Box<dyn AnalysisItem>>;

    /// Reconcile this instance (the canonical survivor, smallest incoming
    /// branch index) with the instances of the other merged branches, given in
    /// ascending branch order.
    fn merge(&mut self, _others: Vec<Box<dyn AnalysisItem>>) {}

    /// Items that must observe each distinct merge commit exactly once,
    /// regardless of how many branches replay it, declare themselves here.
    fn one_shot_under_merges(&self) -> bool {
        false
    }

    /// Declares that consume never mutates this item, licensing shared-state
    /// forks. Advisory; `fork` remains the operative mechanism.
    fn immutable_under_consume(&self) -> bool {
        false
    }

    /// Serialise branch-local state for hibernation. `None` opts out (state
    /// stays resident); `Some` must be restorable bit-identically by `boot`.
    fn hibernate(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    /// Restore state previously produced by `hibernate`.
    fn boot(&mut self, _bytes: &[u8]) -> Result<()> {
        Ok(())
    }

    /// Invoked when the owning branch is deleted.
    fn dispose(&mut self) {}

    /// Produce the final result. Leaf items return a report; plumbing items
    /// return `None`.
    fn finalise(&mut self) -> Option<Box<dyn Report>> {
        None
    }

    /// Downcasting support, so `merge` implementations can reach the concrete
    /// state of the instances handed to them.
    fn as_any(&self) -> &dyn std::any::Any;

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any;
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn bag_roundtrip_and_types() {
        let mut bag = Bag::new();
        bag.insert(keys::AUTHOR, 7i32);
        bag.insert(keys::TICK, 3u32);
        assert_eq!(bag.get::<i32>(keys::AUTHOR), Some(&7));
        assert_eq!(bag.get::<u32>(keys::AUTHOR), None, "wrong type is None");
        assert_eq!(bag.expect::<u32>(keys::TICK).unwrap(), &3);
        assert!(bag.expect::<u32>(keys::LINE_CHANGES).is_err());
    }

    #[test]
    fn bag_absorb_overlays() {
        let mut a = Bag::new();
        a.insert(keys::AUTHOR, 1i32);
        let mut b = Bag::new();
        b.insert(keys::TICK, 9u32);
        a.absorb(b);
        assert_eq!(a.len(), 2);
        assert_eq!(a.get::<u32>(keys::TICK), Some(&9));
    }

    #[test]
    fn facts_option_lookup() {
        let mut facts = Facts::new(Vec::new());
        facts
            .options
            .insert("burndown-people".into(), OptionValue::Bool(true));
        facts
            .options
            .insert("tick-size".into(), OptionValue::Int(3600));
        assert!(facts.bool_option("burndown-people", false));
        assert_eq!(facts.int_option("tick-size", 86400), 3600);
        assert_eq!(facts.int_option("absent", 86400), 86400);
        assert_eq!(facts.text_option("absent", "x"), "x");
    }
}
