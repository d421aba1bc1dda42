use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::rc::Rc;

use crate::attribution::LineChange;
use crate::errors::{Error, Result};
use crate::identity::IdentityResolver;
use crate::item::{keys, AnalysisItem, Bag, CommitContext, Facts, Key};
use crate::report::{Report, TextWriter};

/// One author's activity within one tick.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevTick {
    pub commits: i64,
    pub lines_added: i64,
    pub lines_removed: i64,
}

impl DevTick {
    fn add(&mut self, other: &DevTick, sign: i64) {
        self.commits += sign * other.commits;
        self.lines_added += sign * other.lines_added;
        self.lines_removed += sign * other.lines_removed;
    }
}

type TickStats = BTreeMap<u32, BTreeMap<i32, DevTick>>;

fn add_stats(dst: &mut TickStats, src: &TickStats, sign: i64) {
    for (&tick, authors) in src {
        let per_tick = dst.entry(tick).or_default();
        for (&author, stats) in authors {
            per_tick.entry(author).or_default().add(stats, sign);
        }
    }
}

// -------------------------------------------------------------------------------------------------
// DevsItem
// -------------------------------------------------------------------------------------------------
/// Team activity over time: per tick and per author, commit counts and line
/// churn. The spread of these numbers across the team is how knowledge
/// diffusion is read downstream.
pub struct DevsItem {
    ticks: TickStats,
    /// State at the last fork; merges add only the divergence beyond it.
    fork_base: TickStats,
    resolver: Option<Rc<IdentityResolver>>,
}

impl DevsItem {
    pub const NAME: &'static str = "devs";

    pub fn new() -> DevsItem {
        DevsItem {
            ticks: TickStats::new(),
            fork_base: TickStats::new(),
            resolver: None,
        }
    }
}

impl Default for DevsItem {
    fn default() -> Self {
        Self::new()
    }
}

impl AnalysisItem for DevsItem {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn flag(&self) -> Option<&'static str> {
        Some("devs")
    }

    fn requires(&self) -> &'static [Key] {
        &[keys::LINE_CHANGES, keys::AUTHOR, keys::TICK]
    }

    fn description(&self) -> &'static str {
        "Per-tick, per-author commit counts and line churn."
    }

    fn configure(&mut self, facts: &mut Facts) -> Result<()> {
        self.resolver = facts.identity.clone();
        Ok(())
    }

    fn consume(&mut self, _ctx: &CommitContext, deps: &Bag) -> Result<Bag> {
        let author = *deps.expect::<i32>(keys::AUTHOR)?;
        let tick = *deps.expect::<u32>(keys::TICK)?;
        let entry = self.ticks.entry(tick).or_default().entry(author).or_default();
        entry.commits += 1;
        for change in deps.expect::<Vec<LineChange>>(keys::LINE_CHANGES)? {
            let entry = self
                .ticks
                .entry(tick)
                .or_default()
                .entry(change.curr.author)
                .or_default();
            if change.delta > 0 {
                entry.lines_added += change.delta;
            } else {
                entry.lines_removed -= change.delta;
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
                Box::new(DevsItem {
                    ticks: self.ticks.clone(),
                    fork_base: self.ticks.clone(),
                    resolver: self.resolver.clone(),
                }) as Box<dyn AnalysisItem>
            })
            .collect()
    }

    fn merge(&mut self, others: Vec<Box<dyn AnalysisItem>>) {
        // Fold in only what each branch accumulated beyond its fork point;
        // the shared prefix is already counted here.
        for other in others {
            let other = other
                .as_any()
                .downcast_ref::<DevsItem>()
                .expect("merging devs instances");
            add_stats(&mut self.ticks, &other.ticks, 1);
            add_stats(&mut self.ticks, &other.fork_base, -1);
        }
    }

    fn finalise(&mut self) -> Option<Box<dyn Report>> {
        let people = match &self.resolver {
            Some(resolver) => {
                let mut names = Vec::with_capacity(resolver.count());
                resolver.for_each(|_, name| names.push(name.to_string()));
                names
            }
            None => Vec::new(),
        };
        Some(Box::new(DevsReport {
            people,
            ticks: self.ticks.clone(),
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
// DevsReport
// -------------------------------------------------------------------------------------------------
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevsReport {
    /// Friendly names, indexed by author id.
    pub people: Vec<String>,
    pub ticks: TickStats,
}

impl Report for DevsReport {
    fn write_text(&self, out: &mut TextWriter<'_>) -> io::Result<()> {
        out.array("people", self.people.iter().map(|n| format!("{n:?}")))?;
        out.open("ticks")?;
        for (tick, authors) in &self.ticks {
            out.array(
                tick,
                authors.iter().map(|(author, s)| {
                    format!(
                        "{author}: {} commits +{} -{}",
                        s.commits, s.lines_added, s.lines_removed
                    )
                }),
            )?;
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
    use crate::attribution::MISSING_TAG;
    use crate::line_index::LineTag;
    use git2::Oid;
    use pretty_assertions::assert_eq;
    use smallvec::SmallVec;

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

    fn deps(author: i32, tick: u32, added: i64, removed: i64) -> Bag {
        let mut changes = Vec::new();
        if added > 0 {
            changes.push(LineChange {
                file: 0,
                prev: MISSING_TAG,
                curr: LineTag::new(author, tick),
                delta: added,
            });
        }
        if removed > 0 {
            changes.push(LineChange {
                file: 0,
                prev: LineTag::new(0, 0),
                curr: LineTag::new(author, tick),
                delta: -removed,
            });
        }
        let mut bag = Bag::new();
        bag.insert(keys::LINE_CHANGES, changes);
        bag.insert(keys::AUTHOR, author);
        bag.insert(keys::TICK, tick);
        bag
    }

    #[test]
    fn churn_accumulates_per_author_and_tick() {
        let mut item = DevsItem::new();
        item.consume(&ctx(), &deps(0, 0, 10, 0)).unwrap();
        item.consume(&ctx(), &deps(0, 0, 5, 2)).unwrap();
        item.consume(&ctx(), &deps(1, 1, 3, 0)).unwrap();

        assert_eq!(
            item.ticks[&0][&0],
            DevTick {
                commits: 2,
                lines_added: 15,
                lines_removed: 2
            }
        );
        assert_eq!(item.ticks[&1][&1].commits, 1);
    }

    #[test]
    fn merge_counts_only_divergence() {
        let mut trunk = DevsItem::new();
        trunk.consume(&ctx(), &deps(0, 0, 10, 0)).unwrap();

        let mut side = trunk.fork(1);
        trunk.consume(&ctx(), &deps(0, 1, 4, 0)).unwrap();
        side[0].consume(&ctx(), &deps(1, 1, 6, 0)).unwrap();
        trunk.merge(side);

        // The shared tick-0 history is not doubled.
        assert_eq!(trunk.ticks[&0][&0].lines_added, 10);
        assert_eq!(trunk.ticks[&0][&0].commits, 1);
        assert_eq!(trunk.ticks[&1][&0].lines_added, 4);
        assert_eq!(trunk.ticks[&1][&1].lines_added, 6);
    }

    #[test]
    fn report_roundtrip() {
        let mut item = DevsItem::new();
        item.consume(&ctx(), &deps(0, 0, 1, 0)).unwrap();
        let report = item.finalise().unwrap();
        let bytes = report.to_bytes().unwrap();
        let decoded: DevsReport = bincode::deserialize(&bytes).unwrap();
        assert_eq!(bincode::serialize(&decoded).unwrap(), bytes);
    }
}
