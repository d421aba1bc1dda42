use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::rc::Rc;

use crate::attribution::{LineCensus, LineChange, MERGE_MARK_AUTHOR};
use crate::errors::{Error, Result};
use crate::identity::{IdentityResolver, MISSING_AUTHOR};
use crate::item::{keys, AnalysisItem, Bag, CommitContext, Facts, ItemOption, Key, OptionValue};
use crate::report::{Report, TextWriter};

pub const DEFAULT_GRANULARITY: i64 = 30;
pub const DEFAULT_SAMPLING: i64 = 30;

/// Alive-line counts keyed by the band (granularity-sized group of ticks) the
/// lines were written in.
type Bands = BTreeMap<u32, i64>;

// -------------------------------------------------------------------------------------------------
// BurndownItem
// -------------------------------------------------------------------------------------------------
/// Code burndown: how many lines written in each band are still alive, sampled
/// over time, for the whole project and optionally per author.
pub struct BurndownItem {
    granularity: u32,
    sampling: u32,
    track_people: bool,
    resolver: Option<Rc<IdentityResolver>>,

    alive: Bands,
    people_alive: BTreeMap<i32, Bands>,
    history: BTreeMap<u32, Bands>,
    people_history: BTreeMap<i32, BTreeMap<u32, Bands>>,
    last_sample: Option<u32>,
    last_tick: u32,
}

impl BurndownItem {
    pub const NAME: &'static str = "burndown";

    pub fn new() -> BurndownItem {
        BurndownItem {
            granularity: DEFAULT_GRANULARITY as u32,
            sampling: DEFAULT_SAMPLING as u32,
            track_people: false,
            resolver: None,
            alive: BTreeMap::new(),
            people_alive: BTreeMap::new(),
            history: BTreeMap::new(),
            people_history: BTreeMap::new(),
            last_sample: None,
            last_tick: 0,
        }
    }

    fn band(&self, tick: u32) -> u32 {
        tick / self.granularity
    }

    fn author_key(author: i32) -> i32 {
        if author == MERGE_MARK_AUTHOR {
            MISSING_AUTHOR
        } else {
            author
        }
    }

    fn snapshot(&mut self, sample: u32) {
        self.history.insert(sample, self.alive.clone());
        if self.track_people {
            for (&author, bands) in &self.people_alive {
                self.people_history
                    .entry(author)
                    .or_default()
                    .insert(sample, bands.clone());
            }
        }
    }

    fn advance_to(&mut self, tick: u32) {
        let sample = tick / self.sampling;
        if let Some(last) = self.last_sample {
            if sample > last {
                self.snapshot(last);
            }
        }
        self.last_sample = Some(sample);
        self.last_tick = self.last_tick.max(tick);
    }

    fn rebase(&mut self, census: &LineCensus) {
        self.alive.clear();
        self.people_alive.clear();
        for &(tag, lines) in census {
            let band = self.band(tag.tick);
            *self.alive.entry(band).or_insert(0) += lines;
            if self.track_people {
                *self
                    .people_alive
                    .entry(Self::author_key(tag.author))
                    .or_default()
                    .entry(band)
                    .or_insert(0) += lines;
            }
        }
    }

    fn apply(&mut self, change: &LineChange) {
        let (author, band) = if change.delta > 0 {
            (change.curr.author, self.band(change.curr.tick))
        } else {
            (change.prev.author, self.band(change.prev.tick))
        };
        *self.alive.entry(band).or_insert(0) += change.delta;
        if self.track_people {
            *self
                .people_alive
                .entry(Self::author_key(author))
                .or_default()
                .entry(band)
                .or_insert(0) += change.delta;
        }
    }
}

impl Default for BurndownItem {
    fn default() -> Self {
        Self::new()
    }
}

impl AnalysisItem for BurndownItem {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn flag(&self) -> Option<&'static str> {
        Some("burndown")
    }

    fn requires(&self) -> &'static [Key] {
        &[keys::LINE_CHANGES, keys::AUTHOR, keys::TICK]
    }

    fn description(&self) -> &'static str {
        "Line burndown over time: how much code from each period is still alive."
    }

    fn options(&self) -> Vec<ItemOption> {
        vec![
            ItemOption {
                name: "burndown-granularity",
                help: "how many ticks of written code form one band",
                default: OptionValue::Int(DEFAULT_GRANULARITY),
            },
            ItemOption {
                name: "burndown-sampling",
                help: "how many ticks pass between two recorded snapshots",
                default: OptionValue::Int(DEFAULT_SAMPLING),
            },
            ItemOption {
                name: "burndown-people",
                help: "track per-author burndown bands as well",
                default: OptionValue::Bool(false),
            },
        ]
    }

    fn configure(&mut self, facts: &mut Facts) -> Result<()> {
        let granularity = facts.int_option("burndown-granularity", DEFAULT_GRANULARITY);
        let sampling = facts.int_option("burndown-sampling", DEFAULT_SAMPLING);
        if granularity <= 0 || sampling <= 0 {
            return Err(Error::config(format!(
                "burndown granularity and sampling must be positive, got {granularity}/{sampling}"
            )));
        }
        self.granularity = granularity as u32;
        self.sampling = sampling as u32;
        self.track_people = facts.bool_option("burndown-people", false);
        self.resolver = facts.identity.clone();
        Ok(())
    }

    fn consume(&mut self, _ctx: &CommitContext, deps: &Bag) -> Result<Bag> {
        let tick = *deps.expect::<u32>(keys::TICK)?;
        self.advance_to(tick);
        if let Some(census) = deps.get::<LineCensus>(keys::LINE_CENSUS) {
            self.rebase(census);
        }
        for change in deps.expect::<Vec<LineChange>>(keys::LINE_CHANGES)? {
            self.apply(change);
        }
        Ok(Bag::new())
    }

    fn one_shot_under_merges(&self) -> bool {
        true
    }

    fn fork(&mut self, n: usize) -> Vec<Box<dyn AnalysisItem>> {
        (0..n)
            .map(|_| {
                Box::new(BurndownItem {
                    granularity: self.granularity,
                    sampling: self.sampling,
                    track_people: self.track_people,
                    resolver: self.resolver.clone(),
                    alive: self.alive.clone(),
                    people_alive: self.people_alive.clone(),
                    history: self.history.clone(),
                    people_history: self.people_history.clone(),
                    last_sample: self.last_sample,
                    last_tick: self.last_tick,
                }) as Box<dyn AnalysisItem>
            })
            .collect()
    }

    fn merge(&mut self, others: Vec<Box<dyn AnalysisItem>>) {
        // Alive bands are rebased from the census the attribution engine
        // emits right after the merge; only the divergent snapshots need
        // keeping, and the survivor's view wins on conflicts.
        for other in others {
            let other = other
                .as_any()
                .downcast_ref::<BurndownItem>()
                .expect("merging burndown instances");
            for (&sample, bands) in &other.history {
                self.history.entry(sample).or_insert_with(|| bands.clone());
            }
            for (&author, samples) in &other.people_history {
                let mine = self.people_history.entry(author).or_default();
                for (&sample, bands) in samples {
                    mine.entry(sample).or_insert_with(|| bands.clone());
                }
            }
            self.last_tick = self.last_tick.max(other.last_tick);
        }
    }

    fn finalise(&mut self) -> Option<Box<dyn Report>> {
        if let Some(last) = self.last_sample {
            self.snapshot(last);
        }
        let people = if self.track_people {
            let resolver = self.resolver.as_ref();
            self.people_history
                .iter()
                .map(|(&author, samples)| {
                    let name = resolver
                        .map(|r| r.friendly_name(author))
                        .unwrap_or_else(|| author.to_string());
                    (name, samples.clone())
                })
                .collect()
        } else {
            BTreeMap::new()
        };
        Some(Box::new(BurndownReport {
            granularity: self.granularity,
            sampling: self.sampling,
            project: self.history.clone(),
            people,
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
// BurndownReport
// -------------------------------------------------------------------------------------------------
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BurndownReport {
    pub granularity: u32,
    pub sampling: u32,
    /// sample index → band → alive lines.
    pub project: BTreeMap<u32, Bands>,
    /// author name → sample index → band → alive lines.
    pub people: BTreeMap<String, BTreeMap<u32, Bands>>,
}

impl Report for BurndownReport {
    fn write_text(&self, out: &mut TextWriter<'_>) -> io::Result<()> {
        out.field("granularity", self.granularity)?;
        out.field("sampling", self.sampling)?;
        out.open("project")?;
        for (sample, bands) in &self.project {
            out.array(sample, bands.iter().map(|(b, n)| format!("{b}: {n}")))?;
        }
        out.close();
        if !self.people.is_empty() {
            out.open("people")?;
            for (name, samples) in &self.people {
                out.open(format!("{name:?}"))?;
                for (sample, bands) in samples {
                    out.array(sample, bands.iter().map(|(b, n)| format!("{b}: {n}")))?;
                }
                out.close();
            }
            out.close();
        }
        Ok(())
    }

    fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::config(e.to_string()))
    }
}
