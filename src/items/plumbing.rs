use std::rc::Rc;

use crate::errors::{Error, Result};
use crate::identity::IdentityResolver;
use crate::item::{keys, AnalysisItem, Bag, CommitContext, Facts, ItemOption, Key, OptionValue};
use crate::ticks::{TickClock, DEFAULT_TICK_SECS};

// -------------------------------------------------------------------------------------------------
// IdentityItem
// -------------------------------------------------------------------------------------------------
/// Resolves each commit's author to a stable integer id and publishes the
/// resolver for every other item to use.
pub struct IdentityItem {
    resolver: Option<Rc<IdentityResolver>>,
}

impl IdentityItem {
    pub const NAME: &'static str = "identity";

    pub fn new() -> IdentityItem {
        IdentityItem { resolver: None }
    }
}

impl Default for IdentityItem {
    fn default() -> Self {
        Self::new()
    }
}

impl AnalysisItem for IdentityItem {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn provides(&self) -> &'static [Key] {
        &[keys::AUTHOR]
    }

    fn description(&self) -> &'static str {
        "Maps raw author signatures to stable integer identities."
    }

    fn configure(&mut self, facts: &mut Facts) -> Result<()> {
        if facts.identity.is_none() {
            facts.identity = Some(Rc::new(IdentityResolver::from_signatures(&facts.commits)));
        }
        self.resolver = facts.identity.clone();
        Ok(())
    }

    fn consume(&mut self, ctx: &CommitContext, _deps: &Bag) -> Result<Bag> {
        let resolver = self
            .resolver
            .as_ref()
            .ok_or_else(|| Error::config("identity item consumed before configuration"))?;
        let mut out = Bag::new();
        out.insert(keys::AUTHOR, resolver.id_of_commit(&ctx.meta)?);
        Ok(out)
    }

    fn fork(&mut self, n: usize) -> Vec<Box<dyn AnalysisItem>> {
        (0..n)
            .map(|_| {
                Box::new(IdentityItem {
                    resolver: self.resolver.clone(),
                }) as Box<dyn AnalysisItem>
            })
            .collect()
    }

    fn immutable_under_consume(&self) -> bool {
        true
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

// -------------------------------------------------------------------------------------------------
// TicksItem
// -------------------------------------------------------------------------------------------------
/// Maps each commit's timestamp to its tick index and publishes the clock.
pub struct TicksItem {
    clock: Option<TickClock>,
}

impl TicksItem {
    pub const NAME: &'static str = "ticks";

    pub fn new() -> TicksItem {
        TicksItem { clock: None }
    }
}

impl Default for TicksItem {
    fn default() -> Self {
        Self::new()
    }
}

impl AnalysisItem for TicksItem {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn provides(&self) -> &'static [Key] {
        &[keys::TICK]
    }

    fn description(&self) -> &'static str {
        "Maps commit timestamps to tick indices of configurable duration."
    }

    fn options(&self) -> Vec<ItemOption> {
        vec![ItemOption {
            name: "tick-size",
            help: "tick duration in seconds",
            default: OptionValue::Int(DEFAULT_TICK_SECS),
        }]
    }

    fn configure(&mut self, facts: &mut Facts) -> Result<()> {
        if facts.clock.is_none() {
            let size = facts.int_option("tick-size", DEFAULT_TICK_SECS);
            facts.clock = TickClock::from_commits(&facts.commits, size)?;
        }
        self.clock = facts.clock;
        Ok(())
    }

    fn consume(&mut self, ctx: &CommitContext, _deps: &Bag) -> Result<Bag> {
        let clock = self
            .clock
            .ok_or_else(|| Error::config("ticks item consumed before configuration"))?;
        let mut out = Bag::new();
        out.insert(keys::TICK, clock.tick_of(ctx.meta.when));
        Ok(out)
    }

    fn fork(&mut self, n: usize) -> Vec<Box<dyn AnalysisItem>> {
        (0..n)
            .map(|_| Box::new(TicksItem { clock: self.clock }) as Box<dyn AnalysisItem>)
            .collect()
    }

    fn immutable_under_consume(&self) -> bool {
        true
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use git2::Oid;
    use pretty_assertions::assert_eq;
    use smallvec::SmallVec;

    fn meta(id: u8, name: &str, when: i64) -> crate::commits::CommitMeta {
        crate::commits::CommitMeta {
            id: Oid::from_bytes(&[id; 20]).unwrap(),
            parents: SmallVec::new(),
            tree: Oid::zero(),
            author_name: name.to_string(),
            author_email: format!("{name}@example.com"),
            when,
        }
    }

    fn ctx(meta: crate::commits::CommitMeta) -> CommitContext {
        CommitContext {
            meta,
            branch: 0,
            is_merge: false,
            next_merge: None,
            sequence: 0,
        }
    }

    #[test]
    fn identity_publishes_resolver_and_resolves() {
        let commits = vec![meta(1, "ada", 100), meta(2, "bob", 200)];
        let mut facts = Facts::new(commits.clone());
        let mut item = IdentityItem::new();
        item.configure(&mut facts).unwrap();
        assert!(facts.identity.is_some());

        let out = item.consume(&ctx(commits[1].clone()), &Bag::new()).unwrap();
        assert_eq!(out.get::<i32>(keys::AUTHOR), Some(&1));
    }

    #[test]
    fn ticks_follow_the_configured_size() {
        let commits = vec![meta(1, "ada", 1000), meta(2, "ada", 1000 + 7200)];
        let mut facts = Facts::new(commits.clone());
        facts
            .options
            .insert("tick-size".into(), OptionValue::Int(3600));
        let mut item = TicksItem::new();
        item.configure(&mut facts).unwrap();

        let out = item.consume(&ctx(commits[1].clone()), &Bag::new()).unwrap();
        assert_eq!(out.get::<u32>(keys::TICK), Some(&2));
    }

    #[test]
    fn forks_share_the_resolver() {
        let commits = vec![meta(1, "ada", 100)];
        let mut facts = Facts::new(commits.clone());
        let mut item = IdentityItem::new();
        item.configure(&mut facts).unwrap();
        let mut forked = item.fork(2);
        assert_eq!(forked.len(), 2);
        let out = forked[0].consume(&ctx(commits[0].clone()), &Bag::new()).unwrap();
        assert_eq!(out.get::<i32>(keys::AUTHOR), Some(&0));
        assert!(item.immutable_under_consume());
    }
}
