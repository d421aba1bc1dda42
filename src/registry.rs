use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use crate::attribution::LineHistoryItem;
use crate::errors::{Error, Result};
use crate::item::{AnalysisItem, ItemOption, Key};
use crate::items::burndown::BurndownItem;
use crate::items::couples::CouplesItem;
use crate::items::devs::DevsItem;
use crate::items::file_history::FileHistoryItem;
use crate::items::plumbing::{IdentityItem, TicksItem};
use crate::items::shotness::ShotnessItem;
use crate::items::typos::TyposItem;
use crate::tree_changes::TreeChangesItem;

type Factory = fn() -> Box<dyn AnalysisItem>;

// -------------------------------------------------------------------------------------------------
// Registration
// -------------------------------------------------------------------------------------------------
/// One registered item: the introspection surface captured from a probe
/// instance, plus how to build real instances.
pub struct Registration {
    pub name: &'static str,
    pub flag: Option<&'static str>,
    pub description: &'static str,
    pub provides: &'static [Key],
    pub requires: &'static [Key],
    pub options: Vec<ItemOption>,
    /// Feature gating this registration; `None` is always available.
    pub feature: Option<&'static str>,
    /// Present on enumerable-but-unbuildable stubs; requesting one fails
    /// configuration with this reason.
    pub disabled: Option<&'static str>,
    factory: Option<Factory>,
}

// -------------------------------------------------------------------------------------------------
// Registry
// -------------------------------------------------------------------------------------------------
/// The process-wide catalogue of analysis items. Populated before a run and
/// frozen for its duration; name and flag uniqueness are enforced at
/// registration time.
#[derive(Default)]
pub struct Registry {
    items: BTreeMap<&'static str, Registration>,
    flags: HashMap<&'static str, &'static str>,
    features: BTreeSet<String>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    /// The registry with every built-in item, including the stubs that are
    /// enumerable but disabled in this build.
    pub fn builtin() -> Registry {
        let mut registry = Registry::new();
        registry
            .register(|| Box::new(TreeChangesItem::new()))
            .expect("built-in registration");
        registry
            .register(|| Box::new(IdentityItem::new()))
            .expect("built-in registration");
        registry
            .register(|| Box::new(TicksItem::new()))
            .expect("built-in registration");
        registry
            .register(|| Box::new(LineHistoryItem::new()))
            .expect("built-in registration");
        registry
            .register(|| Box::new(BurndownItem::new()))
            .expect("built-in registration");
        registry
            .register(|| Box::new(DevsItem::new()))
            .expect("built-in registration");
        registry
            .register(|| Box::new(CouplesItem::new()))
            .expect("built-in registration");
        registry
            .register(|| Box::new(FileHistoryItem::new()))
            .expect("built-in registration");
        registry
            .register(|| Box::new(ShotnessItem::new()))
            .expect("built-in registration");
        registry
            .register(|| Box::new(TyposItem::new()))
            .expect("built-in registration");
        registry
            .register_disabled(
                "sentiment",
                Some("sentiment"),
                "Comment sentiment over time.",
                "requires the native sentiment model, which this build does not carry",
            )
            .expect("built-in registration");
        registry
            .register_disabled(
                "uast",
                Some("uast"),
                "Analyses over universal abstract syntax trees.",
                "requires external UAST parser libraries, which this build does not carry",
            )
            .expect("built-in registration");
        registry
    }

    pub fn register(&mut self, factory: Factory) -> Result<()> {
        self.register_gated(factory, None)
    }

    /// Register an item behind a runtime feature flag; it stays enumerable
    /// but unbuildable until `enable_feature` names the flag.
    pub fn register_gated(&mut self, factory: Factory, feature: Option<&'static str>) -> Result<()> {
        let probe = factory();
        let registration = Registration {
            name: probe.name(),
            flag: probe.flag(),
            description: probe.description(),
            provides: probe.provides(),
            requires: probe.requires(),
            options: probe.options(),
            feature,
            disabled: None,
            factory: Some(factory),
        };
        self.admit(registration)
    }

    /// Register an enumerable stub that cannot be built in this configuration.
    pub fn register_disabled(
        &mut self,
        name: &'static str,
        flag: Option<&'static str>,
        description: &'static str,
        reason: &'static str,
    ) -> Result<()> {
        self.admit(Registration {
            name,
            flag,
            description,
            provides: &[],
            requires: &[],
            options: Vec::new(),
            feature: None,
            disabled: Some(reason),
            factory: None,
        })
    }

    fn admit(&mut self, registration: Registration) -> Result<()> {
        if self.items.contains_key(registration.name) {
            return Err(Error::config(format!(
                "analysis item `{}` is already registered",
                registration.name
            )));
        }
        if let Some(flag) = registration.flag {
            if let Some(existing) = self.flags.get(flag) {
                return Err(Error::config(format!(
                    "flag `--{flag}` is claimed by both `{existing}` and `{}`",
                    registration.name
                )));
            }
            self.flags.insert(flag, registration.name);
        }
        self.items.insert(registration.name, registration);
        Ok(())
    }

    pub fn enable_feature(&mut self, feature: &str) {
        self.features.insert(feature.to_string());
    }

    pub fn get(&self, name: &str) -> Option<&Registration> {
        self.items.get(name)
    }

    pub fn find_by_flag(&self, flag: &str) -> Option<&Registration> {
        self.flags.get(flag).and_then(|name| self.items.get(name))
    }

    /// Items meant as analysis endpoints: everything carrying a CLI flag,
    /// disabled stubs included.
    pub fn get_leaves(&self) -> Vec<&Registration> {
        self.items.values().filter(|r| r.flag.is_some()).collect()
    }

    /// Build one item by name; disabled or feature-gated items are a
    /// configuration error naming the reason.
    pub fn summon(&self, name: &str) -> Result<Box<dyn AnalysisItem>> {
        let registration = self
            .items
            .get(name)
            .ok_or_else(|| Error::config(format!("unknown analysis item `{name}`")))?;
        if let Some(reason) = registration.disabled {
            return Err(Error::config(format!(
                "analysis `{name}` is disabled: {reason}"
            )));
        }
        if let Some(feature) = registration.feature {
            if !self.features.contains(feature) {
                return Err(Error::config(format!(
                    "analysis `{name}` needs the `{feature}` feature, which is not enabled"
                )));
            }
        }
        let factory = registration.factory.expect("enabled items carry a factory");
        Ok(factory())
    }

    /// Build the requested leaves plus, transitively, every item providing a
    /// key somebody requires.
    pub fn resolve(&self, names: &[&str]) -> Result<Vec<Box<dyn AnalysisItem>>> {
        let mut provider_of: HashMap<Key, &'static str> = HashMap::new();
        for registration in self.items.values() {
            if registration.disabled.is_some() {
                continue;
            }
            for &key in registration.provides {
                provider_of.insert(key, registration.name);
            }
        }

        let mut selected: Vec<&'static str> = Vec::new();
        let mut queued: BTreeSet<&'static str> = BTreeSet::new();
        let mut queue: VecDeque<&str> = names.iter().copied().collect();
        while let Some(name) = queue.pop_front() {
            let registration = self
                .items
                .get(name)
                .ok_or_else(|| Error::config(format!("unknown analysis item `{name}`")))?;
            if !queued.insert(registration.name) {
                continue;
            }
            selected.push(registration.name);
            for &key in registration.requires {
                match provider_of.get(key) {
                    Some(&provider) => queue.push_back(provider),
                    None => {
                        return Err(Error::UnsatisfiedDependency {
                            item: registration.name.to_string(),
                            key: key.to_string(),
                        })
                    }
                }
            }
        }

        selected.sort();
        selected.into_iter().map(|name| self.summon(name)).collect()
    }
}
