use chrono::{TimeZone, Utc};
use git2::Oid;
use std::cell::RefCell;
use std::collections::HashMap;

use crate::commits::{short_hash, CommitMeta};
use crate::errors::{Error, Result};

/// Sentinel author id for unknown or irrelevant authors.
pub const MISSING_AUTHOR: i32 = -1;
/// Friendly name reported for the sentinel id.
pub const MISSING_NAME: &str = "<unidentified>";

// -------------------------------------------------------------------------------------------------
// IdentityResolver
// -------------------------------------------------------------------------------------------------
/// Maps commit authorship to stable integer identities.
///
/// Two strategies. *Signature* mode matches case-insensitively on either the
/// author name or the email; first seen wins, and the resolver is immutable
/// once built from the commit set. *Story* mode collapses commits to ids via a
/// caller-supplied hash→group-name mapping, optionally auto-expanding with
/// synthetic names up to a cap; it stays mutable until the cap is reached.
pub struct IdentityResolver {
    names: RefCell<Vec<String>>,
    mode: Mode,
}

enum Mode {
    Signatures { by_alias: HashMap<String, i32> },
    Stories(RefCell<StoryState>),
}

struct StoryState {
    by_commit: HashMap<Oid, i32>,
    by_name: HashMap<String, i32>,
    auto_expand: bool,
    cap: usize,
    synthesised: usize,
}

impl IdentityResolver {
    /// Build a signature-mode resolver from the commit set.
    pub fn from_signatures(commits: &[CommitMeta]) -> IdentityResolver {
        let mut by_alias: HashMap<String, i32> = HashMap::new();
        let mut names: Vec<String> = Vec::new();
        for meta in commits {
            let name_key = meta.author_name.to_lowercase();
            let email_key = meta.author_email.to_lowercase();
            let known = by_alias
                .get(&name_key)
                .or_else(|| by_alias.get(&email_key))
                .copied();
            let id = match known {
                Some(id) => id,
                None => {
                    let id = names.len() as i32;
                    names.push(format!("{} <{}>", meta.author_name, meta.author_email));
                    id
                }
            };
            by_alias.entry(name_key).or_insert(id);
            by_alias.entry(email_key).or_insert(id);
        }
        IdentityResolver {
            names: RefCell::new(names),
            mode: Mode::Signatures { by_alias },
        }
    }

    /// Build a story-mode resolver from a commit→group-name mapping.
    pub fn from_stories(
        stories: HashMap<Oid, String>,
        auto_expand: bool,
        cap: usize,
    ) -> IdentityResolver {
        let mut names: Vec<String> = Vec::new();
        let mut by_name: HashMap<String, i32> = HashMap::new();
        let mut by_commit: HashMap<Oid, i32> = HashMap::new();
        let mut ordered: Vec<(Oid, String)> = stories.into_iter().collect();
        ordered.sort();
        for (oid, story) in ordered {
            let id = *by_name.entry(story.clone()).or_insert_with(|| {
                let id = names.len() as i32;
                names.push(story);
                id
            });
            by_commit.insert(oid, id);
        }
        IdentityResolver {
            names: RefCell::new(names),
            mode: Mode::Stories(RefCell::new(StoryState {
                by_commit,
                by_name,
                auto_expand,
                cap,
                synthesised: 0,
            })),
        }
    }

    /// Resolve a raw `(name, email)` signature. Only meaningful in signature
    /// mode; story mode resolves whole commits.
    pub fn id_of(&self, name: &str, email: &str) -> i32 {
        match &self.mode {
            Mode::Signatures { by_alias } => by_alias
                .get(&name.to_lowercase())
                .or_else(|| by_alias.get(&email.to_lowercase()))
                .copied()
                .unwrap_or(MISSING_AUTHOR),
            Mode::Stories(_) => MISSING_AUTHOR,
        }
    }

    /// Resolve the author identity of a commit.
    pub fn id_of_commit(&self, meta: &CommitMeta) -> Result<i32> {
        match &self.mode {
            Mode::Signatures { .. } => Ok(self.id_of(&meta.author_name, &meta.author_email)),
            Mode::Stories(state) => {
                let mut state = state.borrow_mut();
                if let Some(&id) = state.by_commit.get(&meta.id) {
                    return Ok(id);
                }
                if !state.auto_expand {
                    return Ok(MISSING_AUTHOR);
                }
                if state.synthesised >= state.cap {
                    return Err(Error::config(format!(
                        "commit {} has no story and the synthetic-name cap ({}) is exhausted",
                        meta.short_id(),
                        state.cap
                    )));
                }
                state.synthesised += 1;
                let date = Utc
                    .timestamp_opt(meta.when, 0)
                    .single()
                    .map(|t| t.format("%Y-%m-%d").to_string())
                    .unwrap_or_else(|| "?".to_string());
                let name = format!(
                    "Merge #{} {} {}",
                    state.synthesised,
                    short_hash(&meta.id),
                    date
                );
                let mut names = self.names.borrow_mut();
                let id = names.len() as i32;
                names.push(name.clone());
                state.by_name.insert(name, id);
                state.by_commit.insert(meta.id, id);
                Ok(id)
            }
        }
    }

    /// The friendly name for an id; `MISSING_NAME` for the sentinel or any
    /// id this resolver never allocated.
    pub fn friendly_name(&self, id: i32) -> String {
        if id < 0 {
            return MISSING_NAME.to_string();
        }
        self.names
            .borrow()
            .get(id as usize)
            .cloned()
            .unwrap_or_else(|| MISSING_NAME.to_string())
    }

    pub fn count(&self) -> usize {
        self.names.borrow().len()
    }

    pub fn for_each<F: FnMut(i32, &str)>(&self, mut f: F) {
        for (i, name) in self.names.borrow().iter().enumerate() {
            f(i as i32, name);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use smallvec::SmallVec;

    fn meta(id: u8, name: &str, email: &str) -> CommitMeta {
        CommitMeta {
            id: Oid::from_bytes(&[id; 20]).unwrap(),
            parents: SmallVec::new(),
            tree: Oid::zero(),
            author_name: name.to_string(),
            author_email: email.to_string(),
            when: 1_700_000_000,
        }
    }

    #[test]
    fn signature_mode_matches_name_or_email() {
        let commits = vec![
            meta(1, "Vadim", "v@example.com"),
            meta(2, "vadim", "other@example.com"), // same name, new email
            meta(3, "Somebody", "v@example.com"),  // same email, new name
            meta(4, "Eve", "eve@example.com"),
        ];
        let resolver = IdentityResolver::from_signatures(&commits);
        assert_eq!(resolver.count(), 2);
        assert_eq!(resolver.id_of("VADIM", "nope"), 0);
        assert_eq!(resolver.id_of("nope", "V@EXAMPLE.COM"), 0);
        assert_eq!(resolver.id_of("eve", "x"), 1);
        assert_eq!(resolver.id_of("ghost", "ghost@example.com"), MISSING_AUTHOR);
        assert_eq!(resolver.friendly_name(0), "Vadim <v@example.com>");
        assert_eq!(resolver.friendly_name(MISSING_AUTHOR), MISSING_NAME);
    }

    #[test]
    fn first_seen_wins() {
        let commits = vec![meta(1, "A", "a@x"), meta(2, "B", "a@x")];
        let resolver = IdentityResolver::from_signatures(&commits);
        assert_eq!(resolver.count(), 1);
        assert_eq!(resolver.friendly_name(0), "A <a@x>");
    }

    #[test]
    fn story_mode_auto_expands_to_cap() {
        let mut stories = HashMap::new();
        stories.insert(Oid::from_bytes(&[1; 20]).unwrap(), "alpha".to_string());
        let resolver = IdentityResolver::from_stories(stories, true, 1);
        assert_eq!(resolver.id_of_commit(&meta(1, "x", "y")).unwrap(), 0);
        // First unknown commit synthesises a name...
        let id = resolver.id_of_commit(&meta(2, "x", "y")).unwrap();
        assert_eq!(id, 1);
        assert!(resolver.friendly_name(id).starts_with("Merge #1 "));
        // ...repeat lookups are stable...
        assert_eq!(resolver.id_of_commit(&meta(2, "x", "y")).unwrap(), 1);
        // ...and the next unknown commit exceeds the cap.
        assert!(resolver.id_of_commit(&meta(3, "x", "y")).is_err());
    }

    #[test]
    fn for_each_enumerates_in_id_order() {
        let commits = vec![meta(1, "A", "a@x"), meta(2, "B", "b@x")];
        let resolver = IdentityResolver::from_signatures(&commits);
        let mut seen = Vec::new();
        resolver.for_each(|id, name| seen.push((id, name.to_string())));
        assert_eq!(seen, vec![(0, "A <a@x>".into()), (1, "B <b@x>".into())]);
    }
}
