//! Hierarchical gameplay tags and the tag-count multiset owners carry.
//!
//! Tags are dotted paths. Holding `status.stun.hard` also counts as holding
//! `status.stun` and `status` for queries, but only the exact tag is
//! "explicit".

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GameplayTag(Arc<str>);

impl GameplayTag {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref().trim_matches('.')))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True if `self` is `other` or a descendant of it.
    pub fn matches(&self, other: &GameplayTag) -> bool {
        let (mine, theirs) = (self.as_str(), other.as_str());
        mine == theirs
            || (mine.len() > theirs.len()
                && mine.starts_with(theirs)
                && mine.as_bytes()[theirs.len()] == b'.')
    }

    /// Every proper ancestor, nearest first.
    pub fn parents(&self) -> impl Iterator<Item = GameplayTag> + '_ {
        let name = self.as_str();
        name.rmatch_indices('.')
            .map(move |(idx, _)| GameplayTag::new(&name[..idx]))
    }
}

impl fmt::Display for GameplayTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for GameplayTag {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Reference-counted tag multiset.
#[derive(Clone, Debug, Default)]
pub struct TagCountContainer {
    explicit: BTreeMap<GameplayTag, i32>,
    implied: BTreeMap<GameplayTag, i32>,
}

impl TagCountContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `delta` references to `tag`. Returns true when the presence of the
    /// tag (or one of its parents) flipped, which is when ongoing requirements
    /// need a re-check.
    pub fn update_count(&mut self, tag: &GameplayTag, delta: i32) -> bool {
        if delta == 0 {
            return false;
        }

        let explicit = self.explicit.entry(tag.clone()).or_insert(0);
        let before = *explicit;
        *explicit = (before + delta).max(0);
        if *explicit == 0 {
            self.explicit.remove(tag);
        }

        let mut flipped = false;
        for t in std::iter::once(tag.clone()).chain(tag.parents()) {
            let count = self.implied.entry(t.clone()).or_insert(0);
            let was_present = *count > 0;
            *count = (*count + delta).max(0);
            let present = *count > 0;
            if present != was_present {
                flipped = true;
            }
            if !present {
                self.implied.remove(&t);
            }
        }
        flipped
    }

    /// Count for `tag`, including descendants.
    pub fn count(&self, tag: &GameplayTag) -> i32 {
        self.implied.get(tag).copied().unwrap_or(0)
    }

    pub fn explicit_count(&self, tag: &GameplayTag) -> i32 {
        self.explicit.get(tag).copied().unwrap_or(0)
    }

    pub fn has_tag(&self, tag: &GameplayTag) -> bool {
        self.count(tag) > 0
    }

    pub fn has_all<'a>(&self, tags: impl IntoIterator<Item = &'a GameplayTag>) -> bool {
        tags.into_iter().all(|t| self.has_tag(t))
    }

    pub fn has_any<'a>(&self, tags: impl IntoIterator<Item = &'a GameplayTag>) -> bool {
        tags.into_iter().any(|t| self.has_tag(t))
    }

    pub fn explicit_tags(&self) -> impl Iterator<Item = &GameplayTag> {
        self.explicit.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.explicit.is_empty()
    }
}

/// `require` must all be present and none of `ignore` may be.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TagRequirements {
    pub require: Vec<GameplayTag>,
    pub ignore: Vec<GameplayTag>,
}

impl TagRequirements {
    pub fn is_empty(&self) -> bool {
        self.require.is_empty() && self.ignore.is_empty()
    }

    pub fn requirements_met(&self, tags: &TagCountContainer) -> bool {
        tags.has_all(&self.require) && !tags.has_any(&self.ignore)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_queries_match_children() {
        let mut tags = TagCountContainer::new();
        let hard = GameplayTag::new("status.stun.hard");
        tags.update_count(&hard, 1);

        assert!(tags.has_tag(&"status.stun".into()));
        assert!(tags.has_tag(&"status".into()));
        assert!(!tags.has_tag(&"status.stun.soft".into()));
        assert_eq!(tags.explicit_count(&"status.stun".into()), 0);
    }

    #[test]
    fn counts_are_reference_counted() {
        let mut tags = TagCountContainer::new();
        let burning = GameplayTag::new("state.burning");
        assert!(tags.update_count(&burning, 1));
        assert!(!tags.update_count(&burning, 1));
        assert!(!tags.update_count(&burning, -1));
        assert!(tags.has_tag(&burning));
        assert!(tags.update_count(&burning, -1));
        assert!(tags.is_empty());
        assert_eq!(tags.count(&"state".into()), 0);
    }

    #[test]
    fn matches_respects_segment_boundaries() {
        let tag = GameplayTag::new("ability.fireball");
        assert!(tag.matches(&"ability".into()));
        assert!(!tag.matches(&"ability.fire".into()));
        let parents: Vec<_> = GameplayTag::new("a.b.c").parents().collect();
        assert_eq!(parents, vec![GameplayTag::new("a.b"), GameplayTag::new("a")]);
    }

    #[test]
    fn requirements_combine_require_and_ignore() {
        let mut tags = TagCountContainer::new();
        let reqs = TagRequirements {
            require: vec!["buff.haste".into()],
            ignore: vec!["status.silenced".into()],
        };
        assert!(!reqs.requirements_met(&tags));
        tags.update_count(&"buff.haste".into(), 1);
        assert!(reqs.requirements_met(&tags));
        tags.update_count(&"status.silenced".into(), 1);
        assert!(!reqs.requirements_met(&tags));
    }
}
