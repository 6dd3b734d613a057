use std::{
    collections::{BTreeMap, btree_map},
    fmt,
    str::FromStr,
};

use anyhow::{Error, anyhow};
use serde::{Deserialize, Serialize};

interned_identifier!(
    /// Identifies a thread by the site that creates it.
    ///
    /// All dynamic instances spawned from the same creation site share one
    /// identifier. The implicit main thread is [`ThreadId::main`].
    ThreadId
);

const MAIN_THREAD: &str = "main";

impl ThreadId {
    pub fn main() -> Self {
        Self::new(MAIN_THREAD)
    }

    pub fn is_main(&self) -> bool {
        self.as_str() == MAIN_THREAD
    }
}

/// How a thread looks from the thread observing it.
///
/// The variants are ordered from least to most co-live.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub enum ThreadRelation {
    /// Already started and possibly running: created by the observer, or by
    /// one of the observer's ancestors before the observer itself was created.
    Parent,
    /// The observer itself or one of its ancestors on the creation chain.
    Created,
    /// Like `Created`, but several instances may be live at once.
    SelfParallel,
}

impl ThreadRelation {
    /// Returns true for relations that make the thread an ancestor (or the
    /// owner) of the described context.
    pub fn is_created(&self) -> bool {
        *self >= ThreadRelation::Created
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ThreadRelation::Parent => "PARENT_THREAD",
            ThreadRelation::Created => "CREATED_THREAD",
            ThreadRelation::SelfParallel => "SELF_PARALLEL_THREAD",
        }
    }
}

impl fmt::Display for ThreadRelation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ThreadRelation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PARENT_THREAD" => Ok(ThreadRelation::Parent),
            "CREATED_THREAD" => Ok(ThreadRelation::Created),
            "SELF_PARALLEL_THREAD" => Ok(ThreadRelation::SelfParallel),
            other => Err(anyhow!("Unknown thread relation `{}`", other)),
        }
    }
}

/// The set of threads visible from some program point, each tagged with its
/// creation relation. The main thread is never part of the set.
#[derive(
    Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ThreadStateSet {
    relations: BTreeMap<ThreadId, ThreadRelation>,
}

impl ThreadStateSet {
    /// The context of the main thread at program start.
    pub fn main() -> Self {
        Self::default()
    }

    pub fn get(&self, thread: &ThreadId) -> Option<ThreadRelation> {
        self.relations.get(thread).copied()
    }

    pub fn contains(&self, thread: &ThreadId) -> bool {
        self.relations.contains_key(thread)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, ThreadId, ThreadRelation> {
        self.relations.iter()
    }

    pub fn len(&self) -> usize {
        self.relations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relations.is_empty()
    }

    /// Whether `thread` is an ancestor of (or equal to) the thread owning
    /// this context. The main thread is everyone's ancestor.
    pub fn has_ancestor(&self, thread: &ThreadId) -> bool {
        thread.is_main() || self.get(thread).is_some_and(|rel| rel.is_created())
    }

    /// Mapping inclusion: every entry of `self` is present in `other` with a
    /// relation at least as strong.
    pub fn is_subsumed_by(&self, other: &ThreadStateSet) -> bool {
        self.relations
            .iter()
            .all(|(thread, rel)| other.get(thread).is_some_and(|o| *rel <= o))
    }

    /// Join at control-flow merges: pointwise union keeping the stronger
    /// relation.
    pub fn merge(&self, other: &ThreadStateSet) -> ThreadStateSet {
        let mut merged = self.clone();
        for (thread, rel) in other.iter() {
            merged
                .relations
                .entry(thread.clone())
                .and_modify(|existing| *existing = (*existing).max(*rel))
                .or_insert(*rel);
        }
        merged
    }

    fn with(&self, thread: &ThreadId, rel: ThreadRelation) -> ThreadStateSet {
        let mut updated = self.clone();
        updated.relations.insert(thread.clone(), rel);
        updated
    }

    fn without(&self, thread: &ThreadId) -> ThreadStateSet {
        let mut updated = self.clone();
        updated.relations.remove(thread);
        updated
    }
}

impl FromIterator<(ThreadId, ThreadRelation)> for ThreadStateSet {
    fn from_iter<I: IntoIterator<Item = (ThreadId, ThreadRelation)>>(iter: I) -> Self {
        Self {
            relations: iter.into_iter().collect(),
        }
    }
}

/// Result of a thread creation: the context the creator continues with and
/// the context the new thread starts in.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Spawn {
    pub creator: ThreadStateSet,
    pub child: ThreadStateSet,
}

/// Transfer functions for thread creation and join.
pub struct ThreadHierarchyTracker;

impl ThreadHierarchyTracker {
    pub fn new() -> Self {
        Self {}
    }

    /// Thread `creator`, running in context `state`, creates `site`.
    ///
    /// The child is self-parallel when the site was already created before or
    /// when the creator itself runs as several instances.
    pub fn create(&self, creator: &ThreadId, state: &ThreadStateSet, site: &ThreadId) -> Spawn {
        let child_rel =
            if state.contains(site) || state.get(creator) == Some(ThreadRelation::SelfParallel) {
                ThreadRelation::SelfParallel
            } else {
                ThreadRelation::Created
            };

        // A thread re-creating its own site ends up with parallel siblings.
        let creator_rel = match state.get(site) {
            Some(rel) if rel.is_created() => ThreadRelation::SelfParallel,
            _ => ThreadRelation::Parent,
        };

        Spawn {
            creator: state.with(site, creator_rel),
            child: state.with(site, child_rel),
        }
    }

    /// Joining one instance of a self-parallel thread leaves the others
    /// running, so only single-instance entries are dropped.
    pub fn join(&self, state: &ThreadStateSet, site: &ThreadId) -> ThreadStateSet {
        match state.get(site) {
            Some(ThreadRelation::SelfParallel) => state.clone(),
            _ => state.without(site),
        }
    }
}

impl Default for ThreadHierarchyTracker {
    fn default() -> Self {
        Self::new()
    }
}
