use std::{
    collections::{BTreeMap, BTreeSet, btree_set},
    fmt,
};

use serde::{Deserialize, Serialize};

interned_identifier!(
    /// Identifies a lock object as named by the alias oracle.
    LockId
);

/// A lock as tracked in a lock set.
///
/// `MayAlias` stands for an acquisition through a pointer that may refer to
/// any of at least two locks. It is never mistaken for any of its members.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbstractLock {
    Exact(LockId),
    MayAlias(BTreeSet<LockId>),
}

impl AbstractLock {
    /// Builds the abstract lock for a resolved alias set. Returns `None` for
    /// an empty set.
    pub fn from_aliases(aliases: BTreeSet<LockId>) -> Option<Self> {
        match aliases.len() {
            0 => None,
            1 => aliases.into_iter().next().map(AbstractLock::Exact),
            _ => Some(AbstractLock::MayAlias(aliases)),
        }
    }

    pub fn as_exact(&self) -> Option<&LockId> {
        match self {
            AbstractLock::Exact(lock) => Some(lock),
            AbstractLock::MayAlias(_) => None,
        }
    }
}

impl fmt::Display for AbstractLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbstractLock::Exact(lock) => write!(f, "{}", lock),
            AbstractLock::MayAlias(locks) => {
                let names: Vec<&str> = locks.iter().map(LockId::as_str).collect();
                write!(f, "({})", names.join("|"))
            }
        }
    }
}

/// Set of locks that are held on every path reaching a program point.
#[derive(
    Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct LockSet {
    locks: BTreeSet<AbstractLock>,
}

impl LockSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn iter(&self) -> btree_set::Iter<'_, AbstractLock> {
        self.locks.iter()
    }

    pub fn contains(&self, lock: &AbstractLock) -> bool {
        self.locks.contains(lock)
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    pub fn is_subset(&self, other: &LockSet) -> bool {
        self.locks.is_subset(&other.locks)
    }

    pub fn exact_locks(&self) -> impl Iterator<Item = &LockId> {
        self.locks.iter().filter_map(AbstractLock::as_exact)
    }

    /// Join at control-flow merges: only locks held on both paths survive.
    pub fn meet(&self, other: &LockSet) -> LockSet {
        Self {
            locks: self.locks.intersection(&other.locks).cloned().collect(),
        }
    }

    /// Two accesses are mutually excluded only if they hold a common exact
    /// lock.
    pub fn protects_with(&self, other: &LockSet) -> bool {
        self.exact_locks()
            .any(|lock| other.contains(&AbstractLock::Exact(lock.clone())))
    }

    fn insert(&mut self, lock: AbstractLock) -> bool {
        self.locks.insert(lock)
    }

    fn remove(&mut self, lock: &AbstractLock) -> bool {
        self.locks.remove(lock)
    }
}

impl FromIterator<AbstractLock> for LockSet {
    fn from_iter<I: IntoIterator<Item = AbstractLock>>(iter: I) -> Self {
        Self {
            locks: iter.into_iter().collect(),
        }
    }
}

impl fmt::Display for LockSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let locks: Vec<String> = self.locks.iter().map(ToString::to_string).collect();
        write!(f, "[{}]", locks.join(","))
    }
}

/// The expression a lock operation is applied to.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockHandle {
    /// A lock named directly, e.g. `pthread_mutex_lock(&l1)`.
    Direct(LockId),
    /// A pointer whose targets are resolved by an [`AliasOracle`].
    Pointer(String),
}

/// May-alias information for lock pointers.
pub trait AliasOracle {
    /// Returns every lock `pointer` may refer to. Unknown pointers resolve to
    /// the empty set.
    fn may_alias(&self, pointer: &str) -> BTreeSet<LockId>;
}

impl AliasOracle for BTreeMap<String, BTreeSet<LockId>> {
    fn may_alias(&self, pointer: &str) -> BTreeSet<LockId> {
        self.get(pointer).cloned().unwrap_or_default()
    }
}

/// Transfer functions for lock acquisition and release.
pub struct LockSetTracker<'a, O: AliasOracle + ?Sized> {
    oracle: &'a O,
}

impl<'a, O: AliasOracle + ?Sized> LockSetTracker<'a, O> {
    pub fn new(oracle: &'a O) -> Self {
        Self { oracle }
    }

    fn resolve(&self, handle: &LockHandle) -> Option<AbstractLock> {
        match handle {
            LockHandle::Direct(lock) => Some(AbstractLock::Exact(lock.clone())),
            LockHandle::Pointer(pointer) => {
                let aliases = self.oracle.may_alias(pointer);
                if aliases.is_empty() {
                    log::debug!("Lock pointer `{}` has no known targets", pointer);
                }
                AbstractLock::from_aliases(aliases)
            }
        }
    }

    pub fn lock(&self, set: &mut LockSet, handle: &LockHandle) {
        if let Some(lock) = self.resolve(handle) {
            set.insert(lock);
        }
    }

    pub fn unlock(&self, set: &mut LockSet, handle: &LockHandle) {
        let Some(lock) = self.resolve(handle) else {
            return;
        };

        if set.remove(&lock) {
            return;
        }

        // Releasing through an ambiguous pointer only drops a lock if exactly
        // one of its possible targets is currently held.
        if let AbstractLock::MayAlias(aliases) = &lock {
            let held: Vec<LockId> = set
                .exact_locks()
                .filter(|held| aliases.contains(*held))
                .cloned()
                .collect();

            if let [only] = held.as_slice() {
                set.remove(&AbstractLock::Exact(only.clone()));
            } else {
                log::debug!("Ambiguous release of {} keeps lock set {}", lock, set);
            }
        }
    }
}
