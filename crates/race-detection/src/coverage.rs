use std::collections::{BTreeMap, BTreeSet, btree_map};

use crate::{
    thread::ThreadId,
    usage::{MemoryLocation, UsagePoint},
};

impl UsagePoint {
    /// Returns true if `self` is at least as likely to race as `other`, so
    /// that `other` adds nothing once `self` is known.
    ///
    /// Besides equal location and access kind this requires that `self` sees
    /// every thread `other` sees (with at least the same relation), holds no
    /// lock `other` does not hold and runs in a compatible thread. A thread is
    /// compatible if it is the same one, or if `other` runs in an ancestor of
    /// `self`'s thread at a point where `self`'s thread is not yet visible.
    /// A self-parallel point is only covered from within its own thread, as
    /// its race with the other instances is checked on retained points only.
    pub fn covers(&self, other: &UsagePoint) -> bool {
        if self.location() != other.location() || self.access() != other.access() {
            return false;
        }

        if !other.state().is_subsumed_by(self.state()) || !self.locks().is_subset(other.locks()) {
            return false;
        }

        let compatible = self.thread() == other.thread()
            || (!other.is_self_parallel()
                && self.state().has_ancestor(other.thread())
                && !self.thread().is_main()
                && !other.state().contains(self.thread()));
        if !compatible {
            return false;
        }

        // Distinct sites with an identical context are kept side by side.
        !self.same_context(other) || self.site() == other.site()
    }
}

/// Outcome of [`Antichain::insert`].
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Insertion {
    /// The point was retained. `evicted` lists the retained points it covers.
    Added { evicted: Vec<UsagePoint> },
    /// A retained point already covers the new one.
    Covered,
    /// The point was already retained.
    Duplicate,
}

/// The maximal usage points of one memory location.
///
/// Points that got covered are kept below their coverer so that a later
/// retraction can bring them back.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct Antichain {
    retained: BTreeMap<UsagePoint, BTreeSet<UsagePoint>>,
}

impl Antichain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, point: UsagePoint) -> Insertion {
        if self.retained.contains_key(&point) {
            return Insertion::Duplicate;
        }

        if let Some(covered) = self
            .retained
            .iter_mut()
            .find_map(|(top, covered)| top.covers(&point).then_some(covered))
        {
            covered.insert(point);
            return Insertion::Covered;
        }

        let evicted: Vec<UsagePoint> = self
            .retained
            .keys()
            .filter(|top| point.covers(top))
            .cloned()
            .collect();

        let mut covered = BTreeSet::new();
        for top in evicted.iter() {
            if let Some(below) = self.retained.remove(top) {
                covered.extend(below);
            }
            covered.insert(top.clone());
        }
        self.retained.insert(point, covered);

        Insertion::Added { evicted }
    }

    /// Removes every point matching `retract`, retained or covered. Covered
    /// points of a removed top that survive the filter are inserted again.
    ///
    /// Returns the number of retained points that were removed.
    pub fn retract<F: Fn(&UsagePoint) -> bool>(&mut self, retract: F) -> usize {
        let tops: Vec<UsagePoint> = self
            .retained
            .keys()
            .filter(|top| retract(top))
            .cloned()
            .collect();

        let mut orphans = Vec::new();
        for top in tops.iter() {
            if let Some(below) = self.retained.remove(top) {
                orphans.extend(below.into_iter().filter(|point| !retract(point)));
            }
        }

        for covered in self.retained.values_mut() {
            covered.retain(|point| !retract(point));
        }

        for point in orphans {
            self.insert(point);
        }

        tops.len()
    }

    pub fn iter(&self) -> btree_map::Keys<'_, UsagePoint, BTreeSet<UsagePoint>> {
        self.retained.keys()
    }

    /// Every point inserted and not retracted, retained ones first.
    pub fn observed(&self) -> impl Iterator<Item = &UsagePoint> {
        self.retained
            .keys()
            .chain(self.retained.values().flat_map(BTreeSet::iter))
    }

    pub fn contains(&self, point: &UsagePoint) -> bool {
        self.retained.contains_key(point)
    }

    pub fn len(&self) -> usize {
        self.retained.len()
    }

    pub fn is_empty(&self) -> bool {
        self.retained.is_empty()
    }

    /// Number of points currently held below a retained point.
    pub fn covered_len(&self) -> usize {
        self.retained.values().map(BTreeSet::len).sum()
    }
}

/// Per-location antichains of usage points.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct FactStore {
    antichains: BTreeMap<MemoryLocation, Antichain>,
}

impl FactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, point: UsagePoint) -> Insertion {
        let insertion = self
            .antichains
            .entry(point.location().clone())
            .or_default()
            .insert(point);

        if let Insertion::Added { evicted } = &insertion {
            if !evicted.is_empty() {
                log::trace!("New usage point evicted {} covered points", evicted.len());
            }
        }

        insertion
    }

    pub fn antichain(&self, location: &MemoryLocation) -> Option<&Antichain> {
        self.antichains.get(location)
    }

    pub fn locations(&self) -> btree_map::Keys<'_, MemoryLocation, Antichain> {
        self.antichains.keys()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, MemoryLocation, Antichain> {
        self.antichains.iter()
    }

    /// Drops all facts produced by `threads`, restoring the points they
    /// covered.
    pub fn retract_threads(&mut self, threads: &BTreeSet<ThreadId>) -> usize {
        let mut removed = 0;
        for antichain in self.antichains.values_mut() {
            removed += antichain.retract(|point| threads.contains(point.thread()));
        }
        self.antichains.retain(|_, antichain| !antichain.is_empty());

        log::debug!("Retracted {} usage points of threads {:?}", removed, threads);

        removed
    }

    /// Number of retained points over all locations.
    pub fn len(&self) -> usize {
        self.antichains.values().map(Antichain::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.antichains.is_empty()
    }

    pub fn covered_len(&self) -> usize {
        self.antichains.values().map(Antichain::covered_len).sum()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use anyhow::Error;
    use rand_xoshiro::{
        Xoshiro256PlusPlus,
        rand_core::{RngCore, SeedableRng},
    };

    use crate::{
        lock::{AbstractLock, LockId},
        thread::{ThreadId, ThreadRelation},
        usage::{AccessKind, MemoryLocation, ProgramSite, UsagePoint},
    };

    use super::{Antichain, FactStore, Insertion};

    fn point(
        access: AccessKind,
        thread: &str,
        state: &[(&str, ThreadRelation)],
        locks: &[&str],
        node: usize,
    ) -> UsagePoint {
        UsagePoint::new(
            MemoryLocation::new("g"),
            access,
            ThreadId::new(thread),
            state.iter().map(|(t, rel)| (ThreadId::new(t), *rel)).collect(),
            locks
                .iter()
                .map(|l| AbstractLock::Exact(LockId::new(l)))
                .collect(),
            ProgramSite::new(thread, node, None),
        )
    }

    /// A mix of comparable and incomparable points over a few threads.
    fn sample_points() -> Vec<UsagePoint> {
        use AccessKind::*;
        use ThreadRelation::*;

        vec![
            point(Write, "main", &[], &[], 0),
            point(Write, "main", &[("t1", Parent)], &[], 1),
            point(Write, "main", &[("t1", Parent)], &["l1"], 2),
            point(Write, "t1", &[("t1", Created)], &[], 0),
            point(Write, "t1", &[("t1", Created)], &["l1"], 1),
            point(Read, "t1", &[("t1", Created)], &[], 2),
            point(Write, "t2", &[("t1", Parent), ("t2", Created)], &[], 0),
            point(Write, "t2", &[("t1", Parent), ("t2", Created)], &[], 1),
            point(Write, "t2", &[("t1", Parent), ("t2", Created)], &["l1", "l2"], 2),
            point(Write, "t3", &[("t1", Created), ("t3", Created)], &[], 0),
            point(Write, "t3", &[("t1", Created), ("t3", SelfParallel)], &[], 1),
            point(Read, "main", &[("t2", Parent)], &[], 3),
            point(Write, "t1", &[("t1", SelfParallel)], &[], 3),
            point(Write, "t4", &[("t1", SelfParallel), ("t4", SelfParallel)], &[], 0),
        ]
    }

    fn shuffled(points: &[UsagePoint], rng: &mut Xoshiro256PlusPlus) -> Vec<UsagePoint> {
        let mut points = points.to_vec();
        for i in (1..points.len()).rev() {
            let j = (rng.next_u64() % (i as u64 + 1)) as usize;
            points.swap(i, j);
        }
        points
    }

    fn maximal(points: &[UsagePoint]) -> BTreeSet<UsagePoint> {
        points
            .iter()
            .filter(|p| !points.iter().any(|q| q != *p && q.covers(p)))
            .cloned()
            .collect()
    }

    #[test]
    fn covers_is_a_partial_order() {
        let points = sample_points();

        for a in points.iter() {
            assert!(a.covers(a), "not reflexive for {}", a);
            for b in points.iter() {
                if a.covers(b) && b.covers(a) {
                    assert_eq!(a, b);
                }
                for c in points.iter() {
                    if a.covers(b) && b.covers(c) {
                        assert!(a.covers(c), "not transitive: {} {} {}", a, b, c);
                    }
                }
            }
        }
    }

    #[test]
    fn child_after_fork_covers_parent_before_fork() {
        use ThreadRelation::*;
        let main = point(AccessKind::Write, "main", &[("t1", Parent)], &[], 0);
        let t2 = point(AccessKind::Write, "t2", &[("t1", Parent), ("t2", Created)], &[], 0);
        let t1 = point(AccessKind::Write, "t1", &[("t1", Created)], &[], 0);

        assert!(t2.covers(&main));
        assert!(!main.covers(&t2));
        assert!(!t1.covers(&main));
        assert!(!main.covers(&t1));
    }

    #[test]
    fn self_parallel_point_is_covered_only_by_its_own_thread() {
        use ThreadRelation::*;
        let t1 = point(AccessKind::Write, "t1", &[("t1", SelfParallel)], &[], 0);
        let t1_locked = point(AccessKind::Write, "t1", &[("t1", SelfParallel)], &["l1"], 1);
        let t3 = point(
            AccessKind::Write,
            "t3",
            &[("t1", SelfParallel), ("t3", Created)],
            &[],
            0,
        );

        assert!(!t3.covers(&t1));
        assert!(t1.covers(&t1_locked));

        let mut store = FactStore::new();
        store.insert(t1.clone());
        store.insert(t3.clone());
        let retained: BTreeSet<&UsagePoint> = store
            .antichain(&MemoryLocation::new("g"))
            .map(|chain| chain.iter().collect())
            .unwrap_or_default();
        assert_eq!(retained, BTreeSet::from([&t1, &t3]));
    }

    #[test]
    fn fewer_locks_cover_more_locks() {
        let unlocked = point(AccessKind::Write, "main", &[], &[], 0);
        let locked = point(AccessKind::Write, "main", &[], &["l1"], 1);

        assert!(unlocked.covers(&locked));
        assert!(!locked.covers(&unlocked));
    }

    #[test]
    fn access_kinds_are_never_comparable() {
        let read = point(AccessKind::Read, "main", &[], &[], 0);
        let write = point(AccessKind::Write, "main", &[], &[], 0);

        assert!(!read.covers(&write));
        assert!(!write.covers(&read));
    }

    #[test]
    fn insert_reports_outcome() {
        use ThreadRelation::*;
        let mut antichain = Antichain::new();
        let weak = point(AccessKind::Write, "main", &[], &["l1"], 0);
        let strong = point(AccessKind::Write, "main", &[("t1", Parent)], &[], 1);

        assert_eq!(antichain.insert(weak.clone()), Insertion::Added { evicted: vec![] });
        assert_eq!(antichain.insert(weak.clone()), Insertion::Duplicate);
        assert_eq!(
            antichain.insert(strong.clone()),
            Insertion::Added {
                evicted: vec![weak.clone()]
            }
        );
        assert_eq!(antichain.insert(weak), Insertion::Covered);
        assert_eq!(antichain.len(), 1);
        assert!(antichain.contains(&strong));
    }

    #[test]
    fn insertion_order_does_not_matter() -> Result<(), Error> {
        let points = sample_points();
        let expected = maximal(&points);
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(42);

        for _ in 0..50 {
            let mut antichain = Antichain::new();
            for p in shuffled(&points, &mut rng) {
                antichain.insert(p);
            }

            let retained: BTreeSet<UsagePoint> = antichain.iter().cloned().collect();
            assert_eq!(retained, expected);

            for a in antichain.iter() {
                for b in antichain.iter() {
                    assert!(a == b || !a.covers(b));
                }
            }
        }

        Ok(())
    }

    #[test]
    fn retraction_restores_covered_points() {
        let points = sample_points();
        let mut store = FactStore::new();
        for p in points.iter() {
            store.insert(p.clone());
        }

        let t2 = BTreeSet::from([ThreadId::new("t2")]);
        store.retract_threads(&t2);

        let remaining: Vec<UsagePoint> = points
            .iter()
            .filter(|p| p.thread().as_str() != "t2")
            .cloned()
            .collect();
        let retained: BTreeSet<UsagePoint> = store
            .antichain(&MemoryLocation::new("g"))
            .map(|chain| chain.iter().cloned().collect())
            .unwrap_or_default();

        assert_eq!(retained, maximal(&remaining));
        assert!(retained.iter().all(|p| p.thread().as_str() != "t2"));
    }

    #[test]
    fn retracting_everything_drops_the_location() {
        let mut store = FactStore::new();
        store.insert(point(AccessKind::Write, "t1", &[("t1", ThreadRelation::Created)], &[], 0));
        store.insert(point(AccessKind::Write, "t1", &[("t1", ThreadRelation::Created)], &["l1"], 1));

        assert_eq!(store.len(), 1);
        assert_eq!(store.covered_len(), 1);

        store.retract_threads(&BTreeSet::from([ThreadId::new("t1")]));
        assert!(store.is_empty());
    }

    #[test]
    fn equal_contexts_at_different_sites_are_both_kept() {
        let mut store = FactStore::new();
        let state = [("t1", ThreadRelation::Created)];
        store.insert(point(AccessKind::Write, "t1", &state, &[], 0));
        store.insert(point(AccessKind::Write, "t1", &state, &[], 1));

        assert_eq!(store.len(), 2);
        assert_eq!(store.locations().count(), 1);
    }
}
