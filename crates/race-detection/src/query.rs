use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    coverage::{Antichain, FactStore},
    thread::ThreadRelation,
    usage::{MemoryLocation, UsagePoint},
};

/// Two usage points of the same location that may execute concurrently
/// without a common lock, at least one of them writing.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct RaceCandidate {
    pub location: MemoryLocation,
    pub first: UsagePoint,
    pub second: UsagePoint,
}

/// Returns true if the two points of one location may race.
pub fn may_race(a: &UsagePoint, b: &UsagePoint) -> bool {
    a.location() == b.location()
        && (a.access().is_write() || b.access().is_write())
        && !a.locks().protects_with(b.locks())
        && !sequenced(a, b)
}

fn sequenced(a: &UsagePoint, b: &UsagePoint) -> bool {
    if a.thread() == b.thread() {
        return !a.is_self_parallel() && !b.is_self_parallel();
    }

    ordered_by_creation(a, b) || ordered_by_creation(b, a)
}

/// The ancestor's access cannot overlap the descendant's if it happened
/// before the ancestor spawned the subtree the descendant belongs to, or
/// after it joined that subtree again.
fn ordered_by_creation(ancestor: &UsagePoint, descendant: &UsagePoint) -> bool {
    if !descendant.state().has_ancestor(ancestor.thread()) || ancestor.is_self_parallel() {
        return false;
    }

    if descendant.state().get(ancestor.thread()) == Some(ThreadRelation::SelfParallel) {
        return false;
    }

    // A thread the ancestor sees as started (or still running after a join)
    // and the descendant sees as created separates the two accesses.
    !ancestor.state().iter().any(|(thread, rel)| {
        *rel != ThreadRelation::Created
            && descendant
                .state()
                .get(thread)
                .is_some_and(|other| other.is_created())
    })
}

fn candidates_in(location: &MemoryLocation, antichain: &Antichain) -> Vec<RaceCandidate> {
    let points: Vec<&UsagePoint> = antichain.iter().collect();
    let mut candidates = Vec::new();

    for (i, a) in points.iter().enumerate() {
        // Several instances of a self-parallel thread race with each other.
        if a.is_self_parallel() && a.access().is_write() && a.locks().exact_locks().next().is_none()
        {
            candidates.push(RaceCandidate {
                location: location.clone(),
                first: (*a).clone(),
                second: (*a).clone(),
            });
        }

        for b in points[i + 1..].iter() {
            if may_race(a, b) {
                candidates.push(RaceCandidate {
                    location: location.clone(),
                    first: (*a).clone(),
                    second: (*b).clone(),
                });
            }
        }
    }

    candidates
}

/// Race detection over the final contents of a [`FactStore`].
pub struct RaceQuery<'a> {
    store: &'a FactStore,
}

impl<'a> RaceQuery<'a> {
    pub fn new(store: &'a FactStore) -> Self {
        Self { store }
    }

    /// All race candidates, ordered by location and then by the points
    /// involved. Locations are processed in parallel.
    pub fn candidates(&self) -> Vec<RaceCandidate> {
        let per_location: Vec<(&MemoryLocation, &Antichain)> = self.store.iter().collect();

        let mut candidates: Vec<RaceCandidate> = per_location
            .par_iter()
            .flat_map_iter(|(location, antichain)| candidates_in(location, antichain))
            .collect();
        candidates.sort();

        log::info!(
            "Found {} race candidates over {} locations",
            candidates.len(),
            per_location.len()
        );

        candidates
    }

    pub fn candidates_at(&self, location: &MemoryLocation) -> Vec<RaceCandidate> {
        self.store
            .antichain(location)
            .map(|antichain| candidates_in(location, antichain))
            .unwrap_or_default()
    }

    /// The first race candidate of `location`, if any.
    pub fn first_race(&self, location: &MemoryLocation) -> Option<RaceCandidate> {
        self.candidates_at(location).into_iter().min()
    }

    /// Locations with at least one race candidate.
    pub fn unsafe_locations(&self) -> Vec<MemoryLocation> {
        let mut locations: Vec<MemoryLocation> = self
            .store
            .iter()
            .collect::<Vec<_>>()
            .par_iter()
            .filter(|(location, antichain)| !candidates_in(location, antichain).is_empty())
            .map(|(location, _)| (*location).clone())
            .collect();
        locations.sort();
        locations
    }
}
