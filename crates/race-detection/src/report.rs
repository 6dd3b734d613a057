use std::{
    collections::{BTreeMap, BTreeSet},
    io::Read,
};

use anyhow::Error;
use serde::{Deserialize, Serialize};

use crate::{
    coverage::FactStore,
    query::RaceCandidate,
    thread::{ThreadId, ThreadStateSet},
    usage::{MemoryLocation, UsagePoint},
};

#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone)]
pub struct ThreadRecord {
    pub thread: ThreadId,
    pub entry: String,
    pub creators: BTreeSet<ThreadId>,
    pub state: ThreadStateSet,
}

#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone, Default)]
pub struct Statistics {
    /// Worklist steps of all traversals.
    pub iterations: usize,
    pub refinements: usize,
    pub retained_points: usize,
    pub covered_points: usize,
    pub unsafe_locations: usize,
}

/// Everything an analysis run produced, in a form that can be written to and
/// read back from JSON.
#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Default)]
pub struct AnalysisReport {
    usage_points: BTreeMap<MemoryLocation, Vec<UsagePoint>>,
    shared_locations: BTreeMap<MemoryLocation, BTreeSet<ThreadId>>,
    races: Vec<RaceCandidate>,
    false_unsafes: Vec<MemoryLocation>,
    thread_records: Vec<ThreadRecord>,
    statistics: Statistics,
}

impl AnalysisReport {
    pub fn new(store: &FactStore, races: Vec<RaceCandidate>) -> Self {
        let mut report = Self {
            usage_points: store
                .iter()
                .map(|(location, antichain)| (location.clone(), antichain.iter().cloned().collect()))
                .collect(),
            races,
            ..Self::default()
        };
        report.fill_shared_locations();
        report.statistics.retained_points = store.len();
        report.statistics.covered_points = store.covered_len();
        report.statistics.unsafe_locations = report.unsafe_locations().len();
        report
    }

    fn fill_shared_locations(&mut self) {
        self.shared_locations = self
            .usage_points
            .iter()
            .map(|(location, points)| {
                let threads: BTreeSet<ThreadId> =
                    points.iter().map(|point| point.thread().clone()).collect();
                (location.clone(), threads)
            })
            .filter(|(location, threads)| {
                threads.len() > 1
                    || self.usage_points[location]
                        .iter()
                        .any(UsagePoint::is_self_parallel)
            })
            .collect();
    }

    pub fn fill_thread_records(&mut self, mut records: Vec<ThreadRecord>) {
        records.sort_by(|r1, r2| r1.thread.cmp(&r2.thread));
        self.thread_records = records;
    }

    pub fn fill_false_unsafes(&mut self, locations: &BTreeSet<MemoryLocation>) {
        self.false_unsafes = locations.iter().cloned().collect();
    }

    pub fn fill_statistics(&mut self, iterations: usize, refinements: usize) {
        self.statistics.iterations = iterations;
        self.statistics.refinements = refinements;
    }

    pub fn usage_points(&self) -> &BTreeMap<MemoryLocation, Vec<UsagePoint>> {
        &self.usage_points
    }

    pub fn shared_locations(&self) -> &BTreeMap<MemoryLocation, BTreeSet<ThreadId>> {
        &self.shared_locations
    }

    pub fn races(&self) -> &[RaceCandidate] {
        &self.races
    }

    pub fn false_unsafes(&self) -> &[MemoryLocation] {
        &self.false_unsafes
    }

    pub fn thread_records(&self) -> &[ThreadRecord] {
        &self.thread_records
    }

    pub fn statistics(&self) -> &Statistics {
        &self.statistics
    }

    pub fn unsafe_locations(&self) -> BTreeSet<&MemoryLocation> {
        self.races.iter().map(|race| &race.location).collect()
    }

    /// The `n` locations with the most retained usage points.
    pub fn top_locations(&self, n: usize) -> Vec<(&MemoryLocation, usize)> {
        let mut counts: Vec<(&MemoryLocation, usize)> = self
            .usage_points
            .iter()
            .map(|(location, points)| (location, points.len()))
            .collect();
        counts.sort_by(|(l1, c1), (l2, c2)| c2.cmp(c1).then_with(|| l1.cmp(l2)));
        counts.truncate(n);
        counts
    }

    pub fn to_json(&self) -> Result<String, Error> {
        serde_json::to_string_pretty(&self).map_err(Error::from)
    }

    pub fn from_json<R: Read>(reader: R) -> Result<Self, Error> {
        serde_json::from_reader(reader).map_err(Error::from)
    }
}
