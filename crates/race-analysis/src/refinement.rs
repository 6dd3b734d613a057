use std::collections::BTreeSet;

use anyhow::{Error, ensure};
use race_detection::{MemoryLocation, RaceQuery, ThreadId};
use serde::{Deserialize, Serialize};

use crate::fixpoint::{AbstractState, Analysis, Position};

/// Branch conditions found infeasible in one thread, e.g. by a predicate
/// refinement of a spurious race.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct RefinementRequest {
    pub thread: ThreadId,
    pub infeasible: BTreeSet<String>,
}

impl RefinementRequest {
    pub fn new(thread: ThreadId) -> Self {
        Self {
            thread,
            infeasible: BTreeSet::new(),
        }
    }

    pub fn infeasible(mut self, condition: &str) -> Self {
        self.infeasible.insert(condition.to_string());
        self
    }
}

impl Analysis {
    fn unsafe_locations(&self) -> BTreeSet<MemoryLocation> {
        RaceQuery::new(&self.store)
            .unsafe_locations()
            .into_iter()
            .collect()
    }

    /// Adds the infeasible conditions of `request` to the precision of its
    /// thread and re-traverses that thread and everything it creates.
    ///
    /// Locations that were unsafe before and are safe afterwards are recorded
    /// as false unsafes.
    ///
    /// # Errors
    ///
    /// Fails for threads that were never discovered, or if the re-traversal
    /// fails.
    pub fn refine(&mut self, request: RefinementRequest) -> Result<(), Error> {
        let RefinementRequest { thread, infeasible } = request;
        ensure!(
            self.registry.contains(&thread),
            "Cannot refine unknown thread {}",
            thread
        );

        let unsafe_before = self.unsafe_locations();

        self.precision
            .entry(thread.clone())
            .or_default()
            .extend(infeasible);

        let affected = self.registry.descendants(&thread);
        log::info!("Refining thread {}, re-traversing {:?}", thread, affected);

        self.registry.withdraw_contributions(&affected);
        self.states
            .retain(|position, _| !affected.contains(&position.thread));
        self.changes
            .retain(|position, _| !affected.contains(&position.thread));
        self.recursive_returns
            .retain(|frame, _| !affected.contains(&frame.thread));
        self.store.retract_threads(&affected);

        for thread in affected.iter() {
            let entry = self.registry.entry_function(thread).map(str::to_string);
            if let (Some(entry), Some(state)) = (entry, self.registry.entry_state(thread)) {
                self.propagate(Position::entry(thread, &entry), AbstractState::entry(state));
            }
        }

        self.run()?;
        self.refinements += 1;

        let unsafe_after = self.unsafe_locations();
        for location in unsafe_before.difference(&unsafe_after) {
            log::info!("Race on {} was a false unsafe", location);
            self.false_unsafes.insert(location.clone());
        }

        Ok(())
    }
}
