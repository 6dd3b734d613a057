use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Error, ensure};
use race_detection::{ThreadId, ThreadRelation, ThreadStateSet, report::ThreadRecord};

struct ThreadEntry {
    entry: String,
    /// Start context contributed by each creating thread.
    contributions: BTreeMap<ThreadId, ThreadStateSet>,
}

/// Bookkeeping of all threads discovered so far, keyed by creation site.
pub struct ThreadRegistry {
    threads: BTreeMap<ThreadId, ThreadEntry>,
}

impl ThreadRegistry {
    pub fn new(main_entry: &str) -> Self {
        Self {
            threads: BTreeMap::from([(
                ThreadId::main(),
                ThreadEntry {
                    entry: main_entry.to_string(),
                    contributions: BTreeMap::new(),
                },
            )]),
        }
    }

    /// Records that `creator` spawns `site` running `entry` with start context
    /// `child`.
    ///
    /// # Errors
    ///
    /// The same creation site must always run the same entry function.
    pub fn register_creation(
        &mut self,
        creator: &ThreadId,
        site: &ThreadId,
        entry: &str,
        child: &ThreadStateSet,
    ) -> Result<(), Error> {
        let thread = self.threads.entry(site.clone()).or_insert_with(|| {
            log::debug!("Discovered thread {} running `{}`", site, entry);
            ThreadEntry {
                entry: entry.to_string(),
                contributions: BTreeMap::new(),
            }
        });

        ensure!(
            thread.entry == entry,
            "Thread {} is created with both `{}` and `{}`",
            site,
            thread.entry,
            entry
        );

        thread
            .contributions
            .entry(creator.clone())
            .and_modify(|state| *state = state.merge(child))
            .or_insert_with(|| child.clone());

        Ok(())
    }

    pub fn contains(&self, thread: &ThreadId) -> bool {
        self.threads.contains_key(thread)
    }

    pub fn entry_function(&self, thread: &ThreadId) -> Option<&str> {
        self.threads.get(thread).map(|t| t.entry.as_str())
    }

    /// The join of all start contexts of `thread`. `None` if no creation of
    /// the thread is currently known.
    pub fn entry_state(&self, thread: &ThreadId) -> Option<ThreadStateSet> {
        if thread.is_main() {
            return Some(ThreadStateSet::main());
        }

        self.threads
            .get(thread)?
            .contributions
            .values()
            .cloned()
            .reduce(|acc, state| acc.merge(&state))
    }

    /// Whether more than one instance of `thread` may run at once.
    pub fn is_self_parallel(&self, thread: &ThreadId) -> bool {
        self.entry_state(thread)
            .and_then(|state| state.get(thread))
            .is_some_and(|rel| rel == ThreadRelation::SelfParallel)
    }

    /// `thread` together with every thread transitively created by it.
    pub fn descendants(&self, thread: &ThreadId) -> BTreeSet<ThreadId> {
        let mut found = BTreeSet::from([thread.clone()]);
        loop {
            let next: Vec<ThreadId> = self
                .threads
                .iter()
                .filter(|(id, t)| {
                    !found.contains(*id)
                        && t.contributions.keys().any(|creator| found.contains(creator))
                })
                .map(|(id, _)| id.clone())
                .collect();

            if next.is_empty() {
                return found;
            }
            found.extend(next);
        }
    }

    /// Forgets every start context that one of `creators` contributed.
    pub fn withdraw_contributions(&mut self, creators: &BTreeSet<ThreadId>) {
        for thread in self.threads.values_mut() {
            thread
                .contributions
                .retain(|creator, _| !creators.contains(creator));
        }
    }

    pub fn threads(&self) -> impl Iterator<Item = &ThreadId> {
        self.threads.keys()
    }

    pub fn records(&self) -> Vec<ThreadRecord> {
        self.threads
            .iter()
            .filter_map(|(id, t)| {
                Some(ThreadRecord {
                    thread: id.clone(),
                    entry: t.entry.clone(),
                    creators: t.contributions.keys().cloned().collect(),
                    state: self.entry_state(id)?,
                })
            })
            .collect()
    }
}
