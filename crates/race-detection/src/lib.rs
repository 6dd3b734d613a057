//! Abstract-state core of a thread-modular static data-race detector.
//!
//! Every shared-memory access is abstracted into a [`UsagePoint`]: who
//! accesses the location, which other threads may be live at that moment,
//! and which locks are held. A [`FactStore`] keeps only the maximal points
//! per location and [`RaceQuery`] reports the pairs among them that may race.

macro_rules! interned_identifier {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug,
            ::serde::Serialize, ::serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(::std::sync::Arc<str>);

        impl $name {
            pub fn new(name: &str) -> Self {
                Self(::std::sync::Arc::from(name))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(name: &str) -> Self {
                Self::new(name)
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

/// Ordering of usage points and the per-location antichains built from it
pub mod coverage;
/// Must-hold lock sets and their transfer functions
pub mod lock;
/// Pairwise race detection over the retained usage points
pub mod query;
/// Serializable analysis results
pub mod report;
/// Textual rendering and parsing of usage points
pub mod std_format;
/// Thread creation contexts and their transfer functions
pub mod thread;
/// The usage-point data model
pub mod usage;

pub use coverage::{Antichain, FactStore, Insertion};
pub use lock::{AbstractLock, AliasOracle, LockHandle, LockId, LockSet, LockSetTracker};
pub use query::{RaceCandidate, RaceQuery};
pub use thread::{Spawn, ThreadHierarchyTracker, ThreadId, ThreadRelation, ThreadStateSet};
pub use usage::{AccessKind, MemoryLocation, ProgramSite, UsagePoint};
