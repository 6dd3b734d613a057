use std::{fmt, str::FromStr};

use anyhow::{Error, anyhow};
use serde::{Deserialize, Serialize};

use crate::{
    lock::LockSet,
    thread::{ThreadId, ThreadRelation, ThreadStateSet},
};

interned_identifier!(
    /// A shared memory location, usually a global variable or a field path.
    MemoryLocation
);

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessKind {
    Read,
    Write,
}

impl AccessKind {
    pub fn is_write(&self) -> bool {
        matches!(self, AccessKind::Write)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AccessKind::Read => "READ",
            AccessKind::Write => "WRITE",
        }
    }
}

impl fmt::Display for AccessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccessKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "READ" => Ok(AccessKind::Read),
            "WRITE" => Ok(AccessKind::Write),
            other => Err(anyhow!("Unknown access kind `{}`", other)),
        }
    }
}

/// The program location an access was observed at.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct ProgramSite {
    function: String,
    node: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    line: Option<u32>,
}

impl ProgramSite {
    pub fn new(function: &str, node: usize, line: Option<u32>) -> Self {
        Self {
            function: function.to_string(),
            node,
            line,
        }
    }

    /// A placeholder site for points that were not produced by a traversal.
    pub fn unknown() -> Self {
        Self::new("?", 0, None)
    }

    pub fn function(&self) -> &str {
        &self.function
    }

    pub fn node(&self) -> usize {
        self.node
    }

    pub fn line(&self) -> Option<u32> {
        self.line
    }
}

impl fmt::Display for ProgramSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "{}:{}", self.function, line),
            None => write!(f, "{}#{}", self.function, self.node),
        }
    }
}

/// One abstracted memory access.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct UsagePoint {
    location: MemoryLocation,
    access: AccessKind,
    thread: ThreadId,
    state: ThreadStateSet,
    locks: LockSet,
    site: ProgramSite,
}

impl UsagePoint {
    pub fn new(
        location: MemoryLocation,
        access: AccessKind,
        thread: ThreadId,
        state: ThreadStateSet,
        locks: LockSet,
        site: ProgramSite,
    ) -> Self {
        Self {
            location,
            access,
            thread,
            state,
            locks,
            site,
        }
    }

    pub fn location(&self) -> &MemoryLocation {
        &self.location
    }

    pub fn access(&self) -> AccessKind {
        self.access
    }

    pub fn thread(&self) -> &ThreadId {
        &self.thread
    }

    pub fn state(&self) -> &ThreadStateSet {
        &self.state
    }

    pub fn locks(&self) -> &LockSet {
        &self.locks
    }

    pub fn site(&self) -> &ProgramSite {
        &self.site
    }

    /// Replaces the site, keeping the abstract context.
    pub fn at(mut self, site: ProgramSite) -> Self {
        self.site = site;
        self
    }

    /// Equality of everything but the program site.
    pub fn same_context(&self, other: &UsagePoint) -> bool {
        self.location == other.location
            && self.access == other.access
            && self.thread == other.thread
            && self.state == other.state
            && self.locks == other.locks
    }

    /// Whether several instances of the owning thread may run this access
    /// concurrently.
    pub fn is_self_parallel(&self) -> bool {
        self.state.get(&self.thread) == Some(ThreadRelation::SelfParallel)
    }
}

impl fmt::Display for UsagePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&crate::std_format::render(self))
    }
}
