use std::{
    collections::{BTreeMap, BTreeSet},
    io::Read,
};

use anyhow::{Error, anyhow, bail, ensure};
use race_detection::{LockHandle, LockId, MemoryLocation, ThreadId};
use serde::{Deserialize, Serialize};

/// The statement a CFG node stands for.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Read(MemoryLocation),
    Write(MemoryLocation),
    Lock(LockHandle),
    Unlock(LockHandle),
    /// Spawns the thread identified by `site`, running `entry`.
    Create { site: ThreadId, entry: String },
    Join(ThreadId),
    Call(String),
    /// A branch guard. Refinement may declare it infeasible.
    Assume(String),
    Skip,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Node {
    pub kind: NodeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

impl Node {
    pub fn new(kind: NodeKind) -> Self {
        Self { kind, line: None }
    }

    pub fn at_line(kind: NodeKind, line: u32) -> Self {
        Self {
            kind,
            line: Some(line),
        }
    }
}

/// A function body. Node 0 is the entry, nodes without successors are exits.
/// Without explicit edges the nodes run in sequence.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Function {
    pub nodes: Vec<Node>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edges: Option<Vec<(usize, usize)>>,
    #[serde(skip)]
    successors: Vec<Vec<usize>>,
}

impl Function {
    pub fn sequence(nodes: Vec<Node>) -> Self {
        Self {
            nodes,
            edges: None,
            successors: Vec::new(),
        }
    }

    pub fn with_edges(nodes: Vec<Node>, edges: Vec<(usize, usize)>) -> Self {
        Self {
            nodes,
            edges: Some(edges),
            successors: Vec::new(),
        }
    }

    fn link(&mut self, name: &str) -> Result<(), Error> {
        ensure!(!self.nodes.is_empty(), "Function `{}` has no nodes", name);

        let mut successors = vec![Vec::new(); self.nodes.len()];
        match &self.edges {
            Some(edges) => {
                for (from, to) in edges.iter().copied() {
                    ensure!(
                        from < self.nodes.len() && to < self.nodes.len(),
                        "Edge ({}, {}) of function `{}` is out of range",
                        from,
                        to,
                        name
                    );
                    if !successors[from].contains(&to) {
                        successors[from].push(to);
                    }
                }
            }
            None => {
                let last = self.nodes.len() - 1;
                for (from, succ) in successors.iter_mut().enumerate().take(last) {
                    succ.push(from + 1);
                }
            }
        }

        self.successors = successors;
        Ok(())
    }

    pub fn successors(&self, node: usize) -> &[usize] {
        self.successors.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_exit(&self, node: usize) -> bool {
        self.successors(node).is_empty()
    }

    pub fn exits(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.nodes.len()).filter(|node| self.is_exit(*node))
    }
}

fn default_entry() -> String {
    "main".to_string()
}

/// A whole program as handed over by the front end.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Program {
    #[serde(default = "default_entry")]
    pub entry: String,
    pub functions: BTreeMap<String, Function>,
    #[serde(default)]
    pub aliases: BTreeMap<String, BTreeSet<LockId>>,
}

impl Program {
    pub fn new(entry: &str) -> Self {
        Self {
            entry: entry.to_string(),
            functions: BTreeMap::new(),
            aliases: BTreeMap::new(),
        }
    }

    pub fn with_function(mut self, name: &str, function: Function) -> Self {
        self.functions.insert(name.to_string(), function);
        self
    }

    pub fn with_alias(mut self, pointer: &str, locks: &[&str]) -> Self {
        self.aliases.insert(
            pointer.to_string(),
            locks.iter().map(|lock| LockId::new(lock)).collect(),
        );
        self
    }

    /// Reads a program from JSON and checks it with [`Program::validate`].
    pub fn from_json<R: Read>(reader: R) -> Result<Self, Error> {
        let mut program: Program = serde_json::from_reader(reader).map_err(Error::from)?;
        program.validate()?;
        Ok(program)
    }

    pub fn to_json(&self) -> Result<String, Error> {
        serde_json::to_string_pretty(&self).map_err(Error::from)
    }

    /// Checks that every referenced function exists and every edge is in
    /// range, and computes the successor lists.
    ///
    /// # Errors
    ///
    /// Fails on the first structural problem found.
    pub fn validate(&mut self) -> Result<(), Error> {
        ensure!(
            self.functions.contains_key(&self.entry),
            "Entry function `{}` does not exist",
            self.entry
        );

        let names: BTreeSet<String> = self.functions.keys().cloned().collect();
        for (name, function) in self.functions.iter_mut() {
            function.link(name)?;

            for (index, node) in function.nodes.iter().enumerate() {
                match &node.kind {
                    NodeKind::Call(callee) if !names.contains(callee) => {
                        bail!("Node {} of `{}` calls unknown function `{}`", index, name, callee)
                    }
                    NodeKind::Create { site, entry } => {
                        ensure!(
                            !site.is_main(),
                            "Node {} of `{}` uses the reserved thread name `{}`",
                            index,
                            name,
                            site
                        );
                        ensure!(
                            names.contains(entry),
                            "Node {} of `{}` starts unknown function `{}`",
                            index,
                            name,
                            entry
                        );
                    }
                    _ => {}
                }
            }
        }

        Ok(())
    }

    pub fn function(&self, name: &str) -> Result<&Function, Error> {
        self.functions
            .get(name)
            .ok_or_else(|| anyhow!("Unknown function `{}`", name))
    }

    pub fn node(&self, function: &str, node: usize) -> Result<&Node, Error> {
        self.function(function)?
            .nodes
            .get(node)
            .ok_or_else(|| anyhow!("Function `{}` has no node {}", function, node))
    }
}
