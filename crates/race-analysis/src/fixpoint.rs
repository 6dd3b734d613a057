use std::collections::{BTreeMap, BTreeSet, VecDeque};

use anyhow::{Error, anyhow};
use race_detection::{
    FactStore, LockSet, LockSetTracker, MemoryLocation, ProgramSite, RaceCandidate, RaceQuery,
    ThreadHierarchyTracker, ThreadId, ThreadStateSet, UsagePoint, usage::AccessKind,
    report::AnalysisReport,
};

use crate::{
    program::{NodeKind, Program},
    skipper::VariableSkipper,
    tmgmt::ThreadRegistry,
};

pub const DEFAULT_WIDENING_THRESHOLD: usize = 8;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AnalysisOptions {
    /// Number of state changes a node may see before its incoming states are
    /// widened.
    pub widening_threshold: usize,
    pub skipper: VariableSkipper,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self {
            widening_threshold: DEFAULT_WIDENING_THRESHOLD,
            skipper: VariableSkipper::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct AbstractState {
    threads: ThreadStateSet,
    locks: LockSet,
}

impl AbstractState {
    pub(crate) fn entry(threads: ThreadStateSet) -> Self {
        Self {
            threads,
            locks: LockSet::new(),
        }
    }

    fn join(&self, other: &AbstractState) -> AbstractState {
        Self {
            threads: self.threads.merge(&other.threads),
            locks: self.locks.meet(&other.locks),
        }
    }

    fn widen(&self, other: &AbstractState) -> AbstractState {
        Self {
            threads: self.threads.merge(&other.threads),
            locks: LockSet::new(),
        }
    }
}

/// A node of some function, analyzed on behalf of one thread under a call
/// stack of `(caller, call node)` frames.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct Position {
    pub(crate) thread: ThreadId,
    pub(crate) stack: Vec<(String, usize)>,
    pub(crate) function: String,
    pub(crate) node: usize,
}

impl Position {
    pub(crate) fn entry(thread: &ThreadId, function: &str) -> Self {
        Self {
            thread: thread.clone(),
            stack: Vec::new(),
            function: function.to_string(),
            node: 0,
        }
    }

    fn at(&self, function: &str, node: usize, stack: Vec<(String, usize)>) -> Self {
        Self {
            thread: self.thread.clone(),
            stack,
            function: function.to_string(),
            node,
        }
    }

    pub(crate) fn frame(&self) -> Frame {
        Frame {
            thread: self.thread.clone(),
            stack: self.stack.clone(),
            function: self.function.clone(),
        }
    }
}

/// One activation of a function within a thread.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct Frame {
    pub(crate) thread: ThreadId,
    pub(crate) stack: Vec<(String, usize)>,
    pub(crate) function: String,
}

/// Thread-modular forward analysis of a whole program.
///
/// Every thread is traversed from its entry function with the join of all
/// contexts it can be created in. Calls are distinguished by their call
/// stack. A recursive call re-enters the frame that is already active, and
/// the exits of that frame flow back to the recursive call node. Each access
/// yields a usage point in the [`FactStore`].
pub struct Analysis {
    pub(crate) program: Program,
    pub(crate) options: AnalysisOptions,
    pub(crate) registry: ThreadRegistry,
    pub(crate) store: FactStore,
    pub(crate) states: BTreeMap<Position, AbstractState>,
    pub(crate) changes: BTreeMap<Position, usize>,
    /// Recursive call nodes that an active frame returns to.
    pub(crate) recursive_returns: BTreeMap<Frame, BTreeSet<Position>>,
    pub(crate) precision: BTreeMap<ThreadId, BTreeSet<String>>,
    pub(crate) false_unsafes: BTreeSet<MemoryLocation>,
    pub(crate) iterations: usize,
    pub(crate) refinements: usize,
    worklist: VecDeque<Position>,
    queued: BTreeSet<Position>,
}

impl Analysis {
    /// Prepares the analysis of `program`, seeding the main thread at the
    /// program entry.
    ///
    /// # Errors
    ///
    /// Fails if the program is structurally invalid.
    pub fn new(mut program: Program, options: AnalysisOptions) -> Result<Self, Error> {
        program.validate()?;

        let mut analysis = Self {
            registry: ThreadRegistry::new(&program.entry),
            program,
            options,
            store: FactStore::new(),
            states: BTreeMap::new(),
            changes: BTreeMap::new(),
            recursive_returns: BTreeMap::new(),
            precision: BTreeMap::new(),
            false_unsafes: BTreeSet::new(),
            iterations: 0,
            refinements: 0,
            worklist: VecDeque::new(),
            queued: BTreeSet::new(),
        };

        let entry = Position::entry(&ThreadId::main(), &analysis.program.entry);
        analysis.propagate(entry, AbstractState::entry(ThreadStateSet::main()));

        Ok(analysis)
    }

    /// Runs the worklist until no state changes any more.
    pub fn run(&mut self) -> Result<(), Error> {
        let start = self.iterations;

        while let Some(position) = self.worklist.pop_front() {
            self.queued.remove(&position);
            self.iterations += 1;
            self.step(&position)?;
        }

        log::info!(
            "Fixpoint reached after {} steps: {} usage points over {} locations",
            self.iterations - start,
            self.store.len(),
            self.store.locations().count()
        );

        Ok(())
    }

    fn enqueue(&mut self, position: Position) {
        if self.queued.insert(position.clone()) {
            self.worklist.push_back(position);
        }
    }

    pub(crate) fn propagate(&mut self, position: Position, incoming: AbstractState) {
        let updated = match self.states.get(&position) {
            None => incoming,
            Some(current) => {
                let changes = self.changes.entry(position.clone()).or_default();
                let next = if *changes >= self.options.widening_threshold {
                    log::warn!(
                        "Widening at {}#{} in thread {}",
                        position.function,
                        position.node,
                        position.thread
                    );
                    current.widen(&incoming)
                } else {
                    current.join(&incoming)
                };

                if next == *current {
                    return;
                }
                *changes += 1;
                next
            }
        };

        self.states.insert(position.clone(), updated);
        self.enqueue(position);
    }

    fn record(
        &mut self,
        position: &Position,
        line: Option<u32>,
        location: &MemoryLocation,
        access: AccessKind,
        state: &AbstractState,
    ) {
        if self.options.skipper.should_skip(location, &position.function) {
            return;
        }

        self.store.insert(UsagePoint::new(
            location.clone(),
            access,
            position.thread.clone(),
            state.threads.clone(),
            state.locks.clone(),
            ProgramSite::new(&position.function, position.node, line),
        ));
    }

    fn step(&mut self, position: &Position) -> Result<(), Error> {
        let state = self
            .states
            .get(position)
            .cloned()
            .ok_or_else(|| anyhow!("No state at {}#{}", position.function, position.node))?;
        let node = self.program.node(&position.function, position.node)?.clone();
        let thread = &position.thread;

        log::trace!(
            "{} {}#{}: {:?}",
            thread,
            position.function,
            position.node,
            node.kind
        );

        let out = match &node.kind {
            NodeKind::Read(location) => {
                self.record(position, node.line, location, AccessKind::Read, &state);
                state
            }
            NodeKind::Write(location) => {
                self.record(position, node.line, location, AccessKind::Write, &state);
                state
            }
            NodeKind::Lock(handle) => {
                let mut locks = state.locks.clone();
                LockSetTracker::new(&self.program.aliases).lock(&mut locks, handle);
                AbstractState { locks, ..state }
            }
            NodeKind::Unlock(handle) => {
                let mut locks = state.locks.clone();
                LockSetTracker::new(&self.program.aliases).unlock(&mut locks, handle);
                AbstractState { locks, ..state }
            }
            NodeKind::Create { site, entry } => {
                let spawn = ThreadHierarchyTracker::new().create(thread, &state.threads, site);
                let was_self_parallel = self.registry.is_self_parallel(site);
                self.registry
                    .register_creation(thread, site, entry, &spawn.child)?;
                if !was_self_parallel && self.registry.is_self_parallel(site) {
                    self.revisit_joins(site);
                }
                self.propagate(
                    Position::entry(site, entry),
                    AbstractState::entry(spawn.child),
                );
                AbstractState {
                    threads: spawn.creator,
                    ..state
                }
            }
            NodeKind::Join(site) if self.registry.is_self_parallel(site) => {
                log::debug!("Join of {} leaves its other instances running", site);
                state
            }
            NodeKind::Join(site) => AbstractState {
                threads: ThreadHierarchyTracker::new().join(&state.threads, site),
                ..state
            },
            NodeKind::Call(callee) => return self.enter_call(position, callee, state),
            NodeKind::Assume(condition) => {
                let infeasible = self
                    .precision
                    .get(thread)
                    .is_some_and(|conditions| conditions.contains(condition));
                if infeasible {
                    return Ok(());
                }
                state
            }
            NodeKind::Skip => state,
        };

        self.leave(position, out)
    }

    fn enter_call(
        &mut self,
        position: &Position,
        callee: &str,
        state: AbstractState,
    ) -> Result<(), Error> {
        let active = position
            .stack
            .iter()
            .map(|(function, _)| function.as_str())
            .chain(std::iter::once(position.function.as_str()))
            .position(|function| function == callee);

        match active {
            None => {
                let mut stack = position.stack.clone();
                stack.push((position.function.clone(), position.node));
                self.propagate(position.at(callee, 0, stack), state);
                Ok(())
            }
            Some(level) => {
                let entry = position.at(callee, 0, position.stack[..level].to_vec());
                let frame = entry.frame();

                let added = self
                    .recursive_returns
                    .entry(frame.clone())
                    .or_default()
                    .insert(position.clone());
                if added {
                    log::debug!("Recursive call of `{}` in thread {}", callee, position.thread);
                    // Exits reached before this call was seen must flow back
                    // to it as well.
                    let function = self.program.function(callee)?;
                    let exits: Vec<Position> = self
                        .states
                        .keys()
                        .filter(|p| p.frame() == frame && function.is_exit(p.node))
                        .cloned()
                        .collect();
                    for exit in exits {
                        self.enqueue(exit);
                    }
                }

                self.propagate(entry, state);
                Ok(())
            }
        }
    }

    /// Passes `out` to the successors of `position`. Leaving an exit node
    /// returns to the successors of the innermost call node and of every
    /// recursive call of the exited frame.
    fn leave(&mut self, position: &Position, out: AbstractState) -> Result<(), Error> {
        let mut pending = vec![position.clone()];
        let mut visited = BTreeSet::new();

        while let Some(current) = pending.pop() {
            if !visited.insert(current.clone()) {
                continue;
            }

            let successors = self
                .program
                .function(&current.function)?
                .successors(current.node)
                .to_vec();
            if !successors.is_empty() {
                for successor in successors {
                    let next = current.at(&current.function, successor, current.stack.clone());
                    self.propagate(next, out.clone());
                }
                continue;
            }

            if let Some(calls) = self.recursive_returns.get(&current.frame()) {
                pending.extend(calls.iter().cloned());
            }

            let mut stack = current.stack.clone();
            if let Some((caller, call_node)) = stack.pop() {
                pending.push(current.at(&caller, call_node, stack));
            }
        }

        Ok(())
    }

    /// Joins of `site` that were analyzed before `site` turned out to be
    /// self-parallel are analyzed again.
    fn revisit_joins(&mut self, site: &ThreadId) {
        let joins: Vec<Position> = self
            .states
            .keys()
            .filter(|position| {
                matches!(
                    self.program
                        .node(&position.function, position.node)
                        .map(|node| &node.kind),
                    Ok(NodeKind::Join(joined)) if joined == site
                )
            })
            .cloned()
            .collect();

        for position in joins {
            self.enqueue(position);
        }
    }

    pub fn store(&self) -> &FactStore {
        &self.store
    }

    pub fn registry(&self) -> &ThreadRegistry {
        &self.registry
    }

    pub fn races(&self) -> Vec<RaceCandidate> {
        RaceQuery::new(&self.store).candidates()
    }

    pub fn false_unsafes(&self) -> &BTreeSet<MemoryLocation> {
        &self.false_unsafes
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn report(&self) -> AnalysisReport {
        let mut report = AnalysisReport::new(&self.store, self.races());
        report.fill_thread_records(self.registry.records());
        report.fill_false_unsafes(&self.false_unsafes);
        report.fill_statistics(self.iterations, self.refinements);
        report
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Error;
    use race_detection::{
        LockHandle, LockId, MemoryLocation, ThreadId, ThreadRelation,
        std_format::{self, Annotation},
    };

    use crate::{
        program::{Function, Node, NodeKind, Program},
        skipper::VariableSkipper,
    };

    use super::{Analysis, AnalysisOptions};

    fn write(location: &str) -> Node {
        Node::new(NodeKind::Write(MemoryLocation::new(location)))
    }

    fn read(location: &str) -> Node {
        Node::new(NodeKind::Read(MemoryLocation::new(location)))
    }

    fn create(site: &str, entry: &str) -> Node {
        Node::new(NodeKind::Create {
            site: ThreadId::new(site),
            entry: entry.to_string(),
        })
    }

    fn lock(name: &str) -> Node {
        Node::new(NodeKind::Lock(LockHandle::Direct(LockId::new(name))))
    }

    fn unlock(name: &str) -> Node {
        Node::new(NodeKind::Unlock(LockHandle::Direct(LockId::new(name))))
    }

    fn analyze(program: Program) -> Result<Analysis, Error> {
        let mut analysis = Analysis::new(program, AnalysisOptions::default())?;
        analysis.run()?;
        Ok(analysis)
    }

    fn retained(analysis: &Analysis, location: &str) -> Vec<String> {
        analysis
            .store()
            .antichain(&MemoryLocation::new(location))
            .map(|chain| chain.iter().map(std_format::render).collect())
            .unwrap_or_default()
    }

    fn annotation(text: &str) -> Result<Annotation, Error> {
        std_format::parse(text)
    }

    #[test]
    fn join_makes_parent_access_sequenced() -> Result<(), Error> {
        let program = Program::new("main")
            .with_function(
                "main",
                Function::sequence(vec![
                    create("t1", "worker"),
                    Node::new(NodeKind::Join(ThreadId::new("t1"))),
                    write("g"),
                ]),
            )
            .with_function(
                "worker",
                Function::sequence(vec![lock("l1"), write("g"), unlock("l1")]),
            );

        let analysis = analyze(program)?;
        assert_eq!(
            retained(&analysis, "g"),
            vec![
                "WRITE:[main:{},[]]".to_string(),
                "WRITE:[t1:{t1=CREATED_THREAD},[l1]]".to_string()
            ]
        );
        assert!(analysis.races().is_empty());

        Ok(())
    }

    #[test]
    fn branches_meet_lock_sets() -> Result<(), Error> {
        // 0: lock l1, 1: skip, 2: unlock l1, 3: write g
        // the unlock only happens on one branch
        let program = Program::new("main")
            .with_function(
                "main",
                Function::sequence(vec![create("t1", "worker"), write("g")]),
            )
            .with_function(
                "worker",
                Function::with_edges(
                    vec![lock("l1"), Node::new(NodeKind::Skip), unlock("l1"), write("g")],
                    vec![(0, 1), (0, 2), (1, 3), (2, 3)],
                ),
            );

        let analysis = analyze(program)?;
        assert!(
            retained(&analysis, "g").contains(&"WRITE:[t1:{t1=CREATED_THREAD},[]]".to_string())
        );
        assert_eq!(analysis.races().len(), 1);

        Ok(())
    }

    #[test]
    fn loop_creation_is_self_parallel() -> Result<(), Error> {
        // while (..) { pthread_create(&t2, thread2) }
        let program = Program::new("main")
            .with_function(
                "main",
                Function::with_edges(
                    vec![
                        write("b"),
                        Node::new(NodeKind::Skip),
                        create("t2", "thread2"),
                        Node::new(NodeKind::Skip),
                    ],
                    vec![(0, 1), (1, 2), (2, 1), (1, 3)],
                ),
            )
            .with_function(
                "thread2",
                Function::sequence(vec![lock("l1"), write("b"), unlock("l1"), write("c")]),
            );

        let analysis = analyze(program)?;
        let t2 = annotation("WRITE:[t2:{t2=SELF_PARALLEL_THREAD},[l1]]")?;
        let points = analysis
            .store()
            .antichain(&MemoryLocation::new("b"))
            .map(|chain| chain.iter().filter(|p| t2.matches(p)).count());
        assert_eq!(points, Some(1));

        let races = analysis.races();
        assert_eq!(races.len(), 1);
        assert_eq!(races[0].location, MemoryLocation::new("c"));
        assert_eq!(
            analysis
                .registry()
                .entry_state(&ThreadId::new("t2"))
                .and_then(|s| s.get(&ThreadId::new("t2"))),
            Some(ThreadRelation::SelfParallel)
        );

        Ok(())
    }

    #[test]
    fn join_after_loop_creation_leaves_instances_running() -> Result<(), Error> {
        // while (..) { pthread_create(&t2, thread2) } pthread_join(t2); b = ..
        let program = Program::new("main")
            .with_function(
                "main",
                Function::with_edges(
                    vec![
                        Node::new(NodeKind::Skip),
                        create("t2", "thread2"),
                        Node::new(NodeKind::Join(ThreadId::new("t2"))),
                        write("b"),
                    ],
                    vec![(0, 1), (1, 0), (0, 2), (2, 3)],
                ),
            )
            .with_function(
                "thread2",
                Function::sequence(vec![lock("l1"), write("b"), unlock("l1")]),
            );

        let analysis = analyze(program)?;
        let b = retained(&analysis, "b");
        assert!(b.contains(&"WRITE:[main:{t2=PARENT_THREAD},[]]".to_string()));
        assert!(b.contains(&"WRITE:[t2:{t2=SELF_PARALLEL_THREAD},[l1]]".to_string()));

        let races = analysis.races();
        assert_eq!(races.len(), 1);
        assert_eq!(races[0].location, MemoryLocation::new("b"));

        Ok(())
    }

    #[test]
    fn thread_created_by_self_parallel_thread_keeps_self_race() -> Result<(), Error> {
        let (t1, t3) = (ThreadId::new("t1"), ThreadId::new("t3"));
        let program = Program::new("main")
            .with_function(
                "main",
                Function::with_edges(
                    vec![
                        Node::new(NodeKind::Skip),
                        create("t1", "thread1"),
                        Node::new(NodeKind::Skip),
                    ],
                    vec![(0, 1), (1, 0), (0, 2)],
                ),
            )
            .with_function(
                "thread1",
                Function::sequence(vec![write("g"), create("t3", "thread3")]),
            )
            .with_function("thread3", Function::sequence(vec![write("g")]));

        let analysis = analyze(program)?;
        assert_eq!(
            analysis
                .registry()
                .entry_state(&t3)
                .and_then(|s| s.get(&t3)),
            Some(ThreadRelation::SelfParallel)
        );
        assert_eq!(
            retained(&analysis, "g"),
            vec![
                "WRITE:[t1:{t1=SELF_PARALLEL_THREAD},[]]".to_string(),
                "WRITE:[t3:{t1=SELF_PARALLEL_THREAD,t3=SELF_PARALLEL_THREAD},[]]".to_string()
            ]
        );

        let races = analysis.races();
        assert!(
            races
                .iter()
                .any(|race| race.first == race.second && race.first.thread() == &t1)
        );
        assert_eq!(races.len(), 3);

        Ok(())
    }

    #[test]
    fn calls_return_to_every_caller() -> Result<(), Error> {
        let program = Program::new("main")
            .with_function(
                "main",
                Function::sequence(vec![
                    Node::new(NodeKind::Call("helper".to_string())),
                    create("t1", "worker"),
                    Node::new(NodeKind::Call("helper".to_string())),
                    read("after"),
                ]),
            )
            .with_function("helper", Function::sequence(vec![write("h")]))
            .with_function(
                "worker",
                Function::sequence(vec![Node::new(NodeKind::Call("helper".to_string()))]),
            );

        let analysis = analyze(program)?;

        // The second call in main sees t1, the worker's call sees itself.
        assert_eq!(
            retained(&analysis, "h"),
            vec![
                "WRITE:[main:{t1=PARENT_THREAD},[]]".to_string(),
                "WRITE:[t1:{t1=CREATED_THREAD},[]]".to_string()
            ]
        );
        assert_eq!(
            retained(&analysis, "after"),
            vec!["READ:[main:{t1=PARENT_THREAD},[]]".to_string()]
        );
        assert_eq!(analysis.races().len(), 1);

        Ok(())
    }

    #[test]
    fn skipped_accesses_leave_no_points() -> Result<(), Error> {
        let program = Program::new("main")
            .with_function(
                "main",
                Function::sequence(vec![create("t1", "worker"), write("errno"), write("g")]),
            )
            .with_function("worker", Function::sequence(vec![write("g"), write("errno")]));

        let options = AnalysisOptions {
            skipper: VariableSkipper::new().skip_name("errno"),
            ..AnalysisOptions::default()
        };
        let mut analysis = Analysis::new(program, options)?;
        analysis.run()?;

        assert!(retained(&analysis, "errno").is_empty());
        assert_eq!(analysis.races().len(), 1);
        assert!(analysis.iterations() > 0);

        Ok(())
    }

    #[test]
    fn widening_drops_locks() -> Result<(), Error> {
        // lock(l1); while (..) { } g = ..
        let looping = || {
            Program::new("main").with_function(
                "main",
                Function::with_edges(
                    vec![
                        lock("l1"),
                        Node::new(NodeKind::Skip),
                        Node::new(NodeKind::Skip),
                        write("g"),
                    ],
                    vec![(0, 1), (1, 2), (2, 1), (1, 3)],
                ),
            )
        };

        let precise = analyze(looping())?;
        assert_eq!(retained(&precise, "g"), vec!["WRITE:[main:{},[l1]]".to_string()]);

        let options = AnalysisOptions {
            widening_threshold: 0,
            ..AnalysisOptions::default()
        };
        let mut widened = Analysis::new(looping(), options)?;
        widened.run()?;
        assert_eq!(retained(&widened, "g"), vec!["WRITE:[main:{},[]]".to_string()]);

        Ok(())
    }

    #[test]
    fn recursion_terminates() -> Result<(), Error> {
        let program = Program::new("main")
            .with_function(
                "main",
                Function::sequence(vec![
                    create("t1", "worker"),
                    Node::new(NodeKind::Call("walk".to_string())),
                ]),
            )
            .with_function(
                "walk",
                Function::with_edges(
                    vec![
                        Node::new(NodeKind::Skip),
                        Node::new(NodeKind::Call("walk".to_string())),
                        write("g"),
                    ],
                    vec![(0, 1), (0, 2), (1, 2)],
                ),
            )
            .with_function("worker", Function::sequence(vec![read("g")]));

        let analysis = analyze(program)?;
        assert_eq!(
            retained(&analysis, "g"),
            vec![
                "READ:[t1:{t1=CREATED_THREAD},[]]".to_string(),
                "WRITE:[main:{t1=PARENT_THREAD},[]]".to_string()
            ]
        );
        assert_eq!(analysis.races().len(), 1);

        Ok(())
    }

    #[test]
    fn recursive_unlock_reaches_the_recursive_call_site() -> Result<(), Error> {
        // f() { if (..) unlock(l1); else { f(); g = ..; } }
        let program = Program::new("main")
            .with_function(
                "main",
                Function::sequence(vec![
                    create("t1", "worker"),
                    lock("l1"),
                    Node::new(NodeKind::Call("f".to_string())),
                    unlock("l1"),
                ]),
            )
            .with_function(
                "f",
                Function::with_edges(
                    vec![
                        Node::new(NodeKind::Skip),
                        unlock("l1"),
                        Node::new(NodeKind::Call("f".to_string())),
                        write("g"),
                    ],
                    vec![(0, 1), (0, 2), (2, 3)],
                ),
            )
            .with_function("worker", Function::sequence(vec![read("g")]));

        let analysis = analyze(program)?;
        assert_eq!(
            retained(&analysis, "g"),
            vec![
                "READ:[t1:{t1=CREATED_THREAD},[]]".to_string(),
                "WRITE:[main:{t1=PARENT_THREAD},[]]".to_string()
            ]
        );
        assert_eq!(analysis.races().len(), 1);

        Ok(())
    }
}
