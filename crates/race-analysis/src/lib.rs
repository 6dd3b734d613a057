mod fixpoint;
/// The program model handed over by the front end
pub mod program;
mod refinement;
mod skipper;
/// Bookkeeping of discovered threads
pub mod tmgmt;

pub use fixpoint::{Analysis, AnalysisOptions, DEFAULT_WIDENING_THRESHOLD};
pub use program::{Function, Node, NodeKind, Program};
pub use refinement::RefinementRequest;
pub use skipper::VariableSkipper;
