//! Graph rewriting passes
//!
//! Each pass implements the `Pass` trait and rewrites a `Graph` in place,
//! reporting whether it changed anything. A `Runner` applies an ordered
//! list of passes once per call; iterating to a fixpoint is the caller's
//! choice.

mod canonicalize;
mod dead_code;
mod inline_caching;
mod safepoints;

use tracing::{debug, warn};

use crate::ir::Graph;

pub use canonicalize::{NoChoicePhis, PostBuild};
pub use dead_code::DeadCode;
pub use inline_caching::InlineCaching;
pub use safepoints::InsertSafepoints;

/// A graph rewriting pass
pub trait Pass: Send + Sync {
    /// Name of this pass (for diagnostics)
    fn name(&self) -> &str;
    /// Run the pass over `graph`, returning whether it was modified.
    ///
    /// A pass must leave every invariant checked by `Graph::verify` intact.
    fn run(&self, graph: &mut Graph) -> bool;
}

/// Result of [`Runner::run_to_fixpoint`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixpointOutcome {
    /// Rounds run, including the final round that changed nothing
    pub iterations: usize,
    /// Whether a round finished without any pass changing the graph
    pub converged: bool,
}

/// Applies a sequence of passes in order
#[derive(Default)]
pub struct Runner {
    passes: Vec<Box<dyn Pass>>,
}

impl Runner {
    pub fn new(passes: Vec<Box<dyn Pass>>) -> Self {
        Runner { passes }
    }

    /// A runner with no passes
    pub fn empty() -> Self {
        Runner { passes: Vec::new() }
    }

    pub fn add_pass(&mut self, pass: Box<dyn Pass>) {
        self.passes.push(pass);
    }

    pub fn len(&self) -> usize {
        self.passes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }

    /// Names of the passes, in run order
    pub fn pass_names(&self) -> Vec<&str> {
        self.passes.iter().map(|pass| pass.name()).collect()
    }

    /// Run every pass once, in order. Returns whether any pass changed the
    /// graph.
    pub fn run(&self, graph: &mut Graph) -> bool {
        let mut changed = false;
        for pass in &self.passes {
            let modified = pass.run(graph);
            debug!(pass = pass.name(), modified, nodes = graph.size(), "ran pass");
            changed |= modified;
        }
        changed
    }

    /// Repeat [`Runner::run`] until a round changes nothing, or until
    /// `max_iterations` rounds have run.
    pub fn run_to_fixpoint(&self, graph: &mut Graph, max_iterations: usize) -> FixpointOutcome {
        for iteration in 1..=max_iterations {
            if !self.run(graph) {
                debug!(iterations = iteration, "reached fixpoint");
                return FixpointOutcome { iterations: iteration, converged: true };
            }
        }
        warn!(max_iterations, passes = ?self.pass_names(), "no fixpoint within iteration limit");
        FixpointOutcome { iterations: max_iterations, converged: false }
    }
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner").field("passes", &self.pass_names()).finish()
    }
}
