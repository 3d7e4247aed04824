//! Compilation pipeline: bytecode → graph → optimized graph
//!
//! The pipeline chains together all compilation stages:
//! 1. Build the graph from bytecode
//! 2. Post-build canonicalization (run once)
//! 3. Profile-guided and safepoint passes (run once)
//! 4. Cleanup passes, iterated to a fixpoint
//! 5. Optional structural verification

use tendril_vm::{Insn, Profile};
use tracing::debug;

use crate::builder::{BuildError, Builder};
use crate::ir::{Graph, GraphError};
use crate::passes::{DeadCode, InlineCaching, InsertSafepoints, NoChoicePhis, PostBuild, Runner};

/// Pipeline configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JitConfig {
    /// Maximum rounds of the cleanup passes (default: 16)
    pub max_fixpoint_iterations: usize,
    /// Replace traces with safepoints (default: true)
    pub insert_safepoints: bool,
    /// Guard monomorphic sends when a profile is available (default: true)
    pub inline_caching: bool,
    /// Check graph invariants after compiling (default: on in debug builds)
    pub verify_graph: bool,
}

impl Default for JitConfig {
    fn default() -> Self {
        JitConfig {
            max_fixpoint_iterations: 16,
            insert_safepoints: true,
            inline_caching: true,
            verify_graph: cfg!(debug_assertions),
        }
    }
}

/// Errors from the compilation pipeline
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JitError {
    #[error("Build error: {0}")]
    Build(#[from] BuildError),
    #[error("Graph invariant violated: {0}")]
    Verify(#[from] GraphError),
}

/// Compiles methods to optimized graphs
#[derive(Debug)]
pub struct Compiler {
    config: JitConfig,
    post_build: Runner,
    cleanup: Runner,
}

impl Compiler {
    /// Create a compiler with the default configuration
    pub fn new() -> Self {
        Self::with_config(JitConfig::default())
    }

    pub fn with_config(config: JitConfig) -> Self {
        Compiler {
            config,
            post_build: Runner::new(vec![Box::new(PostBuild)]),
            cleanup: Runner::new(vec![Box::new(DeadCode), Box::new(NoChoicePhis)]),
        }
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    /// Build and optimize the graph for one method
    pub fn compile(&self, insns: &[Insn], profile: Option<&Profile>) -> Result<Graph, JitError> {
        let mut builder = Builder::new();
        builder.build(insns)?;
        let mut graph = builder.into_graph();
        let built = graph.size();

        self.post_build.run(&mut graph);
        self.optimizations(profile).run(&mut graph);
        let outcome = self.cleanup.run_to_fixpoint(&mut graph, self.config.max_fixpoint_iterations);

        if self.config.verify_graph {
            graph.verify()?;
        }

        debug!(
            insns = insns.len(),
            built,
            optimized = graph.size(),
            iterations = outcome.iterations,
            "compiled method"
        );
        Ok(graph)
    }

    /// One-shot passes enabled for this compilation
    fn optimizations(&self, profile: Option<&Profile>) -> Runner {
        let mut runner = Runner::empty();
        if let Some(profile) = profile.filter(|_| self.config.inline_caching) {
            runner.add_pass(Box::new(InlineCaching::new(profile.clone())));
        }
        if self.config.insert_safepoints {
            runner.add_pass(Box::new(InsertSafepoints));
        }
        runner
    }
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Op, Port};
    use tendril_vm::Value;

    #[test]
    fn test_compile_add() {
        let insns = vec![Insn::Arg(0), Insn::push(2), Insn::send("+", 1), Insn::Return];
        let graph = Compiler::new().compile(&insns, None).unwrap();

        let send = graph.find_node(Some(Op::Send), |_| true).unwrap();
        let safepoint = graph.find_node(Some(Op::Safepoint), |_| true).unwrap();
        assert!(graph.outputs_to(send, Port::Value, graph.finish()));
        assert!(graph.outputs_to(send, Port::Control, safepoint));
        assert!(graph.outputs_to(safepoint, Port::Control, graph.finish()));
        assert_eq!(graph.size(), 6);
    }

    #[test]
    fn test_compile_without_safepoints() {
        let config = JitConfig { insert_safepoints: false, ..Default::default() };
        let insns = vec![Insn::Trace(1), Insn::push(1), Insn::Return];
        let graph = Compiler::with_config(config).compile(&insns, None).unwrap();
        assert!(graph.nodes_with_op(Op::Safepoint).is_empty());
        assert_eq!(graph.nodes_with_op(Op::Trace).len(), 1);
    }

    #[test]
    fn test_inline_caching_needs_profile_and_flag() {
        let insns = vec![Insn::Arg(0), Insn::push(2), Insn::send("+", 1), Insn::Return];
        let mut profile = Profile::new();
        profile.record_send(2, Value::Int(0).kind());

        let compiler = Compiler::new();
        let guarded = compiler.compile(&insns, Some(&profile)).unwrap();
        assert_eq!(guarded.nodes_with_op(Op::Guard).len(), 1);
        let unguarded = compiler.compile(&insns, None).unwrap();
        assert!(unguarded.nodes_with_op(Op::Guard).is_empty());

        let config = JitConfig { inline_caching: false, ..Default::default() };
        let disabled = Compiler::with_config(config).compile(&insns, Some(&profile)).unwrap();
        assert!(disabled.nodes_with_op(Op::Guard).is_empty());
    }

    #[test]
    fn test_build_errors_propagate() {
        let err = Compiler::new().compile(&[Insn::Not], None).unwrap_err();
        assert_eq!(err, JitError::Build(BuildError::StackUnderflow { block: 0 }));
    }
}
