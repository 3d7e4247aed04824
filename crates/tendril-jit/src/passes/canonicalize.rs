//! Cleanups of the shapes the builder leaves behind

use tracing::trace;

use super::Pass;
use crate::ir::{Graph, NodeId, Op};

// ===== Post-build =====

/// Bypasses resolved `input` placeholders.
///
/// Once stitching has given a placeholder its single source, the
/// placeholder is only an indirection: its users are moved over to the
/// source and the placeholder is removed. Placeholders without a source
/// (standalone fragments) are left alone.
pub struct PostBuild;

impl Pass for PostBuild {
    fn name(&self) -> &str {
        "post-build"
    }

    fn run(&self, graph: &mut Graph) -> bool {
        let mut changed = false;

        for input in graph.nodes_with_op(Op::Input) {
            let sources: Vec<NodeId> = graph.value_inputs(input).collect();
            let &[source] = sources.as_slice() else { continue };
            let moved = graph.replace_value_uses(input, source);
            trace!(node = %input, %source, moved, "bypassing input");
            graph.remove(input);
            changed = true;
        }

        changed
    }
}

// ===== No-choice phis =====

/// Replaces phis that can only ever produce one value.
///
/// A phi whose value inputs, ignoring references to itself, all come from
/// the same node is that node.
pub struct NoChoicePhis;

impl NoChoicePhis {
    fn only_choice(graph: &Graph, phi: NodeId) -> Option<NodeId> {
        let mut sources = graph.value_inputs(phi).filter(|&source| source != phi);
        let first = sources.next()?;
        sources.all(|source| source == first).then_some(first)
    }
}

impl Pass for NoChoicePhis {
    fn name(&self) -> &str {
        "no-choice-phis"
    }

    fn run(&self, graph: &mut Graph) -> bool {
        let mut changed = false;

        for phi in graph.nodes_with_op(Op::Phi) {
            if graph.node(phi).is_removed() {
                continue;
            }
            let Some(source) = Self::only_choice(graph, phi) else { continue };
            trace!(node = %phi, %source, "replacing no-choice phi");
            graph.replace_value_uses(phi, source);
            graph.remove(phi);
            changed = true;
        }

        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::build_graph;
    use crate::ir::Port;
    use tendril_vm::{Insn, Value};

    fn branch_merge(second: i64) -> Vec<Insn> {
        vec![
            Insn::Arg(0),
            Insn::Branch(5),
            Insn::push(1),
            Insn::store("x"),
            Insn::Jump(7),
            Insn::push(second),
            Insn::store("x"),
            Insn::load("x"),
            Insn::Return,
        ]
    }

    #[test]
    fn test_post_build_bypasses_inputs() {
        let mut graph = build_graph(&branch_merge(2)).unwrap();
        assert!(!graph.nodes_with_op(Op::Input).is_empty());

        assert!(PostBuild.run(&mut graph));
        assert!(graph.nodes_with_op(Op::Input).is_empty());

        let phi = graph.find_node(Some(Op::Phi), |_| true).unwrap();
        assert!(graph.outputs_to(phi, Port::Value, graph.finish()));
        assert!(graph.verify().is_ok());
        assert!(!PostBuild.run(&mut graph));
    }

    #[test]
    fn test_post_build_keeps_unresolved_inputs() {
        let mut graph = Graph::new();
        let input = graph.add_node(Op::Input);
        graph.output_to(input, Port::Value, graph.finish());
        graph.output_to(graph.start(), Port::Control, graph.finish());

        assert!(!PostBuild.run(&mut graph));
        assert!(!graph.node(input).is_removed());
    }

    #[test]
    fn test_phi_with_distinct_inputs_is_kept() {
        let mut graph = build_graph(&branch_merge(2)).unwrap();
        PostBuild.run(&mut graph);
        assert!(!NoChoicePhis.run(&mut graph));
        assert_eq!(graph.nodes_with_op(Op::Phi).len(), 1);
    }

    #[test]
    fn test_phi_of_one_value_is_replaced() {
        let mut graph = Graph::new();
        let region = graph.add_node(Op::Region);
        let left = graph.add_node(Op::Jump);
        let right = graph.add_node(Op::Jump);
        let constant = graph.add_node_with(Op::Constant, [("value", Value::Int(7))]);
        let phi = graph.add_node(Op::Phi);
        graph.output_to(graph.start(), Port::Control, left);
        graph.output_to(graph.start(), Port::Control, right);
        graph.output_to(left, Port::Control, region);
        graph.output_to(right, Port::Control, region);
        graph.output_to(region, Port::Control, phi);
        graph.output_to(constant, Port::Value, phi);
        graph.output_to(phi, Port::Value, phi);
        graph.output_to(region, Port::Control, graph.finish());
        graph.output_to(phi, Port::Value, graph.finish());

        assert!(NoChoicePhis.run(&mut graph));
        assert!(graph.node(phi).is_removed());
        assert!(graph.outputs_to(constant, Port::Value, graph.finish()));
        assert!(graph.verify().is_ok());
    }

    #[test]
    fn test_pass_through_phi_collapses() {
        let insns = vec![
            Insn::push(5),
            Insn::store("x"),
            Insn::Arg(0),
            Insn::Branch(5),
            Insn::Trace(1),
            Insn::load("x"),
            Insn::Return,
        ];
        let mut graph = build_graph(&insns).unwrap();
        PostBuild.run(&mut graph);
        assert!(NoChoicePhis.run(&mut graph));

        assert!(graph.nodes_with_op(Op::Phi).is_empty());
        let result: Vec<Option<Value>> = graph
            .value_inputs(graph.finish())
            .map(|n| graph.prop(n, "value").cloned())
            .collect();
        assert_eq!(result, vec![Some(Value::Int(5))]);
    }
}
