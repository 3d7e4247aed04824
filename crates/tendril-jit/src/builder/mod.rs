//! Bytecode to graph construction
//!
//! Every basic block is first translated on its own into a
//! [`GraphFragment`], leaving the values it inherits from other blocks as
//! `input` placeholders. The fragments are then stitched together: a block
//! with one predecessor takes its inherited values straight from that
//! predecessor, and a block with several predecessors gets a phi per
//! inherited value, controlled by the block's region.

mod fragment;

use std::collections::{BTreeMap, BTreeSet};

use tendril_vm::Insn;
use tracing::debug;

use crate::analysis::cfg::{basic_blocks, BasicBlock};
use crate::ir::{Graph, NodeId, Op, Port};

pub use fragment::GraphFragment;

/// Error building a graph. No partial graph is produced.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    #[error("Instruction {at} jumps to {target}, outside method of {len} instructions")]
    InvalidTarget { at: usize, target: usize, len: usize },
    #[error("Unsupported control flow: block at {block} has {successors} successors")]
    UnsupportedControlFlow { block: usize, successors: usize },
    #[error("Operand stack underflow in entry block at {block}")]
    StackUnderflow { block: usize },
    #[error("Local `{name}` may be read before assignment (block at {block})")]
    UndefinedName { name: String, block: usize },
}

/// Builds a graph from an instruction sequence
#[derive(Debug, Clone, Default)]
pub struct Builder {
    graph: Graph,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn into_graph(self) -> Graph {
        self.graph
    }

    /// Translate a single block on its own, into this builder's graph
    pub fn basic_block_to_fragment(&mut self, insns: &[Insn]) -> GraphFragment {
        fragment::lower_block(&mut self.graph, 0, insns)
    }

    /// Build a whole method, replacing this builder's graph on success
    pub fn build(&mut self, insns: &[Insn]) -> Result<(), BuildError> {
        let blocks = basic_blocks(insns)?;

        for block in blocks.values() {
            let branch = matches!(block.terminator(), Some(Insn::Branch(_)));
            if block.next.len() > 2 || (block.next.len() == 2 && !branch) {
                return Err(BuildError::UnsupportedControlFlow {
                    block: block.start,
                    successors: block.next.len(),
                });
            }
        }

        let blocks = reachable_blocks(blocks);
        let mut graph = Graph::new();
        let mut fragments: BTreeMap<usize, GraphFragment> = blocks
            .values()
            .map(|block| {
                (block.start, fragment::lower_block(&mut graph, block.start, block.live_insns()))
            })
            .collect();

        thread_inherited_values(&mut graph, &blocks, &mut fragments, insns.len())?;

        for block in blocks.values() {
            connect_inputs(&mut graph, block, &fragments)?;
            connect_outputs(&mut graph, block, &fragments)?;
        }

        debug!(blocks = blocks.len(), nodes = graph.size(), "built graph");
        self.graph = graph;
        Ok(())
    }
}

/// Build a graph for `insns` in one step
pub fn build_graph(insns: &[Insn]) -> Result<Graph, BuildError> {
    let mut builder = Builder::new();
    builder.build(insns)?;
    Ok(builder.into_graph())
}

/// Start offset of the block control enters the method through
const ENTRY: usize = 0;

/// The blocks control can reach from the method entry. Predecessor lists
/// only name reachable blocks.
fn reachable_blocks<'a>(
    mut blocks: BTreeMap<usize, BasicBlock<'a>>,
) -> BTreeMap<usize, BasicBlock<'a>> {
    let mut reached = BTreeSet::new();
    let mut worklist = vec![ENTRY];
    while let Some(start) = worklist.pop() {
        let Some(block) = blocks.get(&start) else { continue };
        if reached.insert(start) {
            worklist.extend(block.next.iter().copied());
        }
    }

    let unreachable = blocks.len() - reached.len();
    if unreachable > 0 {
        debug!(unreachable, "dropping unreachable blocks");
    }
    blocks.retain(|start, _| reached.contains(start));
    for block in blocks.values_mut() {
        block.prev.retain(|pred| reached.contains(pred));
    }
    blocks
}

/// Make every value a block inherits available at the exit of each of its
/// predecessors.
///
/// A predecessor that neither defines a needed local nor leaves enough
/// values on the stack gets placeholders of its own, which in turn must be
/// supplied by its predecessors. Repeats until nothing changes. Control
/// also enters the entry block from `Start`, which supplies nothing, so
/// anything the entry block still needs is an error even when it has
/// predecessors of its own. No block can inherit more stack slots than
/// there are instructions.
fn thread_inherited_values(
    graph: &mut Graph,
    blocks: &BTreeMap<usize, BasicBlock<'_>>,
    fragments: &mut BTreeMap<usize, GraphFragment>,
    max_depth: usize,
) -> Result<(), BuildError> {
    loop {
        let mut changed = false;

        for block in blocks.values() {
            let Some(fragment) = fragments.get(&block.start) else { continue };
            let names: Vec<_> = fragment.names_in.keys().cloned().collect();
            let depth = fragment.stack_in.len();

            if depth > max_depth {
                return Err(BuildError::StackUnderflow { block: block.start });
            }

            if block.start == ENTRY {
                if depth > 0 {
                    return Err(BuildError::StackUnderflow { block: block.start });
                }
                if let Some(name) = names.first() {
                    return Err(BuildError::UndefinedName {
                        name: name.to_string(),
                        block: block.start,
                    });
                }
                continue;
            }

            for pred in &block.prev {
                let Some(pred_fragment) = fragments.get_mut(pred) else { continue };
                for name in &names {
                    if !pred_fragment.names_out.contains_key(name) {
                        let input = graph.add_node(Op::Input);
                        pred_fragment.names_in.insert(name.clone(), input);
                        pred_fragment.names_out.insert(name.clone(), input);
                        changed = true;
                    }
                }
                while pred_fragment.stack_out.len() < depth {
                    let input = graph.add_node(Op::Input);
                    pred_fragment.stack_in.insert(0, input);
                    pred_fragment.stack_out.insert(0, input);
                    changed = true;
                }
            }
        }

        if !changed {
            return Ok(());
        }
    }
}

/// Value a predecessor supplies for a block's local `name`
fn name_source(pred: &GraphFragment, name: &str, block: usize) -> Result<NodeId, BuildError> {
    pred.names_out
        .get(name)
        .copied()
        .ok_or_else(|| BuildError::UndefinedName { name: name.to_string(), block })
}

/// Value a predecessor supplies for stack slot `index` of a block that
/// inherits `depth` slots. Slots are matched from the top of the stack.
fn stack_source(
    pred: &GraphFragment,
    depth: usize,
    index: usize,
    block: usize,
) -> Result<NodeId, BuildError> {
    pred.stack_out
        .len()
        .checked_sub(depth)
        .map(|base| pred.stack_out[base + index])
        .ok_or(BuildError::StackUnderflow { block })
}

fn connect_inputs(
    graph: &mut Graph,
    block: &BasicBlock<'_>,
    fragments: &BTreeMap<usize, GraphFragment>,
) -> Result<(), BuildError> {
    let fragment = &fragments[&block.start];
    let depth = fragment.stack_in.len();

    // The entry block inherits nothing, so it never needs phis even when
    // loops jump back to it
    if block.start == ENTRY {
        graph.output_to(graph.start(), Port::Control, fragment.region);
        return Ok(());
    }

    match block.prev.as_slice() {
        [] => {}
        [pred] => {
            let pred = &fragments[pred];
            for (name, &input) in &fragment.names_in {
                let source = name_source(pred, name, block.start)?;
                graph.output_to(source, Port::Value, input);
            }
            for (index, &input) in fragment.stack_in.iter().enumerate() {
                let source = stack_source(pred, depth, index, block.start)?;
                graph.output_to(source, Port::Value, input);
            }
        }
        preds => {
            for (name, &input) in &fragment.names_in {
                let phi = graph.add_node(Op::Phi);
                graph.output_to(fragment.region, Port::Control, phi);
                for pred in preds {
                    let source = name_source(&fragments[pred], name, block.start)?;
                    graph.output_to(source, Port::Value, phi);
                }
                graph.output_to(phi, Port::Value, input);
            }
            for (index, &input) in fragment.stack_in.iter().enumerate() {
                let phi = graph.add_node(Op::Phi);
                graph.output_to(fragment.region, Port::Control, phi);
                for pred in preds {
                    let source = stack_source(&fragments[pred], depth, index, block.start)?;
                    graph.output_to(source, Port::Value, phi);
                }
                graph.output_to(phi, Port::Value, input);
            }
        }
    }
    Ok(())
}

fn connect_outputs(
    graph: &mut Graph,
    block: &BasicBlock<'_>,
    fragments: &BTreeMap<usize, GraphFragment>,
) -> Result<(), BuildError> {
    let fragment = &fragments[&block.start];

    match block.next.as_slice() {
        [] => {
            graph.output_to(fragment.last_control, Port::Control, graph.finish());
            if let Some(last) = fragment.last_node {
                graph.output_to(last, Port::Value, graph.finish());
            }
        }
        [next] => {
            graph.output_to(fragment.last_control, Port::Control, fragments[next].region);
        }
        [taken, fallthrough] if graph.op(fragment.last_control) == Op::Branch => {
            graph.output_to_as(
                fragment.last_control,
                Port::True,
                fragments[taken].region,
                Port::Control,
            );
            graph.output_to_as(
                fragment.last_control,
                Port::False,
                fragments[fallthrough].region,
                Port::Control,
            );
        }
        next => {
            return Err(BuildError::UnsupportedControlFlow {
                block: block.start,
                successors: next.len(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tendril_vm::Value;

    fn branch_merge() -> Vec<Insn> {
        vec![
            Insn::Arg(0),
            Insn::Branch(5),
            Insn::push(1),
            Insn::store("x"),
            Insn::Jump(7),
            Insn::push(2),
            Insn::store("x"),
            Insn::load("x"),
            Insn::Return,
        ]
    }

    #[test]
    fn test_build_add() {
        let insns = vec![Insn::Arg(0), Insn::push(2), Insn::send("+", 1), Insn::Return];
        let graph = build_graph(&insns).unwrap();

        let send = graph.find_node(Some(Op::Send), |_| true).unwrap();
        assert_eq!(graph.prop(send, "name"), Some(&Value::symbol("+")));
        assert_eq!(graph.input_for(send, Port::Receiver).map(|n| graph.op(n)), Some(Op::Arg));
        assert_eq!(graph.input_for(send, Port::Args).map(|n| graph.op(n)), Some(Op::Constant));
        assert!(graph.outputs_to(send, Port::Value, graph.finish()));
        assert!(graph.outputs_to(send, Port::Control, graph.finish()));
        assert_eq!(graph.nodes_with_op(Op::Region).len(), 1);
        assert!(graph.nodes_with_op(Op::Phi).is_empty());
    }

    #[test]
    fn test_build_merge_inserts_one_phi() {
        let graph = build_graph(&branch_merge()).unwrap();

        let phis = graph.nodes_with_op(Op::Phi);
        assert_eq!(phis.len(), 1);
        let phi = phis[0];

        let values: Vec<Value> = graph
            .value_inputs(phi)
            .filter_map(|n| graph.prop(n, "value").cloned())
            .collect();
        assert_eq!(values, vec![Value::Int(1), Value::Int(2)]);

        let controls: Vec<NodeId> = graph.control_inputs(phi).collect();
        assert_eq!(controls.len(), 1);
        assert_eq!(graph.op(controls[0]), Op::Region);
        assert_eq!(graph.control_inputs(controls[0]).count(), 2);
        assert!(graph.verify().is_ok());
    }

    #[test]
    fn test_build_branch_arms() {
        let graph = build_graph(&branch_merge()).unwrap();
        let branch = graph.find_node(Some(Op::Branch), |_| true).unwrap();
        let arms: Vec<Port> = graph.outputs(branch).map(|e| e.output).collect();
        assert_eq!(arms, vec![Port::True, Port::False]);
        assert!(graph.outputs(branch).all(|e| e.is_control()));
    }

    #[test]
    fn test_build_stack_value_across_blocks() {
        // arg 0 stays on the stack across the branch and through the trace block
        let insns = vec![
            Insn::Arg(0),
            Insn::Arg(1),
            Insn::Branch(4),
            Insn::Trace(3),
            Insn::send("+", 0),
            Insn::Return,
        ];
        let graph = build_graph(&insns).unwrap();
        assert!(graph.verify().is_ok());

        let send = graph.find_node(Some(Op::Send), |_| true).unwrap();
        let receiver = graph.input_for(send, Port::Receiver).unwrap();
        assert_eq!(graph.op(receiver), Op::Input);
        let phi = graph.value_inputs(receiver).next().unwrap();
        assert_eq!(graph.op(phi), Op::Phi);
        assert_eq!(graph.value_inputs(phi).count(), 2);
    }

    #[test]
    fn test_build_threads_values_through_untouched_blocks() {
        let insns = vec![
            Insn::push(5),
            Insn::store("x"),
            Insn::Arg(0),
            Insn::Branch(5),
            Insn::Trace(1),
            Insn::load("x"),
            Insn::Return,
        ];
        let graph = build_graph(&insns).unwrap();
        assert!(graph.verify().is_ok());

        let phi = graph.find_node(Some(Op::Phi), |_| true).unwrap();
        let sources: Vec<Op> = graph.value_inputs(phi).map(|n| graph.op(n)).collect();
        assert_eq!(sources, vec![Op::Constant, Op::Input]);
    }

    #[test]
    fn test_build_loop() {
        let insns = vec![
            Insn::push(0),
            Insn::store("i"),
            Insn::load("i"),
            Insn::push(10),
            Insn::send("<", 1),
            Insn::Not,
            Insn::Branch(12),
            Insn::load("i"),
            Insn::push(1),
            Insn::send("+", 1),
            Insn::store("i"),
            Insn::Jump(2),
            Insn::load("i"),
            Insn::Return,
        ];
        let graph = build_graph(&insns).unwrap();
        assert!(graph.verify().is_ok());

        let phis = graph.nodes_with_op(Op::Phi);
        assert_eq!(phis.len(), 1);
        let sources: Vec<Op> = graph.value_inputs(phis[0]).map(|n| graph.op(n)).collect();
        assert_eq!(sources, vec![Op::Constant, Op::Send]);

        let mut seen = graph.all_nodes();
        let total = seen.len();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), total);
    }

    #[test]
    fn test_build_stops_at_mid_block_return() {
        let insns = vec![Insn::push(1), Insn::Return, Insn::push(2), Insn::Return];
        let graph = build_graph(&insns).unwrap();
        let values: Vec<Value> = graph
            .value_inputs(graph.finish())
            .filter_map(|n| graph.prop(n, "value").cloned())
            .collect();
        assert_eq!(values, vec![Value::Int(1)]);
    }

    #[test]
    fn test_build_errors() {
        assert_eq!(
            build_graph(&[Insn::Not, Insn::Return]),
            Err(BuildError::StackUnderflow { block: 0 })
        );
        assert_eq!(
            build_graph(&[Insn::load("x"), Insn::Return]),
            Err(BuildError::UndefinedName { name: "x".to_string(), block: 0 })
        );
        assert_eq!(
            build_graph(&[Insn::Jump(9)]),
            Err(BuildError::InvalidTarget { at: 0, target: 9, len: 1 })
        );
    }

    #[test]
    fn test_build_loop_at_method_entry() {
        // do { trace } while !arg0; 1
        let insns = vec![
            Insn::Trace(1),
            Insn::Arg(0),
            Insn::Not,
            Insn::Branch(0),
            Insn::push(1),
            Insn::Return,
        ];
        let graph = build_graph(&insns).unwrap();
        assert!(graph.verify().is_ok());

        let branch = graph.find_node(Some(Op::Branch), |_| true).unwrap();
        let entry = graph
            .outputs(graph.start())
            .map(|edge| edge.to)
            .find(|&node| graph.op(node) == Op::Region)
            .unwrap();
        assert!(graph.outputs_to(branch, Port::True, entry));
        assert_eq!(graph.control_inputs(entry).count(), 2);
        assert!(graph.nodes_with_op(Op::Phi).is_empty());
        assert!(graph.contains(|node| node.op() == Op::Trace));
        assert_eq!(graph.control_inputs(graph.finish()).count(), 1);
    }

    #[test]
    fn test_build_entry_loop_cannot_inherit() {
        assert_eq!(
            build_graph(&[
                Insn::load("x"),
                Insn::store("x"),
                Insn::Arg(0),
                Insn::Branch(0),
                Insn::push(1),
                Insn::Return,
            ]),
            Err(BuildError::UndefinedName { name: "x".to_string(), block: 0 })
        );
        assert_eq!(
            build_graph(&[Insn::Arg(0), Insn::Branch(0), Insn::Not, Insn::Return]),
            Err(BuildError::StackUnderflow { block: 0 })
        );
    }

    #[test]
    fn test_build_skips_unreachable_loop() {
        // The loop after the return pops more than it pushes on every pass
        let insns = vec![
            Insn::push(1),
            Insn::Return,
            Insn::store("x"),
            Insn::Arg(0),
            Insn::Branch(2),
        ];
        let graph = build_graph(&insns).unwrap();
        assert!(graph.verify().is_ok());
        assert!(!graph.contains(|node| node.op() == Op::Branch));
        assert!(graph.nodes_with_op(Op::Input).is_empty());

        let values: Vec<Value> = graph
            .value_inputs(graph.finish())
            .filter_map(|n| graph.prop(n, "value").cloned())
            .collect();
        assert_eq!(values, vec![Value::Int(1)]);
    }

    #[test]
    fn test_build_skips_block_only_dead_code_jumps_to() {
        let insns = vec![Insn::push(1), Insn::Return, Insn::Jump(3), Insn::push(2), Insn::Return];
        let graph = build_graph(&insns).unwrap();
        assert_eq!(graph.nodes_with_op(Op::Constant).len(), 1);
        assert_eq!(graph.outputs(graph.start()).count(), 1);
    }

    #[test]
    fn test_build_reachable_loop_that_drains_the_stack() {
        // Each pass through the loop pops one value more than it pushes
        let insns = vec![
            Insn::Arg(0),
            Insn::store("x"),
            Insn::Arg(0),
            Insn::Branch(1),
            Insn::Return,
        ];
        assert_eq!(build_graph(&insns), Err(BuildError::StackUnderflow { block: 0 }));
    }

    #[test]
    fn test_failed_build_keeps_previous_graph() {
        let mut builder = Builder::new();
        builder.build(&[Insn::push(1), Insn::Return]).unwrap();
        let size = builder.graph().size();
        assert!(builder.build(&[Insn::Not]).is_err());
        assert_eq!(builder.graph().size(), size);
    }

    #[test]
    fn test_basic_block_to_fragment() {
        let mut builder = Builder::new();
        let fragment = builder.basic_block_to_fragment(&[Insn::SelfValue, Insn::send("foo", 0)]);
        let graph = Graph::from_fragment(builder.into_graph(), &fragment);
        assert_eq!(graph.root(), fragment.region);
        assert!(graph.contains(|node| node.op() == Op::Send));
        assert!(!graph.contains(|node| node.op() == Op::Start));
        assert_eq!(graph.size(), 3);
    }
}
