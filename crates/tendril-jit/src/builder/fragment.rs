//! Per-block abstract interpretation into graph fragments

use std::collections::BTreeMap;
use std::sync::Arc;

use tendril_vm::{Insn, Value};
use tracing::trace;

use crate::ir::{Graph, NodeId, Op, Port};

/// The partially connected translation of one basic block.
///
/// Values the block consumes but does not produce are represented by
/// unconnected `input` placeholder nodes, recorded in `names_in` and
/// `stack_in` so the builder can wire them up once every block has been
/// translated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphFragment {
    /// Placeholders for locals read before being written in this block
    pub names_in: BTreeMap<Arc<str>, NodeId>,
    /// Placeholders for operand stack values the block found already on
    /// the stack, deepest first
    pub stack_in: Vec<NodeId>,
    /// Entry node of the block
    pub region: NodeId,
    /// Last value produced by the block
    pub last_node: Option<NodeId>,
    /// Last node on the block's control chain
    pub last_control: NodeId,
    /// Value of every local known at block exit
    pub names_out: BTreeMap<Arc<str>, NodeId>,
    /// Operand stack at block exit, deepest first
    pub stack_out: Vec<NodeId>,
}

impl GraphFragment {
    /// A fragment consisting of just its entry node
    pub fn new(region: NodeId) -> Self {
        GraphFragment {
            names_in: BTreeMap::new(),
            stack_in: Vec::new(),
            region,
            last_node: Some(region),
            last_control: region,
            names_out: BTreeMap::new(),
            stack_out: Vec::new(),
        }
    }
}

/// Symbolic machine state while translating one block
struct BlockState<'g> {
    graph: &'g mut Graph,
    names_in: BTreeMap<Arc<str>, NodeId>,
    stack_in: Vec<NodeId>,
    names: BTreeMap<Arc<str>, NodeId>,
    stack: Vec<NodeId>,
}

impl BlockState<'_> {
    /// Pop the symbolic stack, or stand in for a value a predecessor left
    fn pop(&mut self) -> NodeId {
        match self.stack.pop() {
            Some(node) => node,
            None => {
                let input = self.graph.add_node(Op::Input);
                self.stack_in.insert(0, input);
                input
            }
        }
    }

    fn load(&mut self, name: &Arc<str>) -> NodeId {
        if let Some(&value) = self.names.get(name) {
            return value;
        }
        let input = self.graph.add_node(Op::Input);
        self.names_in.insert(name.clone(), input);
        self.names.insert(name.clone(), input);
        input
    }
}

/// Translate the instructions of one block, starting at absolute index
/// `start`, into a fragment of `graph`.
///
/// Each instruction yields at most one node. `trace`, `send`, `jump` and
/// `branch` are also threaded onto the block's control chain in program
/// order.
pub(crate) fn lower_block(graph: &mut Graph, start: usize, insns: &[Insn]) -> GraphFragment {
    let region = graph.add_node(Op::Region);
    let mut state = BlockState {
        graph,
        names_in: BTreeMap::new(),
        stack_in: Vec::new(),
        names: BTreeMap::new(),
        stack: Vec::new(),
    };
    let mut last_node = None;
    let mut last_control = region;

    for (offset, insn) in insns.iter().enumerate() {
        let ip = start + offset;
        match insn {
            Insn::Trace(line) => {
                let node = state
                    .graph
                    .add_node_with(Op::Trace, [("line", Value::Int(i64::from(*line)))]);
                last_node = Some(node);
            }
            Insn::SelfValue => {
                let node = state.graph.add_node(Op::SelfValue);
                state.stack.push(node);
                last_node = Some(node);
            }
            Insn::Arg(n) => {
                let node = state.graph.add_node_with(Op::Arg, [("n", Value::Int(*n as i64))]);
                state.stack.push(node);
                last_node = Some(node);
            }
            Insn::Load(name) => {
                let value = state.load(name);
                state.stack.push(value);
            }
            Insn::Store(name) => {
                let value = state.pop();
                state.names.insert(name.clone(), value);
            }
            Insn::Push(value) => {
                let node = state.graph.add_node_with(Op::Constant, [("value", value.clone())]);
                state.stack.push(node);
                last_node = Some(node);
            }
            Insn::Send { name, argc } => {
                let send = state.graph.add_node_with(
                    Op::Send,
                    [
                        ("name", Value::Symbol(name.clone())),
                        ("argc", Value::Int(*argc as i64)),
                        ("ip", Value::Int(ip as i64)),
                    ],
                );
                // Popped last argument first; edges are reordered so the
                // send's args appear in call order
                let mut args: Vec<NodeId> = (0..*argc).map(|_| state.pop()).collect();
                args.reverse();
                let receiver = state.pop();
                state.graph.output_to_as(receiver, Port::Value, send, Port::Receiver);
                for arg in args {
                    state.graph.output_to_as(arg, Port::Value, send, Port::Args);
                }
                state.stack.push(send);
                last_node = Some(send);
            }
            Insn::Not => {
                let value = state.pop();
                let node = state.graph.add_node(Op::Not);
                state.graph.output_to(value, Port::Value, node);
                state.stack.push(node);
                last_node = Some(node);
            }
            Insn::Jump(_) => {
                last_node = Some(state.graph.add_node(Op::Jump));
            }
            Insn::Branch(_) => {
                let condition = state.pop();
                let node = state.graph.add_node(Op::Branch);
                state.graph.output_to_as(condition, Port::Value, node, Port::Condition);
                last_node = Some(node);
            }
            Insn::Return => {
                let value = state.pop();
                state.stack.push(value);
                last_node = Some(value);
            }
        }

        if matches!(
            insn,
            Insn::Trace(_) | Insn::Send { .. } | Insn::Jump(_) | Insn::Branch(_)
        ) {
            if let Some(node) = last_node {
                state.graph.output_to(last_control, Port::Control, node);
                last_control = node;
            }
        }
        trace!(ip, insn = %insn, depth = state.stack.len(), "lowered");
    }

    GraphFragment {
        names_in: state.names_in,
        stack_in: state.stack_in,
        region,
        last_node,
        last_control,
        names_out: state.names,
        stack_out: state.stack,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_block() {
        let mut graph = Graph::new();
        let insns = vec![Insn::Arg(0), Insn::push(2), Insn::send("+", 1), Insn::Return];
        let fragment = lower_block(&mut graph, 0, &insns);

        assert!(fragment.names_in.is_empty());
        assert!(fragment.stack_in.is_empty());
        let send = fragment.last_control;
        assert_eq!(graph.op(send), Op::Send);
        assert_eq!(fragment.last_node, Some(send));
        assert_eq!(fragment.stack_out, vec![send]);
        assert_eq!(graph.input_for(send, Port::Receiver).map(|n| graph.op(n)), Some(Op::Arg));
        assert_eq!(graph.input_for(send, Port::Args).map(|n| graph.op(n)), Some(Op::Constant));
        assert_eq!(graph.prop(send, "ip"), Some(&Value::Int(2)));
        assert!(graph.outputs_to(fragment.region, Port::Control, send));
    }

    #[test]
    fn test_underflow_creates_stack_inputs_deepest_first() {
        let mut graph = Graph::new();
        let insns = vec![Insn::send("-", 1)];
        let fragment = lower_block(&mut graph, 4, &insns);

        assert_eq!(fragment.stack_in.len(), 2);
        let send = fragment.last_control;
        assert_eq!(graph.input_for(send, Port::Receiver), Some(fragment.stack_in[0]));
        assert_eq!(graph.input_for(send, Port::Args), Some(fragment.stack_in[1]));
        assert_eq!(graph.prop(send, "ip"), Some(&Value::Int(4)));
    }

    #[test]
    fn test_unknown_name_creates_name_input() {
        let mut graph = Graph::new();
        let insns = vec![Insn::load("x"), Insn::load("x"), Insn::store("y")];
        let fragment = lower_block(&mut graph, 0, &insns);

        let input = fragment.names_in["x"];
        assert_eq!(graph.op(input), Op::Input);
        assert_eq!(fragment.names_in.len(), 1);
        assert_eq!(fragment.names_out["y"], input);
        assert_eq!(fragment.stack_out, vec![input]);
        assert_eq!(fragment.last_node, None);
        assert_eq!(fragment.last_control, fragment.region);
    }

    #[test]
    fn test_control_chain_in_program_order() {
        let mut graph = Graph::new();
        let insns = vec![
            Insn::Trace(1),
            Insn::SelfValue,
            Insn::send("foo", 0),
            Insn::Trace(2),
            Insn::Branch(0),
        ];
        let fragment = lower_block(&mut graph, 0, &insns);

        let mut chain = vec![fragment.region];
        let mut current = fragment.region;
        while let Some(next) = graph.control_outputs(current).next() {
            chain.push(next);
            current = next;
        }
        let ops: Vec<Op> = chain.iter().map(|&n| graph.op(n)).collect();
        assert_eq!(ops, vec![Op::Region, Op::Trace, Op::Send, Op::Trace, Op::Branch]);
        assert_eq!(fragment.last_control, current);
        // The branch condition is the send result
        assert_eq!(graph.input_for(current, Port::Condition), Some(chain[2]));
    }
}
