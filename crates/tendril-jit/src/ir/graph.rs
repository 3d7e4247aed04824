//! The graph: an arena of nodes and edges with one `Start` and one `Finish`
//!
//! Nodes and edges are never freed. Removing a node unlinks every edge that
//! touches it, after which it is unreachable and drops out of traversals.
//! The node set of a graph is whatever a traversal from its root reaches.

use tendril_vm::Value;

use super::node::{Edge, EdgeId, Node, NodeId, Op, Port, Props};
use crate::builder::GraphFragment;

/// Invariant violation detected by [`Graph::verify`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("Start node {0} has inputs")]
    StartHasInputs(NodeId),
    #[error("Finish node {0} has outputs")]
    FinishHasOutputs(NodeId),
    #[error("Phi {phi} has {count} control inputs, expected exactly 1")]
    PhiControl { phi: NodeId, count: usize },
    #[error("Phi {phi} is controlled by {op} node {from}, expected a region")]
    PhiOutsideRegion { phi: NodeId, from: NodeId, op: Op },
    #[error("Phi {phi} has {values} value inputs but its region has {preds} predecessors")]
    PhiArity {
        phi: NodeId,
        values: usize,
        preds: usize,
    },
    #[error("Edge {from} -> {to} touches a removed node")]
    DanglingEdge { from: NodeId, to: NodeId },
}

/// A sea-of-nodes graph
#[derive(Debug, Clone, PartialEq)]
pub struct Graph {
    nodes: Vec<Node>,
    edges: Vec<Option<Edge>>,
    start: NodeId,
    finish: NodeId,
    /// Where traversals begin: `start` for whole programs, a region for
    /// graphs made from a single fragment
    root: NodeId,
}

impl Graph {
    /// Create a graph containing only its start and finish nodes
    pub fn new() -> Self {
        let mut graph = Graph {
            nodes: Vec::new(),
            edges: Vec::new(),
            start: NodeId(0),
            finish: NodeId(0),
            root: NodeId(0),
        };
        graph.start = graph.add_node(Op::Start);
        graph.finish = graph.add_node(Op::Finish);
        graph.root = graph.start;
        graph
    }

    /// View the nodes of `graph` reachable from a fragment's entry region
    pub fn from_fragment(mut graph: Graph, fragment: &GraphFragment) -> Self {
        graph.root = fragment.region;
        graph
    }

    pub fn start(&self) -> NodeId {
        self.start
    }

    pub fn finish(&self) -> NodeId {
        self.finish
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    // ===== Construction =====

    pub fn add_node(&mut self, op: Op) -> NodeId {
        self.add_node_with(op, std::iter::empty())
    }

    pub fn add_node_with(
        &mut self,
        op: Op,
        props: impl IntoIterator<Item = (&'static str, Value)>,
    ) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node::new(op, props.into_iter().collect::<Props>()));
        id
    }

    /// Add an edge whose input role is the same as its output label
    pub fn output_to(&mut self, from: NodeId, label: Port, to: NodeId) -> EdgeId {
        self.output_to_as(from, label, to, label)
    }

    /// Add an edge with an explicit input role for the consumer
    pub fn output_to_as(&mut self, from: NodeId, label: Port, to: NodeId, input: Port) -> EdgeId {
        self.connect(Edge { from, to, output: label, input })
    }

    fn connect(&mut self, edge: Edge) -> EdgeId {
        let id = EdgeId(self.edges.len() as u32);
        self.edges.push(Some(edge));
        self.nodes[edge.from.index()].outputs.push(id);
        self.nodes[edge.to.index()].inputs.push(id);
        id
    }

    pub fn remove_edge(&mut self, id: EdgeId) {
        if let Some(edge) = self.edges.get_mut(id.index()).and_then(Option::take) {
            self.nodes[edge.from.index()].outputs.retain(|&e| e != id);
            self.nodes[edge.to.index()].inputs.retain(|&e| e != id);
        }
    }

    /// Unlink a node from all of its edges.
    ///
    /// Nothing is reconnected; callers that need the node's control flow
    /// preserved call [`Graph::splice_control`] first.
    pub fn remove(&mut self, id: NodeId) {
        let node = &self.nodes[id.index()];
        let edges: Vec<EdgeId> = node.inputs.iter().chain(&node.outputs).copied().collect();
        for edge in edges {
            self.remove_edge(edge);
        }
        self.nodes[id.index()].removed = true;
    }

    // ===== Queries =====

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn op(&self, id: NodeId) -> Op {
        self.nodes[id.index()].op
    }

    pub fn prop(&self, id: NodeId, key: &str) -> Option<&Value> {
        self.nodes[id.index()].prop(key)
    }

    pub fn edge(&self, id: EdgeId) -> Option<&Edge> {
        self.edges.get(id.index()).and_then(Option::as_ref)
    }

    pub fn inputs(&self, id: NodeId) -> impl Iterator<Item = &Edge> + '_ {
        self.nodes[id.index()].inputs.iter().filter_map(move |&e| self.edge(e))
    }

    pub fn outputs(&self, id: NodeId) -> impl Iterator<Item = &Edge> + '_ {
        self.nodes[id.index()].outputs.iter().filter_map(move |&e| self.edge(e))
    }

    /// Snapshot of incoming edges, for callers about to mutate the graph
    pub fn input_edges(&self, id: NodeId) -> Vec<(EdgeId, Edge)> {
        self.nodes[id.index()]
            .inputs
            .iter()
            .filter_map(|&e| self.edge(e).map(|edge| (e, *edge)))
            .collect()
    }

    /// Snapshot of outgoing edges, for callers about to mutate the graph
    pub fn output_edges(&self, id: NodeId) -> Vec<(EdgeId, Edge)> {
        self.nodes[id.index()]
            .outputs
            .iter()
            .filter_map(|&e| self.edge(e).map(|edge| (e, *edge)))
            .collect()
    }

    pub fn control_inputs(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.inputs(id).filter(|e| e.is_control()).map(|e| e.from)
    }

    pub fn control_outputs(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.outputs(id).filter(|e| e.is_control()).map(|e| e.to)
    }

    pub fn value_inputs(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.inputs(id).filter(|e| e.is_value()).map(|e| e.from)
    }

    pub fn value_outputs(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.outputs(id).filter(|e| e.is_value()).map(|e| e.to)
    }

    /// Value input playing a particular role, such as a send's receiver
    pub fn input_for(&self, id: NodeId, role: Port) -> Option<NodeId> {
        self.inputs(id).find(|e| e.input == role).map(|e| e.from)
    }

    /// Whether `from` has an output edge labelled `label` going to `to`
    pub fn outputs_to(&self, from: NodeId, label: Port, to: NodeId) -> bool {
        self.outputs(from).any(|e| e.output == label && e.to == to)
    }

    /// Whether a node must stay on the control chain even without users.
    ///
    /// A region with several control predecessors is a real merge point and
    /// owns its phis, so it counts as effectful; a single-predecessor region
    /// and a `jump` are plain control transfer.
    pub fn has_side_effects(&self, id: NodeId) -> bool {
        match self.op(id) {
            Op::Start
            | Op::Finish
            | Op::Trace
            | Op::Send
            | Op::Branch
            | Op::Safepoint
            | Op::Guard => true,
            Op::Region | Op::Merge => self.control_inputs(id).count() > 1,
            _ => false,
        }
    }

    // ===== Traversal =====

    /// Visit every node reachable from the root exactly once.
    ///
    /// Edges are followed in both directions, so pure nodes that only feed
    /// values into the control chain (constants, arguments) are reached, and
    /// phi back-references do not cause revisits.
    pub fn visit_nodes(&self, mut visitor: impl FnMut(NodeId, &Node)) {
        let mut visited = vec![false; self.nodes.len()];
        let mut worklist = vec![self.root];
        visited[self.root.index()] = true;

        while let Some(id) = worklist.pop() {
            visitor(id, &self.nodes[id.index()]);
            for edge in self.inputs(id).chain(self.outputs(id)) {
                for next in [edge.from, edge.to] {
                    if !visited[next.index()] {
                        visited[next.index()] = true;
                        worklist.push(next);
                    }
                }
            }
        }
    }

    pub fn all_nodes(&self) -> Vec<NodeId> {
        let mut nodes = Vec::new();
        self.visit_nodes(|id, _| nodes.push(id));
        nodes
    }

    /// First reachable node matching an optional op filter and a predicate
    pub fn find_node(&self, op: Option<Op>, pred: impl Fn(&Node) -> bool) -> Option<NodeId> {
        self.all_nodes().into_iter().find(|&id| {
            let node = self.node(id);
            op.map_or(true, |op| node.op == op) && pred(node)
        })
    }

    /// All reachable nodes matching an optional op filter and a predicate
    pub fn find_nodes(&self, op: Option<Op>, pred: impl Fn(&Node) -> bool) -> Vec<NodeId> {
        self.all_nodes()
            .into_iter()
            .filter(|&id| {
                let node = self.node(id);
                op.map_or(true, |op| node.op == op) && pred(node)
            })
            .collect()
    }

    /// All reachable nodes with the given op
    pub fn nodes_with_op(&self, op: Op) -> Vec<NodeId> {
        self.find_nodes(Some(op), |_| true)
    }

    pub fn contains(&self, pred: impl Fn(&Node) -> bool) -> bool {
        self.find_node(None, pred).is_some()
    }

    /// Number of reachable nodes
    pub fn size(&self) -> usize {
        let mut count = 0;
        self.visit_nodes(|_, _| count += 1);
        count
    }

    // ===== Rewriting =====

    /// Make every value user of `old` use `new` instead, keeping edge labels.
    ///
    /// Returns the number of edges moved.
    pub fn replace_value_uses(&mut self, old: NodeId, new: NodeId) -> usize {
        let uses: Vec<(EdgeId, Edge)> = self
            .output_edges(old)
            .into_iter()
            .filter(|(_, edge)| edge.is_value())
            .collect();
        for &(id, edge) in &uses {
            self.remove_edge(id);
            self.connect(Edge { from: new, ..edge });
        }
        uses.len()
    }

    /// Connect every control predecessor of `id` directly to every control
    /// successor, skipping pairs that are already connected.
    ///
    /// The predecessor's output label and the successor's input role are
    /// kept, so a `True` arm of a branch stays a `True` arm.
    pub fn splice_control(&mut self, id: NodeId) {
        let preds: Vec<Edge> = self.inputs(id).filter(|e| e.is_control()).copied().collect();
        let succs: Vec<Edge> = self.outputs(id).filter(|e| e.is_control()).copied().collect();

        for pred in &preds {
            for succ in &succs {
                if pred.from == id || succ.to == id {
                    continue;
                }
                let connected = self
                    .outputs(pred.from)
                    .any(|e| e.is_control() && e.to == succ.to && e.output == pred.output);
                if !connected {
                    self.connect(Edge {
                        from: pred.from,
                        to: succ.to,
                        output: pred.output,
                        input: succ.input,
                    });
                }
            }
        }
    }

    /// Route a control edge through `node`: `a -> b` becomes `a -> node -> b`
    pub fn insert_on_control_edge(&mut self, edge: EdgeId, node: NodeId) {
        if let Some(old) = self.edge(edge).copied() {
            self.remove_edge(edge);
            self.connect(Edge {
                from: old.from,
                to: node,
                output: old.output,
                input: Port::Control,
            });
            self.connect(Edge {
                from: node,
                to: old.to,
                output: Port::Control,
                input: old.input,
            });
        }
    }

    // ===== Verification =====

    /// Check the structural invariants every pass must preserve
    pub fn verify(&self) -> Result<(), GraphError> {
        for id in self.all_nodes() {
            for edge in self.inputs(id).chain(self.outputs(id)) {
                if self.node(edge.from).removed || self.node(edge.to).removed {
                    return Err(GraphError::DanglingEdge { from: edge.from, to: edge.to });
                }
            }

            match self.op(id) {
                Op::Start if self.inputs(id).next().is_some() => {
                    return Err(GraphError::StartHasInputs(id));
                }
                Op::Finish if self.outputs(id).next().is_some() => {
                    return Err(GraphError::FinishHasOutputs(id));
                }
                Op::Phi => self.verify_phi(id)?,
                _ => {}
            }
        }
        Ok(())
    }

    fn verify_phi(&self, phi: NodeId) -> Result<(), GraphError> {
        let controls: Vec<NodeId> = self.control_inputs(phi).collect();
        let &[region] = controls.as_slice() else {
            return Err(GraphError::PhiControl { phi, count: controls.len() });
        };
        if !self.op(region).is_region() {
            return Err(GraphError::PhiOutsideRegion { phi, from: region, op: self.op(region) });
        }
        let preds = self.control_inputs(region).count();
        let values = self.value_inputs(phi).count();
        if values != preds {
            return Err(GraphError::PhiArity { phi, values, preds });
        }
        Ok(())
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}
