//! Nodes and edges of the sea-of-nodes graph

use std::collections::BTreeMap;
use std::fmt;

use tendril_vm::Value;

/// Stable identity of a node in a graph's arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl NodeId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Stable identity of an edge in a graph's arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeId(pub u32);

impl EdgeId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Node operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Start,
    Finish,
    Region,
    Merge,
    Phi,
    Input,
    Constant,
    SelfValue,
    Arg,
    Send,
    Not,
    Jump,
    Branch,
    Trace,
    Safepoint,
    Guard,
}

impl Op {
    pub fn name(self) -> &'static str {
        match self {
            Op::Start => "start",
            Op::Finish => "finish",
            Op::Region => "region",
            Op::Merge => "merge",
            Op::Phi => "phi",
            Op::Input => "input",
            Op::Constant => "constant",
            Op::SelfValue => "self",
            Op::Arg => "arg",
            Op::Send => "send",
            Op::Not => "not",
            Op::Jump => "jump",
            Op::Branch => "branch",
            Op::Trace => "trace",
            Op::Safepoint => "safepoint",
            Op::Guard => "guard",
        }
    }

    /// Region-like nodes start a block and own its phis
    pub fn is_region(self) -> bool {
        matches!(self, Op::Region | Op::Merge)
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Label on either end of an edge.
///
/// The output side says what the producer emits (`Control`, `Value`, or the
/// `True`/`False` arms of a branch). The input side says what role the edge
/// plays for the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Port {
    Control,
    Value,
    True,
    False,
    Receiver,
    Args,
    Condition,
}

/// A directed edge between two nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub from: NodeId,
    pub to: NodeId,
    pub output: Port,
    pub input: Port,
}

impl Edge {
    pub fn is_control(&self) -> bool {
        self.output == Port::Control || self.input == Port::Control
    }

    pub fn is_value(&self) -> bool {
        !self.is_control()
    }
}

/// Immutable node properties such as `line`, `value`, `name` and `n`
pub type Props = BTreeMap<&'static str, Value>;

/// A node in the graph arena
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub(crate) op: Op,
    pub(crate) props: Props,
    pub(crate) inputs: Vec<EdgeId>,
    pub(crate) outputs: Vec<EdgeId>,
    pub(crate) removed: bool,
}

impl Node {
    pub(crate) fn new(op: Op, props: Props) -> Self {
        Node {
            op,
            props,
            inputs: Vec::new(),
            outputs: Vec::new(),
            removed: false,
        }
    }

    pub fn op(&self) -> Op {
        self.op
    }

    pub fn props(&self) -> &Props {
        &self.props
    }

    pub fn prop(&self, key: &str) -> Option<&Value> {
        self.props.get(key)
    }

    /// Incoming edges, in the order they were attached
    pub fn inputs(&self) -> &[EdgeId] {
        &self.inputs
    }

    /// Outgoing edges, in the order they were attached
    pub fn outputs(&self) -> &[EdgeId] {
        &self.outputs
    }

    pub fn is_removed(&self) -> bool {
        self.removed
    }
}
