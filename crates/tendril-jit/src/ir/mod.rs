//! Sea-of-nodes IR
//!
//! Control flow and data flow are both explicit edges between nodes held in
//! a graph-owned arena.

pub mod graph;
pub mod node;

pub use graph::{Graph, GraphError};
pub use node::{Edge, EdgeId, Node, NodeId, Op, Port, Props};
