//! Bytecode analysis ahead of graph building

pub mod cfg;

pub use cfg::{basic_blocks, targets, BasicBlock};
