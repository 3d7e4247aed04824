//! Tendril JIT compilation core
//!
//! This crate turns Tendril bytecode into a sea-of-nodes graph and back
//! again at runtime:
//! - **Analysis**: block boundaries and basic blocks (`analysis` module)
//! - **IR**: the node/edge arena and graph queries (`ir` module)
//! - **Builder**: per-block fragments stitched together with phis
//!   (`builder` module)
//! - **Passes**: dead-code elimination, canonicalization, safepoints and
//!   inline caches (`passes` module)
//! - **Bridge**: handle marshalling, native → managed calls and
//!   deoptimization back into the interpreter (`bridge` module)
//! - **Pipeline**: configuration and the build → optimize driver
//!   (`pipeline` module)

#![warn(rust_2018_idioms)]

pub mod analysis;
pub mod bridge;
pub mod builder;
pub mod ir;
pub mod passes;
pub mod pipeline;

pub use bridge::{Bridge, BridgeError, DeoptMap, Word};
pub use builder::{build_graph, BuildError, Builder, GraphFragment};
pub use ir::{Graph, GraphError, NodeId, Op, Port};
pub use passes::{Pass, Runner};
pub use pipeline::{Compiler, JitConfig, JitError};
