//! Tendril managed runtime
//!
//! This crate provides the managed side of the Tendril JIT:
//! - **Bytecode**: the stack-machine instruction set (`insn` module)
//! - **Values**: managed values and dynamic `send` dispatch (`value` module)
//! - **Interpreter**: the reference interpreter and send-site profiling
//!   (`interpreter` module)

#![warn(rust_2018_idioms)]

pub mod error;
pub mod insn;
pub mod interpreter;
pub mod value;

pub use error::RuntimeError;
pub use insn::Insn;
pub use interpreter::{Interpreter, Locals, Profile};
pub use value::{Value, ValueKind};
