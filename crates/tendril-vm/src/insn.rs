//! Bytecode instructions
//!
//! A method body is a flat `[Insn]`. Jump and branch targets are absolute
//! instruction indices into that slice.

use std::fmt;
use std::sync::Arc;

use crate::value::Value;

/// A single stack-machine instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Insn {
    /// Source line marker
    Trace(u32),
    /// Push the receiver
    SelfValue,
    /// Push positional argument `n`
    Arg(usize),
    /// Push the value of a local
    Load(Arc<str>),
    /// Pop into a local
    Store(Arc<str>),
    /// Push a constant
    Push(Value),
    /// Pop `argc` arguments and a receiver, push the result of the call
    Send { name: Arc<str>, argc: usize },
    /// Logical negation of the top of stack
    Not,
    /// Unconditional jump
    Jump(usize),
    /// Pop a condition and jump if it is truthy
    Branch(usize),
    /// Return the top of stack
    Return,
}

impl Insn {
    pub fn load(name: &str) -> Self {
        Insn::Load(Arc::from(name))
    }

    pub fn store(name: &str) -> Self {
        Insn::Store(Arc::from(name))
    }

    pub fn push(value: impl Into<Value>) -> Self {
        Insn::Push(value.into())
    }

    pub fn send(name: &str, argc: usize) -> Self {
        Insn::Send { name: Arc::from(name), argc }
    }

    /// Target of a jump or branch
    pub fn target(&self) -> Option<usize> {
        match self {
            Insn::Jump(target) | Insn::Branch(target) => Some(*target),
            _ => None,
        }
    }

    pub fn mnemonic(&self) -> &'static str {
        match self {
            Insn::Trace(_) => "trace",
            Insn::SelfValue => "self",
            Insn::Arg(_) => "arg",
            Insn::Load(_) => "load",
            Insn::Store(_) => "store",
            Insn::Push(_) => "push",
            Insn::Send { .. } => "send",
            Insn::Not => "not",
            Insn::Jump(_) => "jump",
            Insn::Branch(_) => "branch",
            Insn::Return => "return",
        }
    }
}

impl fmt::Display for Insn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Insn::Trace(line) => write!(f, "trace {}", line),
            Insn::Arg(n) => write!(f, "arg {}", n),
            Insn::Load(name) | Insn::Store(name) => write!(f, "{} {}", self.mnemonic(), name),
            Insn::Push(value) => write!(f, "push {}", value),
            Insn::Send { name, argc } => write!(f, "send :{} {}", name, argc),
            Insn::Jump(target) | Insn::Branch(target) => {
                write!(f, "{} {}", self.mnemonic(), target)
            }
            _ => f.write_str(self.mnemonic()),
        }
    }
}
