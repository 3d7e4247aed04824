//! Deoptimization metadata and frame reconstruction

use std::sync::Arc;

use tendril_vm::{Insn, Locals, Value};

use super::handles::{HandleTable, Word};
use super::BridgeError;
use crate::ir::NodeId;

/// What the interpreter needs to pick up where compiled code left off.
///
/// `stack` and `args` describe the live operand-stack and argument slots of
/// the native frame, in push order; their lengths say how many words of the
/// frame belong to each.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeoptMap {
    /// The method being resumed
    pub insns: Arc<[Insn]>,
    /// Instruction to resume at
    pub ip: usize,
    /// Nodes whose values occupy the live operand-stack slots, deepest first
    pub stack: Vec<NodeId>,
    /// Nodes whose values occupy the argument slots, in argument order
    pub args: Vec<NodeId>,
}

impl DeoptMap {
    pub fn new(insns: impl Into<Arc<[Insn]>>, ip: usize) -> Self {
        DeoptMap {
            insns: insns.into(),
            ip,
            stack: Vec::new(),
            args: Vec::new(),
        }
    }

    pub fn with_stack(mut self, stack: Vec<NodeId>) -> Self {
        self.stack = stack;
        self
    }

    pub fn with_args(mut self, args: Vec<NodeId>) -> Self {
        self.args = args;
        self
    }

    /// Words of native frame this map consumes: the stack slots, the
    /// arguments and the receiver
    pub fn frame_words(&self) -> usize {
        self.stack.len() + self.args.len() + 1
    }
}

/// Interpreter-level state rebuilt from a native frame
#[derive(Debug, Clone, PartialEq)]
pub struct FrameState {
    pub receiver: Value,
    pub args: Vec<Value>,
    pub stack: Vec<Value>,
    /// Locals are not captured by compiled frames yet, so this is always
    /// empty after [`read_frame`]
    pub locals: Locals,
}

/// Called with the rebuilt state just before the interpreter resumes
pub trait DeoptObserver {
    fn on_deopt(&self, map: &DeoptMap, state: &FrameState);
}

impl<F> DeoptObserver for F
where
    F: Fn(&DeoptMap, &FrameState),
{
    fn on_deopt(&self, map: &DeoptMap, state: &FrameState) {
        self(map, state)
    }
}

/// Rebuild interpreter state from the words of a native frame.
///
/// `frame[0]` is the word at the stack pointer, the most recently pushed.
/// Words are consumed from there: first the operand stack, then the
/// arguments, then the receiver. Each consumed word is prepended to its
/// list, which restores push order. Words past the receiver belong to the
/// caller and are ignored.
pub fn read_frame(
    handles: &HandleTable,
    map: &DeoptMap,
    frame: &[Word],
) -> Result<FrameState, BridgeError> {
    let needed = map.frame_words();
    if frame.len() < needed {
        return Err(BridgeError::FrameTooSmall { needed, available: frame.len() });
    }

    let mut words = frame.iter().copied();
    let mut take = |count: usize| -> Result<Vec<Value>, BridgeError> {
        let mut values = Vec::with_capacity(count);
        for word in words.by_ref().take(count) {
            values.insert(0, handles.value(word)?);
        }
        Ok(values)
    };

    let stack = take(map.stack.len())?;
    let args = take(map.args.len())?;
    let receiver = take(1)?.pop().unwrap_or(Value::Nil);

    Ok(FrameState { receiver, args, stack, locals: Locals::default() })
}
