//! Errors raised while executing managed code

use crate::value::ValueKind;

/// Error raised by dispatch or by the interpreter
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    #[error("Undefined method `{name}` for {receiver}")]
    NoMethod { name: String, receiver: ValueKind },
    #[error("Wrong number of arguments for `{name}` (given {given}, expected {expected})")]
    Arity {
        name: String,
        given: usize,
        expected: usize,
    },
    #[error("`{name}` expected {expected}, got {got}")]
    TypeMismatch {
        name: String,
        expected: ValueKind,
        got: ValueKind,
    },
    #[error("Divided by 0")]
    DivisionByZero,
    #[error("Operand stack underflow at ip {ip}")]
    StackUnderflow { ip: usize },
    #[error("Argument {n} out of range ({count} given)")]
    MissingArgument { n: usize, count: usize },
    #[error("Local `{0}` read before assignment")]
    UndefinedLocal(String),
    #[error("Instruction pointer {ip} outside method of {len} instructions")]
    BadIp { ip: usize, len: usize },
    #[error("Method name must be a symbol, got {0}")]
    NotASymbol(ValueKind),
}
