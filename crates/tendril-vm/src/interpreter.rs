//! Reference bytecode interpreter
//!
//! Executes a method body over a `Value` operand stack and a table of named
//! locals. Execution can start at any instruction with a pre-populated stack
//! and locals, which is what deoptimization relies on to resume mid-method.

use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::trace;

use crate::error::RuntimeError;
use crate::insn::Insn;
use crate::value::{Value, ValueKind};

/// Named local variables of a running method
pub type Locals = FxHashMap<Arc<str>, Value>;

/// Receiver kinds observed at each send site, keyed by instruction index
#[derive(Debug, Clone, Default)]
pub struct Profile {
    sends: FxHashMap<usize, FxHashSet<ValueKind>>,
}

impl Profile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that the send at `ip` saw a receiver of `kind`
    pub fn record_send(&mut self, ip: usize, kind: ValueKind) {
        self.sends.entry(ip).or_default().insert(kind);
    }

    /// All receiver kinds seen at `ip`
    pub fn receiver_kinds(&self, ip: usize) -> Option<&FxHashSet<ValueKind>> {
        self.sends.get(&ip)
    }

    /// The single receiver kind seen at `ip`, if the site is monomorphic
    pub fn monomorphic_kind(&self, ip: usize) -> Option<ValueKind> {
        let kinds = self.sends.get(&ip)?;
        if kinds.len() == 1 {
            kinds.iter().next().copied()
        } else {
            None
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sends.is_empty()
    }
}

/// Stack-machine interpreter for [`Insn`] sequences
#[derive(Debug, Default, Clone, Copy)]
pub struct Interpreter;

impl Interpreter {
    pub fn new() -> Self {
        Interpreter
    }

    /// Run a method from its first instruction
    pub fn run(&self, insns: &[Insn], receiver: Value, args: &[Value]) -> Result<Value, RuntimeError> {
        self.interpret(insns, receiver, args, None, 0, Vec::new(), Locals::default())
    }

    /// Run a method from `resume_at` with the given operand stack and locals.
    ///
    /// Falling off the end of the method returns the top of stack, or `nil`
    /// if the stack is empty.
    #[allow(clippy::too_many_arguments)]
    pub fn interpret(
        &self,
        insns: &[Insn],
        receiver: Value,
        args: &[Value],
        mut profile: Option<&mut Profile>,
        resume_at: usize,
        mut stack: Vec<Value>,
        mut locals: Locals,
    ) -> Result<Value, RuntimeError> {
        if resume_at > insns.len() {
            return Err(RuntimeError::BadIp { ip: resume_at, len: insns.len() });
        }

        let mut ip = resume_at;
        while let Some(insn) = insns.get(ip) {
            trace!(ip, insn = %insn, depth = stack.len(), "interpret");
            let here = ip;
            ip += 1;

            match insn {
                Insn::Trace(_) => {}
                Insn::SelfValue => stack.push(receiver.clone()),
                Insn::Arg(n) => {
                    let value = args.get(*n).cloned().ok_or(RuntimeError::MissingArgument {
                        n: *n,
                        count: args.len(),
                    })?;
                    stack.push(value);
                }
                Insn::Load(name) => {
                    let value = locals
                        .get(name)
                        .cloned()
                        .ok_or_else(|| RuntimeError::UndefinedLocal(name.to_string()))?;
                    stack.push(value);
                }
                Insn::Store(name) => {
                    let value = pop(&mut stack, here)?;
                    locals.insert(name.clone(), value);
                }
                Insn::Push(value) => stack.push(value.clone()),
                Insn::Send { name, argc } => {
                    if argc.checked_add(1).map_or(true, |needed| stack.len() < needed) {
                        return Err(RuntimeError::StackUnderflow { ip: here });
                    }
                    let call_args = stack.split_off(stack.len() - argc);
                    let target = pop(&mut stack, here)?;
                    if let Some(profile) = profile.as_deref_mut() {
                        profile.record_send(here, target.kind());
                    }
                    stack.push(target.send(name, &call_args)?);
                }
                Insn::Not => {
                    let value = pop(&mut stack, here)?;
                    stack.push(Value::Bool(!value.is_truthy()));
                }
                Insn::Jump(target) => ip = checked_target(*target, insns.len())?,
                Insn::Branch(target) => {
                    if pop(&mut stack, here)?.is_truthy() {
                        ip = checked_target(*target, insns.len())?;
                    }
                }
                Insn::Return => return pop(&mut stack, here),
            }
        }

        Ok(stack.pop().unwrap_or(Value::Nil))
    }
}

fn pop(stack: &mut Vec<Value>, ip: usize) -> Result<Value, RuntimeError> {
    stack.pop().ok_or(RuntimeError::StackUnderflow { ip })
}

fn checked_target(target: usize, len: usize) -> Result<usize, RuntimeError> {
    if target > len {
        Err(RuntimeError::BadIp { ip: target, len })
    } else {
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add_insns() -> Vec<Insn> {
        vec![Insn::Arg(0), Insn::push(2), Insn::send("+", 1), Insn::Return]
    }

    #[test]
    fn test_add_argument() {
        let result = Interpreter::new().run(&add_insns(), Value::Nil, &[Value::Int(14)]);
        assert_eq!(result, Ok(Value::Int(16)));
    }

    #[test]
    fn test_send_with_impossible_argc() {
        let insns = vec![Insn::SelfValue, Insn::send("+", usize::MAX), Insn::Return];
        let result = Interpreter::new().run(&insns, Value::Int(1), &[]);
        assert_eq!(result, Err(RuntimeError::StackUnderflow { ip: 1 }));
    }

    #[test]
    fn test_branch_merge() {
        // x = arg0 ? 2 : 1
        let insns = vec![
            Insn::Arg(0),
            Insn::Branch(5),
            Insn::push(1),
            Insn::store("x"),
            Insn::Jump(7),
            Insn::push(2),
            Insn::store("x"),
            Insn::load("x"),
            Insn::Return,
        ];
        let interp = Interpreter::new();
        assert_eq!(interp.run(&insns, Value::Nil, &[Value::Bool(true)]), Ok(Value::Int(2)));
        assert_eq!(interp.run(&insns, Value::Nil, &[Value::Nil]), Ok(Value::Int(1)));
    }

    #[test]
    fn test_loop() {
        let insns = vec![
            Insn::push(0),
            Insn::store("i"),
            Insn::load("i"),
            Insn::push(10),
            Insn::send("<", 1),
            Insn::Not,
            Insn::Branch(12),
            Insn::load("i"),
            Insn::push(1),
            Insn::send("+", 1),
            Insn::store("i"),
            Insn::Jump(2),
            Insn::load("i"),
            Insn::Return,
        ];
        assert_eq!(Interpreter::new().run(&insns, Value::Nil, &[]), Ok(Value::Int(10)));
    }

    #[test]
    fn test_resume_mid_method() {
        let insns = vec![Insn::push(1), Insn::push(2), Insn::send("+", 1), Insn::Return];
        let result = Interpreter::new().interpret(
            &insns,
            Value::Nil,
            &[],
            None,
            2,
            vec![Value::Int(40), Value::Int(2)],
            Locals::default(),
        );
        assert_eq!(result, Ok(Value::Int(42)));
    }

    #[test]
    fn test_resume_past_end_returns_top() {
        let result = Interpreter::new().interpret(
            &[],
            Value::Nil,
            &[],
            None,
            0,
            vec![Value::Int(1), Value::Int(3)],
            Locals::default(),
        );
        assert_eq!(result, Ok(Value::Int(3)));
    }

    #[test]
    fn test_bad_resume_ip() {
        let result =
            Interpreter::new().interpret(&[], Value::Nil, &[], None, 3, vec![], Locals::default());
        assert_eq!(result, Err(RuntimeError::BadIp { ip: 3, len: 0 }));
    }

    #[test]
    fn test_profile_records_receiver_kinds() {
        let mut profile = Profile::new();
        let interp = Interpreter::new();
        for i in 0..3 {
            interp
                .interpret(
                    &add_insns(),
                    Value::Nil,
                    &[Value::Int(i)],
                    Some(&mut profile),
                    0,
                    vec![],
                    Locals::default(),
                )
                .unwrap();
        }
        assert_eq!(profile.monomorphic_kind(2), Some(ValueKind::Int));
        assert_eq!(profile.monomorphic_kind(0), None);

        profile.record_send(2, ValueKind::Symbol);
        assert_eq!(profile.monomorphic_kind(2), None);
        assert_eq!(profile.receiver_kinds(2).map(|k| k.len()), Some(2));
    }

    #[test]
    fn test_stack_underflow() {
        let result = Interpreter::new().run(&[Insn::Not], Value::Nil, &[]);
        assert_eq!(result, Err(RuntimeError::StackUnderflow { ip: 0 }));
    }

    #[test]
    fn test_undefined_local() {
        let result = Interpreter::new().run(&[Insn::load("y")], Value::Nil, &[]);
        assert_eq!(result, Err(RuntimeError::UndefinedLocal("y".to_string())));
    }
}
