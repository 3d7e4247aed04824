//! Managed values and dynamic dispatch
//!
//! Every value understands `==`, `!=`, `!` and `nil?`. Integers additionally
//! understand arithmetic and comparison. Anything else raises `NoMethod`.

use std::fmt;
use std::sync::Arc;

use crate::error::RuntimeError;

/// A managed value
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Symbol(Arc<str>),
}

/// The dynamic kind of a value, as seen by profiles and guards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ValueKind {
    Nil,
    Bool,
    Int,
    Symbol,
}

impl ValueKind {
    /// Lowercase name used in diagnostics and guard properties
    pub fn name(self) -> &'static str {
        match self {
            ValueKind::Nil => "nil",
            ValueKind::Bool => "bool",
            ValueKind::Int => "int",
            ValueKind::Symbol => "symbol",
        }
    }

    /// Inverse of [`ValueKind::name`]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "nil" => Some(ValueKind::Nil),
            "bool" => Some(ValueKind::Bool),
            "int" => Some(ValueKind::Int),
            "symbol" => Some(ValueKind::Symbol),
            _ => None,
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Value {
    /// Create a symbol value
    pub fn symbol(name: &str) -> Self {
        Value::Symbol(Arc::from(name))
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Nil => ValueKind::Nil,
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) => ValueKind::Int,
            Value::Symbol(_) => ValueKind::Symbol,
        }
    }

    /// Only `nil` and `false` are falsy
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_symbol(&self) -> Option<&str> {
        match self {
            Value::Symbol(s) => Some(s),
            _ => None,
        }
    }

    /// Dispatch method `name` on this receiver
    pub fn send(&self, name: &str, args: &[Value]) -> Result<Value, RuntimeError> {
        match name {
            "==" => {
                expect_arity(name, args, 1)?;
                Ok(Value::Bool(*self == args[0]))
            }
            "!=" => {
                expect_arity(name, args, 1)?;
                Ok(Value::Bool(*self != args[0]))
            }
            "!" => {
                expect_arity(name, args, 0)?;
                Ok(Value::Bool(!self.is_truthy()))
            }
            "nil?" => {
                expect_arity(name, args, 0)?;
                Ok(Value::Bool(matches!(self, Value::Nil)))
            }
            _ => match self {
                Value::Int(lhs) => int_send(*lhs, name, args),
                other => Err(RuntimeError::NoMethod {
                    name: name.to_string(),
                    receiver: other.kind(),
                }),
            },
        }
    }
}

fn expect_arity(name: &str, args: &[Value], expected: usize) -> Result<(), RuntimeError> {
    if args.len() == expected {
        Ok(())
    } else {
        Err(RuntimeError::Arity {
            name: name.to_string(),
            given: args.len(),
            expected,
        })
    }
}

fn int_send(lhs: i64, name: &str, args: &[Value]) -> Result<Value, RuntimeError> {
    if !matches!(name, "+" | "-" | "*" | "/" | "%" | "<" | "<=" | ">" | ">=") {
        return Err(RuntimeError::NoMethod {
            name: name.to_string(),
            receiver: ValueKind::Int,
        });
    }
    expect_arity(name, args, 1)?;
    let rhs = args[0].as_int().ok_or_else(|| RuntimeError::TypeMismatch {
        name: name.to_string(),
        expected: ValueKind::Int,
        got: args[0].kind(),
    })?;

    let value = match name {
        "+" => Value::Int(lhs.wrapping_add(rhs)),
        "-" => Value::Int(lhs.wrapping_sub(rhs)),
        "*" => Value::Int(lhs.wrapping_mul(rhs)),
        "/" => Value::Int(floor_div(lhs, rhs)?),
        "%" => Value::Int(floor_mod(lhs, rhs)?),
        "<" => Value::Bool(lhs < rhs),
        "<=" => Value::Bool(lhs <= rhs),
        ">" => Value::Bool(lhs > rhs),
        _ => Value::Bool(lhs >= rhs),
    };
    Ok(value)
}

// Division rounds toward negative infinity.
fn floor_div(lhs: i64, rhs: i64) -> Result<i64, RuntimeError> {
    if rhs == 0 {
        return Err(RuntimeError::DivisionByZero);
    }
    let quotient = lhs.wrapping_div(rhs);
    if lhs.wrapping_rem(rhs) != 0 && ((lhs < 0) != (rhs < 0)) {
        Ok(quotient - 1)
    } else {
        Ok(quotient)
    }
}

fn floor_mod(lhs: i64, rhs: i64) -> Result<i64, RuntimeError> {
    if rhs == 0 {
        return Err(RuntimeError::DivisionByZero);
    }
    let rem = lhs.wrapping_rem(rhs);
    if rem != 0 && ((rem < 0) != (rhs < 0)) {
        Ok(rem + rhs)
    } else {
        Ok(rem)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => f.write_str("nil"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Symbol(s) => write!(f, ":{}", s),
        }
    }
}
