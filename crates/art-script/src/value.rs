//! Dynamic values and the central coercion/operator module.
//!
//! Values are a tagged union over int64, float64, string, bool, null,
//! array, and string-keyed map.  Host collection semantics never leak
//! through this interface; all operator behavior is defined here.

use std::collections::BTreeMap;
use std::fmt;

use crate::ast::{BinaryOp, UnaryOp};
use crate::error::RuntimeError;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    Null,
    Array(Vec<Value>),
    Dict(BTreeMap<String, Value>),
}

impl Value {
    /// The TYPE() name of this value.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Bool(_) => "bool",
            Value::Null => "null",
            Value::Array(_) => "array",
            Value::Dict(_) => "dict",
        }
    }

    /// Truthiness: false, 0, 0.0, "", empty array, empty map, and null are
    /// falsy; everything else is truthy.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Int(v) => *v != 0,
            Value::Float(v) => *v != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Array(xs) => !xs.is_empty(),
            Value::Dict(m) => !m.is_empty(),
            Value::Null => false,
        }
    }

    /// Deep equality with numeric int/float comparison; null is only equal
    /// to null.  Mismatched types otherwise compare unequal, not error.
    pub fn loose_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                (*a as f64) == *b
            }
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Null, Value::Null) => true,
            (Value::Array(a), Value::Array(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.loose_eq(y))
            }
            (Value::Dict(a), Value::Dict(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .all(|(k, v)| b.get(k).is_some_and(|w| v.loose_eq(w)))
            }
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => {
                if v.fract() == 0.0 && v.is_finite() && v.abs() < 1e15 {
                    write!(f, "{:.1}", v)
                } else {
                    write!(f, "{}", v)
                }
            }
            Value::Str(s) => write!(f, "{}", s),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Null => write!(f, "null"),
            Value::Array(xs) => {
                write!(f, "[")?;
                for (i, x) in xs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    match x {
                        Value::Str(s) => write!(f, "\"{}\"", s)?,
                        other => write!(f, "{}", other)?,
                    }
                }
                write!(f, "]")
            }
            Value::Dict(m) => {
                write!(f, "{{")?;
                for (i, (k, v)) in m.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    match v {
                        Value::Str(s) => write!(f, "{}: \"{}\"", k, s)?,
                        other => write!(f, "{}: {}", k, other)?,
                    }
                }
                write!(f, "}}")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Binary operators
// ---------------------------------------------------------------------------

/// Apply a binary operator per the language's coercion table.
pub fn binary_op(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, RuntimeError> {
    match op {
        BinaryOp::Add => add(left, right),
        BinaryOp::Sub => arithmetic(op, left, right),
        BinaryOp::Mul => arithmetic(op, left, right),
        BinaryOp::Div => divide(left, right),
        BinaryOp::Mod => modulo(left, right),
        BinaryOp::Eq => Ok(Value::Bool(left.loose_eq(right))),
        BinaryOp::NotEq => Ok(Value::Bool(!left.loose_eq(right))),
        BinaryOp::Lt | BinaryOp::Gt | BinaryOp::Le | BinaryOp::Ge => compare(op, left, right),
        // && and || are short-circuited in the interpreter; reaching here
        // means both operands were already evaluated.
        BinaryOp::And => Ok(Value::Bool(left.is_truthy() && right.is_truthy())),
        BinaryOp::Or => Ok(Value::Bool(left.is_truthy() || right.is_truthy())),
    }
}

fn type_error(op: BinaryOp, left: &Value, right: &Value) -> RuntimeError {
    RuntimeError::new(format!(
        "type error: cannot apply '{}' to {} and {}",
        op.symbol(),
        left.type_name(),
        right.type_name()
    ))
}

fn add(left: &Value, right: &Value) -> Result<Value, RuntimeError> {
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_add(*b))),
        (Value::Float(a), Value::Float(b)) => Ok(Value::Float(a + b)),
        (Value::Float(a), Value::Int(b)) => Ok(Value::Float(a + *b as f64)),
        (Value::Int(a), Value::Float(b)) => Ok(Value::Float(*a as f64 + b)),
        // String concatenation stringifies the right operand.
        (Value::Str(a), b) => Ok(Value::Str(format!("{}{}", a, b))),
        _ => Err(type_error(BinaryOp::Add, left, right)),
    }
}

fn arithmetic(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, RuntimeError> {
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => Ok(Value::Int(match op {
            BinaryOp::Sub => a.wrapping_sub(*b),
            BinaryOp::Mul => a.wrapping_mul(*b),
            _ => unreachable!("arithmetic only handles - and *"),
        })),
        (Value::Float(a), Value::Float(b)) => Ok(Value::Float(apply_f64(op, *a, *b))),
        (Value::Float(a), Value::Int(b)) => Ok(Value::Float(apply_f64(op, *a, *b as f64))),
        (Value::Int(a), Value::Float(b)) => Ok(Value::Float(apply_f64(op, *a as f64, *b))),
        _ => Err(type_error(op, left, right)),
    }
}

fn apply_f64(op: BinaryOp, a: f64, b: f64) -> f64 {
    match op {
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        _ => unreachable!("apply_f64 only handles - and *"),
    }
}

fn divide(left: &Value, right: &Value) -> Result<Value, RuntimeError> {
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => {
            if *b == 0 {
                Err(RuntimeError::new("division by zero"))
            } else {
                // Truncating integer division.
                Ok(Value::Int(a.wrapping_div(*b)))
            }
        }
        (Value::Float(_), Value::Float(b)) | (Value::Int(_), Value::Float(b)) if *b == 0.0 => {
            Err(RuntimeError::new("division by zero"))
        }
        (Value::Float(_), Value::Int(0)) => Err(RuntimeError::new("division by zero")),
        (Value::Float(a), Value::Float(b)) => Ok(Value::Float(a / b)),
        (Value::Float(a), Value::Int(b)) => Ok(Value::Float(a / *b as f64)),
        (Value::Int(a), Value::Float(b)) => Ok(Value::Float(*a as f64 / b)),
        _ => Err(type_error(BinaryOp::Div, left, right)),
    }
}

fn modulo(left: &Value, right: &Value) -> Result<Value, RuntimeError> {
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => {
            if *b == 0 {
                Err(RuntimeError::new("modulo by zero"))
            } else {
                Ok(Value::Int(a.wrapping_rem(*b)))
            }
        }
        _ => Err(type_error(BinaryOp::Mod, left, right)),
    }
}

fn compare(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, RuntimeError> {
    let ordering = match (left, right) {
        (Value::Int(a), Value::Int(b)) => a.partial_cmp(b),
        (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
        (Value::Int(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
        (Value::Float(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
        (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
        _ => {
            return Err(type_error(op, left, right));
        }
    };
    let ordering = ordering
        .ok_or_else(|| RuntimeError::new("comparison with NaN is undefined"))?;
    let result = match op {
        BinaryOp::Lt => ordering.is_lt(),
        BinaryOp::Gt => ordering.is_gt(),
        BinaryOp::Le => ordering.is_le(),
        BinaryOp::Ge => ordering.is_ge(),
        _ => unreachable!("compare only handles ordering operators"),
    };
    Ok(Value::Bool(result))
}

// ---------------------------------------------------------------------------
// Unary operators
// ---------------------------------------------------------------------------

pub fn unary_op(op: UnaryOp, operand: &Value) -> Result<Value, RuntimeError> {
    match op {
        UnaryOp::Not => Ok(Value::Bool(!operand.is_truthy())),
        UnaryOp::Neg => match operand {
            Value::Int(v) => Ok(Value::Int(v.wrapping_neg())),
            Value::Float(v) => Ok(Value::Float(-v)),
            other => Err(RuntimeError::new(format!(
                "type error: cannot negate {}",
                other.type_name()
            ))),
        },
    }
}

// ---------------------------------------------------------------------------
// Coercions (the FLOAT/INT/STRING/BOOL builtins)
// ---------------------------------------------------------------------------

pub fn to_float(value: &Value) -> Result<Value, RuntimeError> {
    match value {
        Value::Float(v) => Ok(Value::Float(*v)),
        Value::Int(v) => Ok(Value::Float(*v as f64)),
        Value::Bool(b) => Ok(Value::Float(if *b { 1.0 } else { 0.0 })),
        Value::Str(s) => s
            .trim()
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| RuntimeError::new(format!("FLOAT: cannot convert \"{}\"", s))),
        other => Err(RuntimeError::new(format!(
            "FLOAT: cannot convert {}",
            other.type_name()
        ))),
    }
}

pub fn to_int(value: &Value) -> Result<Value, RuntimeError> {
    match value {
        Value::Int(v) => Ok(Value::Int(*v)),
        Value::Float(v) => Ok(Value::Int(*v as i64)),
        Value::Bool(b) => Ok(Value::Int(if *b { 1 } else { 0 })),
        Value::Str(s) => {
            let trimmed = s.trim();
            if let Ok(v) = trimmed.parse::<i64>() {
                return Ok(Value::Int(v));
            }
            trimmed
                .parse::<f64>()
                .map(|v| Value::Int(v as i64))
                .map_err(|_| RuntimeError::new(format!("INT: cannot convert \"{}\"", s)))
        }
        other => Err(RuntimeError::new(format!(
            "INT: cannot convert {}",
            other.type_name()
        ))),
    }
}

/// STRING is total.
pub fn to_string_value(value: &Value) -> Value {
    Value::Str(value.to_string())
}

pub fn to_bool(value: &Value) -> Value {
    Value::Bool(value.is_truthy())
}

/// LENGTH is defined on string (chars), array, and map.
pub fn length(value: &Value) -> Result<Value, RuntimeError> {
    match value {
        Value::Str(s) => Ok(Value::Int(s.chars().count() as i64)),
        Value::Array(xs) => Ok(Value::Int(xs.len() as i64)),
        Value::Dict(m) => Ok(Value::Int(m.len() as i64)),
        other => Err(RuntimeError::new(format!(
            "LENGTH: not defined on {}",
            other.type_name()
        ))),
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
