//! The TLA+ `Value` type
//!
//! A `Value` is one of six variants: Bool, Number, String, Set, Tuple, and
//! Function. Values are immutable and cheap to clone (aggregate variants hold
//! their contents behind `Arc`), structurally comparable, hashable, and
//! totally ordered.
//!
//! # Why `BTreeSet` / `BTreeMap`?
//!
//! Sets and functions use ordered containers keyed by the value total order.
//! This gives deterministic iteration, which makes the binary encoding
//! canonical: the same logical value always serializes to identical bytes.
//! Set equality by element set falls out for free.
//!
//! # Total order
//!
//! Values of different variants are ordered by a fixed variant rank
//! (Bool < Number < String < Set < Tuple < Function); values of the same
//! variant compare structurally. The order carries no semantic meaning, it
//! only has to exist, be total, and agree with equality.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::error::TypeError;

/// An immutable TLA+ value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    Bool(bool),
    Number(i64),
    String(Arc<str>),
    Set(Arc<BTreeSet<Value>>),
    Tuple(Arc<Vec<Value>>),
    Function(Arc<BTreeMap<Value, Value>>),
}

impl Value {
    pub const TRUE: Value = Value::Bool(true);
    pub const FALSE: Value = Value::Bool(false);

    pub fn bool(b: bool) -> Value {
        Value::Bool(b)
    }

    pub fn number(n: i64) -> Value {
        Value::Number(n)
    }

    pub fn string(s: impl Into<String>) -> Value {
        let s: String = s.into();
        Value::String(Arc::from(s))
    }

    pub fn set(elems: impl IntoIterator<Item = Value>) -> Value {
        Value::Set(Arc::new(elems.into_iter().collect()))
    }

    pub fn tuple(elems: impl IntoIterator<Item = Value>) -> Value {
        Value::Tuple(Arc::new(elems.into_iter().collect()))
    }

    pub fn function(pairs: impl IntoIterator<Item = (Value, Value)>) -> Value {
        Value::Function(Arc::new(pairs.into_iter().collect()))
    }

    /// Record sugar: a function over string keys.
    pub fn record<K: Into<String>>(fields: impl IntoIterator<Item = (K, Value)>) -> Value {
        Value::function(fields.into_iter().map(|(k, v)| {
            let name: String = k.into();
            (Value::string(name), v)
        }))
    }

    pub fn as_bool(&self) -> Result<bool, TypeError> {
        match self {
            Value::Bool(b) => Ok(*b),
            other => Err(TypeError::mismatch("as_bool", "a boolean", other)),
        }
    }

    pub fn as_number(&self) -> Result<i64, TypeError> {
        match self {
            Value::Number(n) => Ok(*n),
            other => Err(TypeError::mismatch("as_number", "a number", other)),
        }
    }

    pub fn as_str(&self) -> Result<&str, TypeError> {
        match self {
            Value::String(s) => Ok(s),
            other => Err(TypeError::mismatch("as_str", "a string", other)),
        }
    }

    pub fn as_set(&self) -> Result<&BTreeSet<Value>, TypeError> {
        match self {
            Value::Set(s) => Ok(s),
            other => Err(TypeError::mismatch("as_set", "a set", other)),
        }
    }

    pub fn as_tuple(&self) -> Result<&[Value], TypeError> {
        match self {
            Value::Tuple(t) => Ok(t),
            other => Err(TypeError::mismatch("as_tuple", "a tuple", other)),
        }
    }

    pub fn as_function(&self) -> Result<&BTreeMap<Value, Value>, TypeError> {
        match self {
            Value::Function(f) => Ok(f),
            other => Err(TypeError::mismatch("as_function", "a function", other)),
        }
    }

    /// Variant rank for the cross-variant total order.
    fn rank(&self) -> u8 {
        match self {
            Value::Bool(_) => 0,
            Value::Number(_) => 1,
            Value::String(_) => 2,
            Value::Set(_) => 3,
            Value::Tuple(_) => 4,
            Value::Function(_) => 5,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Value {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Value {
        Value::Number(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Value {
        Value::string(s)
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Value) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Number(a), Value::Number(b)) => a.cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Set(a), Value::Set(b)) => a.iter().cmp(b.iter()),
            (Value::Tuple(a), Value::Tuple(b)) => a.iter().cmp(b.iter()),
            (Value::Function(a), Value::Function(b)) => a.iter().cmp(b.iter()),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Discriminant for type safety
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Bool(b) => b.hash(state),
            Value::Number(n) => n.hash(state),
            Value::String(s) => s.hash(state),
            Value::Set(s) => {
                s.len().hash(state);
                for elem in s.iter() {
                    elem.hash(state);
                }
            }
            Value::Tuple(t) => {
                t.len().hash(state);
                for elem in t.iter() {
                    elem.hash(state);
                }
            }
            Value::Function(f) => {
                f.len().hash(state);
                for (k, v) in f.iter() {
                    k.hash(state);
                    v.hash(state);
                }
            }
        }
    }
}

/// Renders in TLA+ syntax: `TRUE`, `{1, 2}`, `<<1, "a">>`, `[k |-> v]`.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(true) => write!(f, "TRUE"),
            Value::Bool(false) => write!(f, "FALSE"),
            Value::Number(n) => write!(f, "{n}"),
            Value::String(s) => {
                write!(f, "\"")?;
                for c in s.chars() {
                    match c {
                        '"' => write!(f, "\\\"")?,
                        '\\' => write!(f, "\\\\")?,
                        c => write!(f, "{c}")?,
                    }
                }
                write!(f, "\"")
            }
            Value::Set(s) => {
                write!(f, "{{")?;
                for (i, elem) in s.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{elem}")?;
                }
                write!(f, "}}")
            }
            Value::Tuple(t) => {
                write!(f, "<<")?;
                for (i, elem) in t.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{elem}")?;
                }
                write!(f, ">>")
            }
            Value::Function(m) => {
                // The empty function is the empty sequence in TLA+.
                if m.is_empty() {
                    return write!(f, "<<>>");
                }
                if m.keys().all(|k| matches!(k, Value::String(_))) {
                    write!(f, "[")?;
                    for (i, (k, v)) in m.iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        match k {
                            Value::String(name) => write!(f, "{name} |-> {v}")?,
                            _ => unreachable!(),
                        }
                    }
                    write!(f, "]")
                } else {
                    write!(f, "(")?;
                    for (i, (k, v)) in m.iter().enumerate() {
                        if i > 0 {
                            write!(f, " @@ ")?;
                        }
                        write!(f, "{k} :> {v}")?;
                    }
                    write!(f, ")")
                }
            }
        }
    }
}
