// Copyright 2026 the Origin Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Dynamically-typed guest values.

use std::fmt;
use std::sync::Arc;

use crate::program::{BuiltinId, CodeId};

/// Maximum length of a materialized value `repr` carried in the trace.
pub const MAX_REPR_LEN: usize = 100;

/// A guest runtime value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// The absent value.
    None,
    /// Boolean.
    Bool(bool),
    /// Signed 64-bit integer.
    Int(i64),
    /// 64-bit float.
    Float(f64),
    /// Immutable UTF-8 string.
    Str(Arc<str>),
    /// Immutable sequence.
    Tuple(Arc<[Value]>),
    /// Reference to an instrumented guest function.
    Func(CodeId),
    /// Reference to an opaque host callable.
    Builtin(BuiltinId),
}

/// Runtime type tag for a [`Value`]. Feeds the opaque-call signature hash.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ValueType {
    /// `None`.
    None,
    /// Boolean.
    Bool,
    /// Signed integer.
    Int,
    /// Float.
    Float,
    /// String.
    Str,
    /// Tuple.
    Tuple,
    /// Guest function.
    Func,
    /// Host callable.
    Builtin,
}

impl ValueType {
    /// Returns a stable byte tag for hashing.
    #[must_use]
    pub const fn tag(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Bool => 1,
            Self::Int => 2,
            Self::Float => 3,
            Self::Str => 4,
            Self::Tuple => 5,
            Self::Func => 6,
            Self::Builtin => 7,
        }
    }
}

impl Value {
    /// Builds a string value.
    #[must_use]
    pub fn str(s: &str) -> Self {
        Self::Str(Arc::from(s))
    }

    /// Builds a tuple value.
    #[must_use]
    pub fn tuple(items: Vec<Value>) -> Self {
        Self::Tuple(Arc::from(items))
    }

    /// Returns the runtime type tag.
    #[must_use]
    pub fn value_type(&self) -> ValueType {
        match self {
            Self::None => ValueType::None,
            Self::Bool(_) => ValueType::Bool,
            Self::Int(_) => ValueType::Int,
            Self::Float(_) => ValueType::Float,
            Self::Str(_) => ValueType::Str,
            Self::Tuple(_) => ValueType::Tuple,
            Self::Func(_) => ValueType::Func,
            Self::Builtin(_) => ValueType::Builtin,
        }
    }

    /// Guest truthiness: `None`, `false`, `0`, `0.0`, `""` and `()` are falsy.
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::None => false,
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::Float(f) => *f != 0.0,
            Self::Str(s) => !s.is_empty(),
            Self::Tuple(t) => !t.is_empty(),
            Self::Func(_) | Self::Builtin(_) => true,
        }
    }

    /// Renders a bounded display form for trace records.
    ///
    /// Output longer than [`MAX_REPR_LEN`] characters is truncated; queries
    /// only ever need a recognizable prefix.
    #[must_use]
    pub fn repr(&self) -> String {
        let full = self.to_string();
        if full.len() <= MAX_REPR_LEN {
            return full;
        }
        let mut cut = MAX_REPR_LEN;
        while !full.is_char_boundary(cut) {
            cut -= 1;
        }
        full[..cut].to_string()
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Bool(true) => write!(f, "True"),
            Self::Bool(false) => write!(f, "False"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) => {
                if v.fract() == 0.0 && v.is_finite() {
                    write!(f, "{v:.1}")
                } else {
                    write!(f, "{v}")
                }
            }
            Self::Str(s) => write!(f, "{s:?}"),
            Self::Tuple(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                if items.len() == 1 {
                    write!(f, ",")?;
                }
                write!(f, ")")
            }
            Self::Func(id) => write!(f, "<function code_{}>", id.0),
            Self::Builtin(id) => write!(f, "<builtin {}>", id.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repr_is_bounded() {
        let long = "x".repeat(500);
        let v = Value::str(&long);
        assert!(v.repr().len() <= MAX_REPR_LEN);
    }

    #[test]
    fn display_matches_guest_conventions() {
        assert_eq!(Value::Int(30).to_string(), "30");
        assert_eq!(Value::Float(0.3).to_string(), "0.3");
        assert_eq!(Value::Float(2.0).to_string(), "2.0");
        assert_eq!(Value::Bool(true).to_string(), "True");
        assert_eq!(Value::str("hi").to_string(), "\"hi\"");
        assert_eq!(
            Value::tuple(vec![Value::Int(1)]).to_string(),
            "(1,)"
        );
    }

    #[test]
    fn truthiness() {
        assert!(!Value::None.is_truthy());
        assert!(!Value::Int(0).is_truthy());
        assert!(Value::Float(0.5).is_truthy());
        assert!(!Value::str("").is_truthy());
    }
}
