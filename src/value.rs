use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::id::FieldName;

/// A node's data record: an ordered map from field name to scalar value.
/// The set of fields is fixed by the schema's data template for the node
/// type.
pub type Fields = BTreeMap<FieldName, Value>;

/// A scalar data value stored in a node field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    I64(i64),
    F64(f64),
    Str(String),
    List(Vec<Value>),
}

/// The kind of a [`Value`], used in diagnostics.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ValueKind {
    Null,
    Bool,
    I64,
    F64,
    Str,
    List,
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Null => ValueKind::Null,
            Self::Bool(_) => ValueKind::Bool,
            Self::I64(_) => ValueKind::I64,
            Self::F64(_) => ValueKind::F64,
            Self::Str(_) => ValueKind::Str,
            Self::List(_) => ValueKind::List,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        if let Self::Str(s) = self {
            Some(s)
        } else {
            None
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        if let Self::Bool(b) = self {
            Some(*b)
        } else {
            None
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        if let Self::I64(n) = self {
            Some(*n)
        } else {
            None
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::F64(n) => Some(*n),
            Self::I64(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::I64(_) | Self::F64(_))
    }

    /// Canonical JSON encoding, used where values must be compared
    /// lexicographically.
    pub(crate) fn canonical_json(&self) -> String {
        // serialization of these variants cannot fail
        serde_json::to_string(self).expect("value serialization")
    }
}

impl Default for Value {
    fn default() -> Self {
        Self::Null
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::I64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::F64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl<V: Into<Value>> From<Vec<V>> for Value {
    fn from(v: Vec<V>) -> Self {
        Self::List(v.into_iter().map(Into::into).collect())
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(v) => write!(f, "{}", v),
            Self::I64(v) => write!(f, "{}", v),
            Self::F64(v) => write!(f, "{}", v),
            Self::Str(v) => write!(f, "{:?}", v),
            Self::List(vs) => {
                write!(f, "[")?;
                for (i, v) in vs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untagged_serde() {
        let v: Value = serde_json::from_str("\"hello\"").unwrap();
        assert_eq!(v, Value::Str("hello".to_string()));
        let v: Value = serde_json::from_str("3").unwrap();
        assert_eq!(v, Value::I64(3));
        let v: Value = serde_json::from_str("3.5").unwrap();
        assert_eq!(v, Value::F64(3.5));
        let v: Value = serde_json::from_str("[true, null]").unwrap();
        assert_eq!(v, Value::List(vec![Value::Bool(true), Value::Null]));
    }

    #[test]
    fn canonical_json_is_deterministic() {
        let v = Value::List(vec![Value::I64(1), Value::Str("a".into())]);
        assert_eq!(v.canonical_json(), "[1,\"a\"]");
    }
}
