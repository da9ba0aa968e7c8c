//! Properties: the flat storage unit, and the tree they flatten from.
//!
//! A holder keeps each field's state as a [`PropertyTree`]. Only at the
//! storage boundary is a tree flattened into [`Property`] values with dotted
//! names (`address.city`); loading reverses it.

use crate::Key;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Name of the meta property holding the creation time.
pub const META_CREATED_AT: &str = "meta.createdAt";
/// Name of the meta property holding the last update time.
pub const META_UPDATED_AT: &str = "meta.updatedAt";
/// Name of the meta property holding the creator's key.
pub const META_CREATED_BY: &str = "meta.createdBy";
/// Name of the meta property holding the last updater's key.
pub const META_UPDATED_BY: &str = "meta.updatedBy";

/// Root segment reserved for meta properties.
pub const META_ROOT: &str = "meta";

/// Separator between segments of a flattened property name.
pub const SEPARATOR: char = '.';

/// A scalar value as stored by a datastore.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Timestamp(DateTime<Utc>),
    Key(Key),
}

impl Value {
    /// Name of the value's type, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "Null",
            Value::Bool(_) => "Bool",
            Value::Int(_) => "Int",
            Value::Float(_) => "Float",
            Value::String(_) => "String",
            Value::Bytes(_) => "Bytes",
            Value::Timestamp(_) => "Timestamp",
            Value::Key(_) => "Key",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Timestamp(t) => Some(*t),
            _ => None,
        }
    }

    pub fn as_key(&self) -> Option<&Key> {
        match self {
            Value::Key(k) => Some(k),
            _ => None,
        }
    }

    /// Compare two values the way a datastore orders them.
    ///
    /// Ints and floats compare numerically with each other; any other pair of
    /// different types is incomparable.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, Value::Null) => Some(Ordering::Equal),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Int(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
            (Value::Float(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::Bytes(a), Value::Bytes(b)) => Some(a.cmp(b)),
            (Value::Timestamp(a), Value::Timestamp(b)) => Some(a.cmp(b)),
            (Value::Key(a), Value::Key(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// JSON form used in caller-facing output.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Value::from(*f),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(b) => serde_json::Value::String(STANDARD.encode(b)),
            Value::Timestamp(t) => {
                serde_json::Value::String(t.to_rfc3339_opts(SecondsFormat::Micros, true))
            }
            Value::Key(k) => serde_json::Value::String(k.encode()),
        }
    }
}

/// A flat `(name, value)` unit, the wire format at the storage boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Property {
    /// Dotted storage name
    pub name: String,
    /// Stored value
    pub value: Value,
    /// Whether this is one of several values stored under the same name
    pub multiple: bool,
    /// Whether the datastore should skip indexing this value
    pub no_index: bool,
}

impl Property {
    /// Create a single-valued, indexed property.
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
            multiple: false,
            no_index: false,
        }
    }

    /// Mark the property as one of several values.
    pub fn multiple(mut self, multiple: bool) -> Self {
        self.multiple = multiple;
        self
    }

    /// Mark the property as unindexed.
    pub fn no_index(mut self, no_index: bool) -> Self {
        self.no_index = no_index;
        self
    }

    /// First segment of the dotted name.
    pub fn root(&self) -> &str {
        root_segment(&self.name)
    }
}

/// First segment of a dotted name.
pub fn root_segment(name: &str) -> &str {
    name.split(SEPARATOR).next().unwrap_or(name)
}

/// Join a prefix and a child segment into a dotted name.
pub fn join_name(prefix: &str, child: &str) -> String {
    if prefix.is_empty() {
        child.to_string()
    } else {
        format!("{prefix}{SEPARATOR}{child}")
    }
}

/// In-memory state of one field.
///
/// Storage names key the nested maps; flattening walks the owning field's
/// descriptor so property order follows declaration order.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyTree {
    Scalar(Value),
    List(Vec<PropertyTree>),
    Nested(BTreeMap<String, PropertyTree>),
}

impl PropertyTree {
    pub fn null() -> Self {
        PropertyTree::Scalar(Value::Null)
    }

    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            PropertyTree::Scalar(v) => Some(v),
            _ => None,
        }
    }

    /// Whether the tree holds no data: a null scalar, an empty list, or a
    /// nested group whose children are all empty.
    pub fn is_empty(&self) -> bool {
        match self {
            PropertyTree::Scalar(v) => v.is_null(),
            PropertyTree::List(items) => items.is_empty(),
            PropertyTree::Nested(children) => children.values().all(PropertyTree::is_empty),
        }
    }
}
