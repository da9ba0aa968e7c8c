//! The datastore contract the engine runs against.
//!
//! A backend stores entities, a key plus its flat property list, and runs
//! simple queries over them. Transactions give the engine read-check-write
//! semantics; a backend reports lost races as [`Error::Conflict`] so the
//! engine can retry.

use crate::property::{Property, Value};
use crate::{error::Result, Error, Key};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::future::Future;
use std::str::FromStr;

/// A stored entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub key: Key,
    pub properties: Vec<Property>,
}

impl Entity {
    pub fn new(key: Key, properties: Vec<Property>) -> Self {
        Self { key, properties }
    }

    /// All values stored under `name`.
    pub fn values<'a, 'n>(&'a self, name: &'n str) -> impl Iterator<Item = &'a Value> + 'n
    where
        'a: 'n,
    {
        self.properties
            .iter()
            .filter(move |p| p.name == name)
            .map(|p| &p.value)
    }

    /// First value stored under `name`.
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.properties
            .iter()
            .find(|p| p.name == name)
            .map(|p| &p.value)
    }
}

/// Comparison operator of a query filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOp {
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
    Ne,
}

impl FilterOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOp::Eq => "=",
            FilterOp::Lt => "<",
            FilterOp::Le => "<=",
            FilterOp::Gt => ">",
            FilterOp::Ge => ">=",
            FilterOp::Ne => "!=",
        }
    }

    /// Whether a stored value compared to the filter value satisfies the op.
    pub fn accepts(&self, ordering: Ordering) -> bool {
        match self {
            FilterOp::Eq => ordering == Ordering::Equal,
            FilterOp::Lt => ordering == Ordering::Less,
            FilterOp::Le => ordering != Ordering::Greater,
            FilterOp::Gt => ordering == Ordering::Greater,
            FilterOp::Ge => ordering != Ordering::Less,
            FilterOp::Ne => ordering != Ordering::Equal,
        }
    }
}

impl fmt::Display for FilterOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FilterOp {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "=" | "==" => Ok(FilterOp::Eq),
            "<" => Ok(FilterOp::Lt),
            "<=" => Ok(FilterOp::Le),
            ">" => Ok(FilterOp::Gt),
            ">=" => Ok(FilterOp::Ge),
            "!=" => Ok(FilterOp::Ne),
            other => Err(Error::InvalidQuery(format!("unknown filter operator '{other}'"))),
        }
    }
}

/// A property filter.
///
/// Against a multi-valued property the filter matches when any value does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub property: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    pub fn matches(&self, entity: &Entity) -> bool {
        entity
            .values(&self.property)
            .any(|v| v.compare(&self.value).is_some_and(|o| self.op.accepts(o)))
    }
}

/// A sort order on one property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub property: String,
    pub descending: bool,
}

/// A query over one kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub kind: String,
    /// Restricts results to this key and its descendants
    pub ancestor: Option<Key>,
    pub filters: Vec<Filter>,
    pub orders: Vec<Order>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl Query {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..Self::default()
        }
    }

    pub fn filter(mut self, property: impl Into<String>, op: FilterOp, value: Value) -> Self {
        self.filters.push(Filter {
            property: property.into(),
            op,
            value,
        });
        self
    }

    pub fn order(mut self, property: impl Into<String>, descending: bool) -> Self {
        self.orders.push(Order {
            property: property.into(),
            descending,
        });
        self
    }

    pub fn ancestor(mut self, ancestor: Key) -> Self {
        self.ancestor = Some(ancestor);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// The same query without limit and offset, as used for totals.
    pub fn unbounded(&self) -> Self {
        Self {
            limit: None,
            offset: 0,
            ..self.clone()
        }
    }

    /// Whether `entity` satisfies the kind, ancestor, and filters.
    ///
    /// Entities missing an ordered property never match.
    pub fn matches(&self, entity: &Entity) -> bool {
        entity.key.kind() == self.kind
            && self
                .ancestor
                .as_ref()
                .map_or(true, |a| *a == entity.key || a.is_ancestor_of(&entity.key))
            && self.filters.iter().all(|f| f.matches(entity))
            && self
                .orders
                .iter()
                .all(|o| entity.value(&o.property).is_some())
    }

    /// Compare two entities by the query's orders, then by key.
    pub fn compare(&self, a: &Entity, b: &Entity) -> Ordering {
        for order in &self.orders {
            let ordering = match (sort_value(a, order), sort_value(b, order)) {
                (Some(x), Some(y)) => rank(x).cmp(&rank(y)).then_with(|| {
                    x.compare(y).unwrap_or(Ordering::Equal)
                }),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            };
            let ordering = if order.descending {
                ordering.reverse()
            } else {
                ordering
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        a.key.cmp(&b.key)
    }

    /// Filter, sort, and slice entities in memory.
    pub fn apply(&self, entities: impl IntoIterator<Item = Entity>) -> Vec<Entity> {
        let mut matched: Vec<Entity> = entities.into_iter().filter(|e| self.matches(e)).collect();
        matched.sort_by(|a, b| self.compare(a, b));
        matched
            .into_iter()
            .skip(self.offset)
            .take(self.limit.unwrap_or(usize::MAX))
            .collect()
    }
}

/// Value a multi-valued property sorts by: its smallest value ascending,
/// its largest descending.
fn sort_value<'a>(entity: &'a Entity, order: &Order) -> Option<&'a Value> {
    let descending = order.descending;
    let pick = move |best: &'a Value, v: &'a Value| {
        let ordering = rank(v)
            .cmp(&rank(best))
            .then_with(|| v.compare(best).unwrap_or(Ordering::Equal));
        let better = if descending {
            ordering == Ordering::Greater
        } else {
            ordering == Ordering::Less
        };
        if better {
            v
        } else {
            best
        }
    };
    let mut values = entity
        .properties
        .iter()
        .filter(|p| p.name == order.property)
        .map(|p| &p.value);
    let first = values.next()?;
    Some(values.fold(first, pick))
}

/// Cross-type ordering of values.
fn rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Int(_) | Value::Float(_) => 1,
        Value::Timestamp(_) => 2,
        Value::Bool(_) => 3,
        Value::String(_) => 4,
        Value::Bytes(_) => 5,
        Value::Key(_) => 6,
    }
}

/// A transactional entity store.
///
/// ## Errors
///
/// | Condition | Error |
/// |-----------|-------|
/// | Delete of an absent entity | `NotFound` |
/// | Lost race with a concurrent transaction | `Conflict` |
/// | Backend failure | `Backend` |
pub trait Datastore: Send + Sync + 'static {
    type Tx: Transaction;

    /// Point read outside any transaction.
    fn get(&self, key: &Key) -> impl Future<Output = Result<Option<Entity>>> + Send;

    /// Write an entity, allocating an id when its key is incomplete.
    ///
    /// Returns the complete key.
    fn put(&self, entity: Entity) -> impl Future<Output = Result<Key>> + Send;

    fn delete(&self, key: &Key) -> impl Future<Output = Result<()>> + Send;

    fn begin(&self) -> impl Future<Output = Result<Self::Tx>> + Send;

    fn run_query(&self, query: &Query) -> impl Future<Output = Result<Vec<Entity>>> + Send;

    /// Number of entities matching the query, ignoring its limit and offset.
    fn count(&self, query: &Query) -> impl Future<Output = Result<usize>> + Send;
}

/// An open transaction.
///
/// Reads observe a consistent snapshot; writes become visible together on
/// commit. Dropping a transaction without committing discards its writes.
pub trait Transaction: Send + Sized {
    fn get(&mut self, key: &Key) -> impl Future<Output = Result<Option<Entity>>> + Send;

    /// Buffer a write, allocating an id when the key is incomplete.
    fn put(&mut self, entity: Entity) -> impl Future<Output = Result<Key>> + Send;

    /// Buffer a delete. Fails with `NotFound` if the entity does not exist.
    fn delete(&mut self, key: &Key) -> impl Future<Output = Result<()>> + Send;

    /// Commit all buffered writes, or fail with `Conflict`.
    fn commit(self) -> impl Future<Output = Result<()>> + Send;

    fn rollback(self) -> impl Future<Output = Result<()>> + Send;
}
