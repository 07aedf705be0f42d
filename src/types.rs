//! Core types used throughout the crate.

use crate::sharding::FilterPredicate;
use bytes::Bytes;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Identifier of a shard in the registry.
///
/// Ordered shard configurations produce `Index` identifiers; keyed
/// configurations may use either form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ShardId {
    /// Positional identifier.
    Index(u32),
    /// Caller-chosen name.
    Named(SmolStr),
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardId::Index(idx) => write!(f, "{}", idx),
            ShardId::Named(name) => write!(f, "{}", name),
        }
    }
}

impl From<u32> for ShardId {
    fn from(idx: u32) -> Self {
        ShardId::Index(idx)
    }
}

impl From<&str> for ShardId {
    fn from(name: &str) -> Self {
        ShardId::Named(SmolStr::new(name))
    }
}

impl From<String> for ShardId {
    fn from(name: String) -> Self {
        ShardId::Named(SmolStr::new(name))
    }
}

/// A shard-key value: the input of a shard function.
///
/// Strings are carried as their UTF-8 bytes so numeric and opaque key
/// domains are the only two cases a shard function has to handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum KeyValue {
    /// Numeric key.
    Int(i64),
    /// Opaque byte or string key.
    Bytes(Bytes),
}

impl KeyValue {
    /// Get the integer value, if this is a numeric key.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            KeyValue::Int(v) => Some(*v),
            KeyValue::Bytes(_) => None,
        }
    }

    /// Get the raw bytes, if this is an opaque key.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            KeyValue::Int(_) => None,
            KeyValue::Bytes(b) => Some(b),
        }
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::Int(v) => write!(f, "{}", v),
            KeyValue::Bytes(b) => write!(f, "{}", String::from_utf8_lossy(b)),
        }
    }
}

impl From<i64> for KeyValue {
    fn from(v: i64) -> Self {
        KeyValue::Int(v)
    }
}

impl From<i32> for KeyValue {
    fn from(v: i32) -> Self {
        KeyValue::Int(v as i64)
    }
}

impl From<u32> for KeyValue {
    fn from(v: u32) -> Self {
        KeyValue::Int(v as i64)
    }
}

impl From<&str> for KeyValue {
    fn from(s: &str) -> Self {
        KeyValue::Bytes(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<String> for KeyValue {
    fn from(s: String) -> Self {
        KeyValue::Bytes(Bytes::from(s))
    }
}

impl From<Bytes> for KeyValue {
    fn from(b: Bytes) -> Self {
        KeyValue::Bytes(b)
    }
}

impl From<Vec<u8>> for KeyValue {
    fn from(b: Vec<u8>) -> Self {
        KeyValue::Bytes(Bytes::from(b))
    }
}

/// A field value stored in a row or compared by a predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Decimal(Decimal),
    Text(String),
    Bytes(Bytes),
}

impl Value {
    /// Whether this is `Null`.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Convert to a shard-key value.
    ///
    /// Only integers, text and bytes can act as shard keys.
    pub fn as_key(&self) -> Option<KeyValue> {
        match self {
            Value::Int(v) => Some(KeyValue::Int(*v)),
            // Integral decimals compare equal to integers.
            Value::Decimal(d) if d.fract().is_zero() => d.to_i64().map(KeyValue::Int),
            Value::Text(s) => Some(KeyValue::from(s.as_str())),
            Value::Bytes(b) => Some(KeyValue::Bytes(b.clone())),
            _ => None,
        }
    }

    /// Numeric view used by aggregate accumulation.
    pub fn to_decimal(&self) -> Option<Decimal> {
        match self {
            Value::Int(v) => Some(Decimal::from(*v)),
            Value::Decimal(d) => Some(*d),
            _ => None,
        }
    }

    /// Compare two values of compatible kinds.
    ///
    /// Integers and decimals compare numerically with each other. Any other
    /// mix of kinds, and `Null`, is incomparable.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            (Value::Bytes(a), Value::Bytes(b)) => Some(a.cmp(b)),
            (a, b) => match (a.to_decimal(), b.to_decimal()) {
                (Some(a), Some(b)) => Some(a.cmp(&b)),
                _ => None,
            },
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<Decimal> for Value {
    fn from(v: Decimal) -> Self {
        Value::Decimal(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Bytes> for Value {
    fn from(v: Bytes) -> Self {
        Value::Bytes(v)
    }
}

impl From<KeyValue> for Value {
    fn from(v: KeyValue) -> Self {
        match v {
            KeyValue::Int(i) => Value::Int(i),
            KeyValue::Bytes(b) => Value::Bytes(b),
        }
    }
}

/// A row of named fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Row {
    fields: BTreeMap<String, Value>,
}

impl Row {
    /// Create an empty row.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style field setter.
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(column.into(), value.into());
        self
    }

    /// Set a field.
    pub fn set(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(column.into(), value.into());
    }

    /// Get a field.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.fields.get(column)
    }

    /// Get a field as a shard-key value.
    pub fn key(&self, column: &str) -> Option<KeyValue> {
        self.get(column).and_then(Value::as_key)
    }

    /// Iterate over all fields.
    pub fn fields(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    /// Copy every field of `changes` into this row.
    pub fn apply(&mut self, changes: &Row) {
        for (column, value) in changes.fields() {
            self.fields.insert(column.clone(), value.clone());
        }
    }
}

/// A query against one logical source, as seen by the routing core.
///
/// The filter list is an implicit conjunction. Backends interpret the rest
/// of the query however their storage requires.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    /// Logical source (table, collection) name.
    pub source: String,
    /// Conjunctive filter predicates.
    pub filters: Vec<FilterPredicate>,
}

impl Query {
    /// Create an unfiltered query over a source.
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            filters: Vec::new(),
        }
    }

    /// Add a predicate.
    pub fn filter(mut self, predicate: FilterPredicate) -> Self {
        self.filters.push(predicate);
        self
    }

    /// Add an equality predicate.
    pub fn eq(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(FilterPredicate::eq(column, value))
    }

    /// Add a membership predicate.
    pub fn within<V: Into<Value>>(
        self,
        column: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        self.filter(FilterPredicate::within(column, values))
    }
}

/// Per-call routing directives.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoutingOptions {
    /// Column whose predicates may prune the shard set.
    pub route_by: Option<String>,
    /// Explicit shard-key value addressing a single shard.
    pub shard_value: Option<KeyValue>,
}

impl RoutingOptions {
    /// Options with no directives.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable predicate-based pruning on a column.
    pub fn route_by(mut self, column: impl Into<String>) -> Self {
        self.route_by = Some(column.into());
        self
    }

    /// Address the shard owning a key value directly.
    pub fn shard_value(mut self, value: impl Into<KeyValue>) -> Self {
        self.shard_value = Some(value.into());
        self
    }
}

/// Result of a write: affected count plus rows the backend chose to return.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MutationResult {
    /// Number of affected rows.
    pub count: u64,
    /// Returned rows, absent when the backend returned none.
    pub rows: Option<Vec<Row>>,
}

impl MutationResult {
    /// A result with a count and no rows.
    pub fn count(count: u64) -> Self {
        Self { count, rows: None }
    }

    /// A result carrying returned rows.
    pub fn with_rows(count: u64, rows: Vec<Row>) -> Self {
        Self {
            count,
            rows: Some(rows),
        }
    }
}

/// Aggregate function kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggregateKind {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl fmt::Display for AggregateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AggregateKind::Count => write!(f, "count"),
            AggregateKind::Sum => write!(f, "sum"),
            AggregateKind::Avg => write!(f, "avg"),
            AggregateKind::Min => write!(f, "min"),
            AggregateKind::Max => write!(f, "max"),
        }
    }
}
