//! Filter predicates and shard-key extraction.
//!
//! Callers translate whatever query representation they use into a list of
//! [`FilterPredicate`]s combined by implicit conjunction. The extractor only
//! looks at equality and membership nodes on the shard-key column; every
//! other shape is ignored and never causes an error. A literal that has no
//! shard-key form (a fractional decimal, a boolean) widens the whole call to
//! a broadcast.

use crate::types::{KeyValue, Row, Value};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;

/// Comparison operators for predicates the extractor does not interpret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// One node of a conjunctive filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FilterPredicate {
    /// `column = value`
    Equality { column: String, value: Value },

    /// `column IN (values)`
    Membership { column: String, values: Vec<Value> },

    /// `column <op> value`. Never narrows routing.
    Comparison {
        column: String,
        op: CompareOp,
        value: Value,
    },

    /// A condition only the backend understands. Never narrows routing.
    Opaque { description: String },
}

impl FilterPredicate {
    /// Equality predicate.
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        FilterPredicate::Equality {
            column: column.into(),
            value: value.into(),
        }
    }

    /// Membership predicate.
    pub fn within<V: Into<Value>>(
        column: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        FilterPredicate::Membership {
            column: column.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Comparison predicate.
    pub fn compare(column: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        FilterPredicate::Comparison {
            column: column.into(),
            op,
            value: value.into(),
        }
    }

    /// Opaque predicate.
    pub fn opaque(description: impl Into<String>) -> Self {
        FilterPredicate::Opaque {
            description: description.into(),
        }
    }

    /// The column this predicate constrains, if any.
    pub fn column(&self) -> Option<&str> {
        match self {
            FilterPredicate::Equality { column, .. }
            | FilterPredicate::Membership { column, .. }
            | FilterPredicate::Comparison { column, .. } => Some(column),
            FilterPredicate::Opaque { .. } => None,
        }
    }

    /// Evaluate the predicate against a row.
    ///
    /// Opaque predicates match every row; interpreting them is the
    /// backend's job.
    pub fn matches(&self, row: &Row) -> bool {
        match self {
            FilterPredicate::Equality { column, value } => row
                .get(column)
                .is_some_and(|field| field.compare(value) == Some(Ordering::Equal)),
            FilterPredicate::Membership { column, values } => row.get(column).is_some_and(|field| {
                values
                    .iter()
                    .any(|v| field.compare(v) == Some(Ordering::Equal))
            }),
            FilterPredicate::Comparison { column, op, value } => {
                let Some(field) = row.get(column) else {
                    return false;
                };
                match (op, field.compare(value)) {
                    (CompareOp::Ne, ord) => ord != Some(Ordering::Equal),
                    (_, None) => false,
                    (CompareOp::Lt, Some(ord)) => ord == Ordering::Less,
                    (CompareOp::Le, Some(ord)) => ord != Ordering::Greater,
                    (CompareOp::Gt, Some(ord)) => ord == Ordering::Greater,
                    (CompareOp::Ge, Some(ord)) => ord != Ordering::Less,
                }
            }
            FilterPredicate::Opaque { .. } => true,
        }
    }
}

/// Whether every predicate matches a row.
pub fn matches_all(filters: &[FilterPredicate], row: &Row) -> bool {
    filters.iter().all(|p| p.matches(row))
}

/// How values from several matching predicates are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PredicateMode {
    /// Union of every referenced value.
    #[default]
    Union,
    /// Intersection across predicates, as conjunction implies.
    Intersect,
}

/// Result of shard-key extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyConstraint {
    /// No usable constraint on the shard-key column; broadcast.
    Unconstrained,
    /// The column is constrained to these values, in first-occurrence order.
    Values(Vec<KeyValue>),
}

/// Extracts candidate shard-key values from a filter.
#[derive(Debug, Clone, Copy, Default)]
pub struct PredicateExtractor {
    mode: PredicateMode,
}

impl PredicateExtractor {
    /// Create an extractor.
    pub fn new(mode: PredicateMode) -> Self {
        Self { mode }
    }

    /// The combination mode.
    pub fn mode(&self) -> PredicateMode {
        self.mode
    }

    /// Extract the values `column` is constrained to.
    ///
    /// Traverses the filter once. An empty result is `Unconstrained`, never
    /// "provably empty".
    pub fn extract(&self, filters: &[FilterPredicate], column: &str) -> KeyConstraint {
        let mut combined: Option<Vec<KeyValue>> = None;

        for predicate in filters {
            let values = match predicate {
                FilterPredicate::Equality { column: c, value } if c == column => {
                    match key_values(std::slice::from_ref(value)) {
                        Some(values) => values,
                        None => return non_key_literal(column, predicate),
                    }
                }
                FilterPredicate::Membership { column: c, values } if c == column => {
                    match key_values(values) {
                        Some(values) => values,
                        None => return non_key_literal(column, predicate),
                    }
                }
                other => {
                    if other.column() == Some(column) {
                        tracing::trace!(column, predicate = ?other, "Ignoring unsupported predicate shape");
                    }
                    continue;
                }
            };

            combined = Some(match (combined, self.mode) {
                (None, _) => values,
                (Some(mut acc), PredicateMode::Union) => {
                    let seen: HashSet<KeyValue> = acc.iter().cloned().collect();
                    acc.extend(values.into_iter().filter(|v| !seen.contains(v)));
                    acc
                }
                (Some(acc), PredicateMode::Intersect) => {
                    let keep: HashSet<KeyValue> = values.into_iter().collect();
                    acc.into_iter().filter(|v| keep.contains(v)).collect()
                }
            });
        }

        match combined {
            Some(values) if !values.is_empty() => KeyConstraint::Values(values),
            _ => KeyConstraint::Unconstrained,
        }
    }
}

/// Convert literal values to shard-key values, dropping duplicates and nulls.
///
/// `None` when a non-null literal has no key form: rows equal to it may live
/// on any shard.
fn key_values(values: &[Value]) -> Option<Vec<KeyValue>> {
    let mut seen = HashSet::new();
    let mut keys = Vec::with_capacity(values.len());
    for value in values.iter().filter(|v| !v.is_null()) {
        let key = value.as_key()?;
        if seen.insert(key.clone()) {
            keys.push(key);
        }
    }
    Some(keys)
}

fn non_key_literal(column: &str, predicate: &FilterPredicate) -> KeyConstraint {
    tracing::trace!(column, ?predicate, "Literal cannot act as a shard key, broadcasting");
    KeyConstraint::Unconstrained
}
