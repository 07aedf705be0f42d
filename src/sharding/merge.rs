//! Result combinators for scatter-gather.
//!
//! Each operation kind has exactly one way of merging per-shard results.
//! Inputs are always in backend-call order.

use crate::error::{Error, Result};
use crate::types::{MutationResult, Row, Value};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::cmp::Ordering;

/// Concatenate per-shard lists in call order. No global re-sort.
pub fn concat_rows(parts: Vec<Vec<Row>>) -> Vec<Row> {
    parts.into_iter().flatten().collect()
}

/// Logical OR across shards.
pub fn any(parts: impl IntoIterator<Item = bool>) -> bool {
    parts.into_iter().any(|found| found)
}

/// Sum counts and concatenate returned rows.
///
/// Rows stay absent unless at least one shard returned some.
pub fn merge_mutations(parts: Vec<MutationResult>) -> MutationResult {
    parts
        .into_iter()
        .fold(MutationResult::default(), |mut acc, part| {
            acc.count += part.count;
            if let Some(rows) = part.rows {
                acc.rows.get_or_insert_with(Vec::new).extend(rows);
            }
            acc
        })
}

/// Exact sum of per-shard partials. Absent partials count as zero.
pub fn sum(parts: &[Option<Value>]) -> Result<Decimal> {
    parts
        .iter()
        .flatten()
        .filter_map(Value::to_decimal)
        .try_fold(Decimal::ZERO, |acc, part| acc.checked_add(part))
        .ok_or(Error::AggregateOverflow("sum"))
}

/// Sum of per-shard counts.
pub fn count(parts: &[Option<Value>]) -> Result<u64> {
    sum(parts)?
        .to_u64()
        .ok_or(Error::AggregateOverflow("count"))
}

/// Mean of per-shard averages over every participating shard.
///
/// Absent partials contribute zero but still count as participants.
/// Returns `None` when no shard produced an average.
pub fn mean_of_averages(parts: &[Option<Value>]) -> Result<Option<Decimal>> {
    if parts.iter().all(|p| p.as_ref().and_then(Value::to_decimal).is_none()) {
        return Ok(None);
    }
    let total = sum(parts)?;
    total
        .checked_div(Decimal::from(parts.len() as u64))
        .map(Some)
        .ok_or(Error::AggregateOverflow("avg"))
}

/// Row-weighted average from per-shard `(sum, count)` partials.
///
/// Returns `None` when no rows contributed.
pub fn weighted_average(parts: &[(Option<Value>, Option<Value>)]) -> Result<Option<Decimal>> {
    let sums: Vec<Option<Value>> = parts.iter().map(|(s, _)| s.clone()).collect();
    let counts: Vec<Option<Value>> = parts.iter().map(|(_, c)| c.clone()).collect();

    let rows = count(&counts)?;
    if rows == 0 {
        return Ok(None);
    }
    sum(&sums)?
        .checked_div(Decimal::from(rows))
        .map(Some)
        .ok_or(Error::AggregateOverflow("avg"))
}

/// Global extreme of per-shard partials.
///
/// `wanted` is `Ordering::Less` for min and `Ordering::Greater` for max.
/// Absent and incomparable partials are skipped.
pub fn extreme(parts: Vec<Option<Value>>, wanted: Ordering) -> Option<Value> {
    parts
        .into_iter()
        .flatten()
        .filter(|v| !v.is_null())
        .fold(None, |best: Option<Value>, candidate| match best {
            None => Some(candidate),
            Some(current) => {
                if candidate.compare(&current) == Some(wanted) {
                    Some(candidate)
                } else {
                    Some(current)
                }
            }
        })
}
