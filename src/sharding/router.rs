//! Request routing.
//!
//! Turns per-call routing options and a query's filter into a
//! [`RoutingDecision`], and a decision into the shard descriptors to call.

use super::predicate::{FilterPredicate, KeyConstraint, PredicateExtractor};
use super::registry::{ShardDescriptor, ShardMap};
use super::shard_function::ShardFunction;
use crate::error::{Error, Result};
use crate::types::{KeyValue, Query, RoutingOptions, ShardId};
use std::collections::HashSet;
use std::sync::Arc;

/// The set of shards a call targets.
///
/// Only the router produces decisions; callers never build them directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingDecision {
    /// Every registered shard, in registry order.
    AllShards,
    /// A single shard.
    ExactlyOne(ShardId),
    /// Several shards, in first-occurrence order.
    SomeOf(Vec<ShardId>),
}

impl RoutingDecision {
    /// Whether this decision broadcasts to every shard.
    pub fn is_broadcast(&self) -> bool {
        matches!(self, RoutingDecision::AllShards)
    }

    /// Collapse a list of identifiers into a decision.
    ///
    /// Duplicates are dropped keeping the first occurrence; a single
    /// distinct identifier becomes `ExactlyOne`.
    fn from_ids(ids: impl IntoIterator<Item = ShardId>) -> Self {
        let mut ids = dedup_ids(ids);
        if ids.len() == 1 {
            RoutingDecision::ExactlyOne(ids.remove(0))
        } else {
            RoutingDecision::SomeOf(ids)
        }
    }
}

/// Routes calls to shards using the registry and the shard function.
#[derive(Debug)]
pub struct ShardRouter<B: ?Sized> {
    /// Immutable registry.
    shards: Arc<ShardMap<B>>,

    /// Shard-key value to shard identifier.
    function: Arc<dyn ShardFunction>,

    /// Filter inspection.
    extractor: PredicateExtractor,

    /// Column used when a call does not name one.
    default_column: Option<String>,
}

impl<B: ?Sized> ShardRouter<B> {
    /// Create a router.
    pub fn new(
        shards: Arc<ShardMap<B>>,
        function: Arc<dyn ShardFunction>,
        extractor: PredicateExtractor,
        default_column: Option<String>,
    ) -> Self {
        Self {
            shards,
            function,
            extractor,
            default_column,
        }
    }

    /// The shard registry.
    pub fn shards(&self) -> &Arc<ShardMap<B>> {
        &self.shards
    }

    /// The default shard-key column, if configured.
    pub fn default_column(&self) -> Option<&str> {
        self.default_column.as_deref()
    }

    /// Resolve a shard-key value to a registered shard identifier.
    pub fn shard_for_value(&self, value: &KeyValue) -> Result<ShardId> {
        let shard_id = self.function.shard_for(value);
        if !self.shards.contains(&shard_id) {
            tracing::warn!(%value, %shard_id, "Shard function produced an unregistered shard");
            return Err(Error::UnknownShard(shard_id));
        }
        Ok(shard_id)
    }

    /// Route directly to the shard owning `value`.
    pub fn route_value(&self, value: &KeyValue) -> Result<RoutingDecision> {
        Ok(RoutingDecision::ExactlyOne(self.shard_for_value(value)?))
    }

    /// Route using the filter's constraints on `column`.
    pub fn route_filter(&self, filters: &[FilterPredicate], column: &str) -> Result<RoutingDecision> {
        match self.extractor.extract(filters, column) {
            KeyConstraint::Unconstrained => Ok(RoutingDecision::AllShards),
            KeyConstraint::Values(values) => {
                let ids = values
                    .iter()
                    .map(|v| self.shard_for_value(v))
                    .collect::<Result<Vec<_>>>()?;
                Ok(RoutingDecision::from_ids(ids))
            }
        }
    }

    /// Route a call from its options and query.
    ///
    /// An explicit shard value wins; otherwise the route-by column (or the
    /// configured default) prunes by filter; otherwise the call broadcasts.
    pub fn route(&self, query: &Query, options: &RoutingOptions) -> Result<RoutingDecision> {
        let decision = if let Some(value) = &options.shard_value {
            self.route_value(value)?
        } else if let Some(column) = self.routing_column(options) {
            self.route_filter(&query.filters, column)?
        } else {
            RoutingDecision::AllShards
        };

        tracing::debug!(source = %query.source, ?decision, "Routed query");
        Ok(decision)
    }

    /// The single shard addressed by an explicit shard value.
    ///
    /// Fails with `MissingRoutingKey` when the options carry none.
    pub fn route_required(&self, options: &RoutingOptions, operation: &'static str) -> Result<ShardId> {
        let value = options
            .shard_value
            .as_ref()
            .ok_or(Error::MissingRoutingKey { operation })?;
        self.shard_for_value(value)
    }

    /// The column used to route a call, if any.
    pub fn routing_column<'a>(&'a self, options: &'a RoutingOptions) -> Option<&'a str> {
        options.route_by.as_deref().or(self.default_column.as_deref())
    }

    /// Descriptors to call for a decision.
    ///
    /// `AllShards` follows registry order; `SomeOf` follows first-occurrence
    /// order with duplicates removed.
    pub fn select(&self, decision: &RoutingDecision) -> Result<Vec<ShardDescriptor<B>>> {
        match decision {
            RoutingDecision::AllShards => Ok(self.shards.all().to_vec()),
            RoutingDecision::ExactlyOne(id) => Ok(vec![self.shards.resolve(id)?.clone()]),
            RoutingDecision::SomeOf(ids) => dedup_ids(ids.iter().cloned())
                .iter()
                .map(|id| self.shards.resolve(id).cloned())
                .collect(),
        }
    }
}

fn dedup_ids(ids: impl IntoIterator<Item = ShardId>) -> Vec<ShardId> {
    let mut seen = HashSet::new();
    ids.into_iter().filter(|id| seen.insert(id.clone())).collect()
}
