//! Scatter-gather execution over routed shards.
//!
//! Every fan-out issues all of its backend calls concurrently and waits for
//! every one of them before merging, so callers never observe partial
//! results. Failures are not isolated: the first failing shard in call order
//! is reported once all calls have returned, and completed writes on other
//! shards stand.

use super::merge;
use super::predicate::FilterPredicate;
use super::registry::ShardDescriptor;
use super::router::{RoutingDecision, ShardRouter};
use crate::backend::{BackendError, BackendResult, ShardBackend};
use crate::config::AverageStrategy;
use crate::error::{Error, Result};
use crate::metrics::ShardingMetrics;
use crate::types::{AggregateKind, MutationResult, Query, Row, RoutingOptions, ShardId, Value};
use futures_util::future::join_all;
use rust_decimal::Decimal;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// Executes operations against the shards a [`ShardRouter`] selects and
/// merges their results per operation kind.
#[derive(Debug)]
pub struct ScatterGather<B: ?Sized> {
    router: Arc<ShardRouter<B>>,
    average: AverageStrategy,
    metrics: Arc<ShardingMetrics>,
}

impl<B: ?Sized> Clone for ScatterGather<B> {
    fn clone(&self) -> Self {
        Self {
            router: Arc::clone(&self.router),
            average: self.average,
            metrics: Arc::clone(&self.metrics),
        }
    }
}

impl<B: ShardBackend + ?Sized> ScatterGather<B> {
    /// Create an executor.
    pub fn new(
        router: Arc<ShardRouter<B>>,
        average: AverageStrategy,
        metrics: Arc<ShardingMetrics>,
    ) -> Self {
        Self {
            router,
            average,
            metrics,
        }
    }

    /// The router this executor targets shards with.
    pub fn router(&self) -> &Arc<ShardRouter<B>> {
        &self.router
    }

    // ===== Reads =====

    /// Every matching row, concatenated in backend-call order.
    pub async fn all(&self, query: &Query, options: &RoutingOptions) -> Result<Vec<Row>> {
        let targets = self.targets(query, options)?;
        let parts = self
            .gather(targets.iter().map(|s| (s.id().clone(), s.backend().read(query))))
            .await?;
        Ok(merge::concat_rows(parts))
    }

    /// Whether any shard holds a matching row.
    pub async fn exists(&self, query: &Query, options: &RoutingOptions) -> Result<bool> {
        let targets = self.targets(query, options)?;
        let parts = self
            .gather(targets.iter().map(|s| (s.id().clone(), s.backend().exists(query))))
            .await?;
        Ok(merge::any(parts))
    }

    /// Number of matching rows across shards.
    pub async fn count(&self, query: &Query, options: &RoutingOptions) -> Result<u64> {
        let parts = self
            .partials(query, AggregateKind::Count, None, options)
            .await?;
        merge::count(&parts)
    }

    /// Exact sum of `field` across shards. Shards with no rows add zero.
    pub async fn sum(&self, query: &Query, field: &str, options: &RoutingOptions) -> Result<Decimal> {
        let parts = self
            .partials(query, AggregateKind::Sum, Some(field), options)
            .await?;
        merge::sum(&parts)
    }

    /// Average of `field`, merged with the configured [`AverageStrategy`].
    pub async fn avg(
        &self,
        query: &Query,
        field: &str,
        options: &RoutingOptions,
    ) -> Result<Option<Decimal>> {
        match self.average {
            AverageStrategy::MeanOfShardAverages => {
                let parts = self
                    .partials(query, AggregateKind::Avg, Some(field), options)
                    .await?;
                merge::mean_of_averages(&parts)
            }
            AverageStrategy::RowWeighted => {
                let targets = self.targets(query, options)?;
                let parts = self
                    .gather(targets.iter().map(|s| {
                        let backend = s.backend();
                        let partial = async move {
                            let sum = backend
                                .aggregate(query, AggregateKind::Sum, Some(field))
                                .await?;
                            let count = backend
                                .aggregate(query, AggregateKind::Count, Some(field))
                                .await?;
                            Ok::<_, BackendError>((sum, count))
                        };
                        (s.id().clone(), partial)
                    }))
                    .await?;
                merge::weighted_average(&parts)
            }
        }
    }

    /// Smallest value of `field` across shards.
    pub async fn min(
        &self,
        query: &Query,
        field: &str,
        options: &RoutingOptions,
    ) -> Result<Option<Value>> {
        let parts = self
            .partials(query, AggregateKind::Min, Some(field), options)
            .await?;
        Ok(merge::extreme(parts, Ordering::Less))
    }

    /// Largest value of `field` across shards.
    pub async fn max(
        &self,
        query: &Query,
        field: &str,
        options: &RoutingOptions,
    ) -> Result<Option<Value>> {
        let parts = self
            .partials(query, AggregateKind::Max, Some(field), options)
            .await?;
        Ok(merge::extreme(parts, Ordering::Greater))
    }

    /// Any aggregate, returned as a [`Value`].
    ///
    /// `field` may only be omitted for `Count`. Counts come back as
    /// `Value::Int`, sums and averages as `Value::Decimal`.
    pub async fn aggregate(
        &self,
        query: &Query,
        kind: AggregateKind,
        field: Option<&str>,
        options: &RoutingOptions,
    ) -> Result<Option<Value>> {
        let field_for = |kind| field.ok_or(Error::MissingField { kind });
        match kind {
            AggregateKind::Count => {
                let parts = self.partials(query, kind, field, options).await?;
                let total = merge::count(&parts)?;
                let total = i64::try_from(total).map_err(|_| Error::AggregateOverflow("count"))?;
                Ok(Some(Value::Int(total)))
            }
            AggregateKind::Sum => {
                let total = self.sum(query, field_for(kind)?, options).await?;
                Ok(Some(Value::Decimal(total)))
            }
            AggregateKind::Avg => Ok(self
                .avg(query, field_for(kind)?, options)
                .await?
                .map(Value::Decimal)),
            AggregateKind::Min => self.min(query, field_for(kind)?, options).await,
            AggregateKind::Max => self.max(query, field_for(kind)?, options).await,
        }
    }

    // ===== Single-result lookups =====

    /// Look up one row by primary key on the shard addressed by
    /// `options.shard_value`.
    pub async fn get(
        &self,
        source: &str,
        id: impl Into<Value>,
        options: &RoutingOptions,
    ) -> Result<Option<Row>> {
        let shard = self.single_target(self.router.route_required(options, "get")?)?;
        let id = id.into();
        let query = Query::new(source);
        self.call(shard.id().clone(), shard.backend().get_one(&query, &id))
            .await
    }

    /// Look up the single row matching `clauses` on the addressed shard.
    pub async fn get_by(
        &self,
        source: &str,
        clauses: Vec<FilterPredicate>,
        options: &RoutingOptions,
    ) -> Result<Option<Row>> {
        let shard_id = self.router.route_required(options, "get_by")?;
        let query = Query {
            source: source.to_string(),
            filters: clauses,
        };
        self.single_row(shard_id, &query).await
    }

    /// The single row matching `query` on the addressed shard.
    pub async fn one(&self, query: &Query, options: &RoutingOptions) -> Result<Option<Row>> {
        let shard_id = self.router.route_required(options, "one")?;
        self.single_row(shard_id, query).await
    }

    // ===== Writes =====

    /// Insert one row on the shard owning it.
    pub async fn insert(&self, source: &str, row: Row, options: &RoutingOptions) -> Result<MutationResult> {
        let shard = self.single_target(self.write_target(&row, options, "insert")?)?;
        self.call(shard.id().clone(), shard.backend().insert(source, row))
            .await
    }

    /// Update one entity on the shard owning it.
    pub async fn update(&self, source: &str, entity: Row, options: &RoutingOptions) -> Result<MutationResult> {
        let shard = self.single_target(self.write_target(&entity, options, "update")?)?;
        self.call(shard.id().clone(), shard.backend().update(source, entity))
            .await
    }

    /// Delete one entity on the shard owning it.
    pub async fn delete(&self, source: &str, entity: Row, options: &RoutingOptions) -> Result<MutationResult> {
        let shard = self.single_target(self.write_target(&entity, options, "delete")?)?;
        self.call(shard.id().clone(), shard.backend().delete(source, entity))
            .await
    }

    /// Grouped insert.
    ///
    /// Rows are partitioned by the shard owning their shard-key field and
    /// each group is written with one batch call. Groups are issued in the
    /// order their shard first appears in `rows`. An explicit shard value
    /// sends every row to that shard.
    pub async fn insert_all(
        &self,
        source: &str,
        rows: Vec<Row>,
        options: &RoutingOptions,
    ) -> Result<MutationResult> {
        if rows.is_empty() {
            return Ok(MutationResult::default());
        }

        let groups = self.partition(rows, options)?;
        tracing::debug!(
            source,
            shards = groups.len(),
            "Grouped insert partitioned rows"
        );

        let decision = if groups.len() == self.router.shards().len() {
            RoutingDecision::AllShards
        } else {
            RoutingDecision::SomeOf(groups.iter().map(|(id, _)| id.clone()).collect())
        };
        self.metrics.record_route(&decision);
        let mut calls = Vec::with_capacity(groups.len());
        for (shard_id, group) in groups {
            let shard = self.router.shards().resolve(&shard_id)?;
            calls.push((shard_id, shard.backend().insert_all(source, group)));
        }

        let parts = self.gather(calls).await?;
        Ok(merge::merge_mutations(parts))
    }

    /// Apply `changes` to every matching row on the routed shards.
    pub async fn update_all(
        &self,
        query: &Query,
        changes: &Row,
        options: &RoutingOptions,
    ) -> Result<MutationResult> {
        let targets = self.targets(query, options)?;
        let parts = self
            .gather(
                targets
                    .iter()
                    .map(|s| (s.id().clone(), s.backend().update_all(query, changes))),
            )
            .await?;
        Ok(merge::merge_mutations(parts))
    }

    /// Delete every matching row on the routed shards.
    pub async fn delete_all(&self, query: &Query, options: &RoutingOptions) -> Result<MutationResult> {
        let targets = self.targets(query, options)?;
        let parts = self
            .gather(targets.iter().map(|s| (s.id().clone(), s.backend().delete_all(query))))
            .await?;
        Ok(merge::merge_mutations(parts))
    }

    // ===== Internals =====

    /// Route a call and resolve the shards it targets.
    fn targets(&self, query: &Query, options: &RoutingOptions) -> Result<Vec<ShardDescriptor<B>>> {
        let decision = self.router.route(query, options)?;
        self.metrics.record_route(&decision);
        self.router.select(&decision)
    }

    fn single_target(&self, shard_id: ShardId) -> Result<ShardDescriptor<B>> {
        let decision = RoutingDecision::ExactlyOne(shard_id);
        self.metrics.record_route(&decision);
        let mut selected = self.router.select(&decision)?;
        selected
            .pop()
            .ok_or_else(|| Error::Internal("single-shard selection was empty".to_string()))
    }

    /// Shard for a single-entity write: explicit value first, then the
    /// entity's shard-key column. Single-entity writes never broadcast.
    fn write_target(&self, row: &Row, options: &RoutingOptions, operation: &'static str) -> Result<ShardId> {
        if options.shard_value.is_some() {
            return self.router.route_required(options, operation);
        }
        let value = self
            .router
            .routing_column(options)
            .and_then(|column| row.key(column))
            .ok_or(Error::MissingRoutingKey { operation })?;
        self.router.shard_for_value(&value)
    }

    /// Partition rows by owning shard, in first-occurrence order.
    fn partition(&self, rows: Vec<Row>, options: &RoutingOptions) -> Result<Vec<(ShardId, Vec<Row>)>> {
        if options.shard_value.is_some() {
            let shard_id = self.router.route_required(options, "insert_all")?;
            return Ok(vec![(shard_id, rows)]);
        }

        let column = self
            .router
            .routing_column(options)
            .ok_or(Error::MissingRoutingKey {
                operation: "insert_all",
            })?;

        let mut groups: Vec<(ShardId, Vec<Row>)> = Vec::new();
        let mut positions: HashMap<ShardId, usize> = HashMap::new();
        for row in rows {
            let value = row.key(column).ok_or_else(|| Error::ShardKeyMissing {
                column: column.to_string(),
            })?;
            let shard_id = self.router.shard_for_value(&value)?;
            match positions.get(&shard_id) {
                Some(&pos) => groups[pos].1.push(row),
                None => {
                    positions.insert(shard_id.clone(), groups.len());
                    groups.push((shard_id, vec![row]));
                }
            }
        }
        Ok(groups)
    }

    async fn partials(
        &self,
        query: &Query,
        kind: AggregateKind,
        field: Option<&str>,
        options: &RoutingOptions,
    ) -> Result<Vec<Option<Value>>> {
        let targets = self.targets(query, options)?;
        self.gather(
            targets
                .iter()
                .map(|s| (s.id().clone(), s.backend().aggregate(query, kind, field))),
        )
        .await
    }

    async fn single_row(&self, shard_id: ShardId, query: &Query) -> Result<Option<Row>> {
        let shard = self.single_target(shard_id)?;
        let mut rows = self
            .call(shard.id().clone(), shard.backend().read(query))
            .await?;
        if rows.len() > 1 {
            return Err(Error::MultipleResults { count: rows.len() });
        }
        Ok(rows.pop())
    }

    /// Issue one backend call.
    async fn call<T, F>(&self, shard: ShardId, call: F) -> Result<T>
    where
        F: Future<Output = BackendResult<T>>,
    {
        self.metrics.record_backend_call(&shard);
        call.await.map_err(|source| self.backend_failure(shard, source))
    }

    /// Issue every call concurrently and wait for all of them.
    ///
    /// Results come back in call order. The first failure in call order
    /// wins; it is only reported after every call has returned.
    async fn gather<T, F>(&self, calls: impl IntoIterator<Item = (ShardId, F)>) -> Result<Vec<T>>
    where
        F: Future<Output = BackendResult<T>>,
    {
        let (shards, futures): (Vec<ShardId>, Vec<F>) = calls.into_iter().unzip();
        for shard in &shards {
            self.metrics.record_backend_call(shard);
        }
        tracing::debug!(?shards, "Scatter");

        let results = join_all(futures).await;

        shards
            .into_iter()
            .zip(results)
            .map(|(shard, result)| result.map_err(|source| self.backend_failure(shard, source)))
            .collect()
    }

    fn backend_failure(&self, shard: ShardId, source: BackendError) -> Error {
        self.metrics.record_backend_error();
        tracing::debug!(shard_id = %shard, error = %source, "Backend call failed");
        Error::backend(shard, source)
    }
}
