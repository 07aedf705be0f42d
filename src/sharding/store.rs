//! Facade owning the registry, router, executor and coordinator.

use super::executor::ScatterGather;
use super::predicate::PredicateExtractor;
use super::registry::{ShardConfig, ShardMap};
use super::router::{RoutingDecision, ShardRouter};
use super::shard_function::ShardFunction;
use super::transaction::{ShardOperation, TransactionCoordinator, TransactionOutcome};
use crate::backend::ShardBackend;
use crate::config::ShardingConfig;
use crate::error::{Error, Result};
use crate::metrics::ShardingMetrics;
use crate::types::{Query, RoutingOptions, ShardId};
use std::sync::Arc;

/// A sharded store: configured once at startup, then shared.
#[derive(Debug)]
pub struct ShardedStore<B: ?Sized> {
    config: ShardingConfig,
    router: Arc<ShardRouter<B>>,
    executor: ScatterGather<B>,
    coordinator: TransactionCoordinator,
    metrics: Arc<ShardingMetrics>,
}

impl<B: ShardBackend + ?Sized + 'static> ShardedStore<B> {
    /// Start building a store.
    pub fn builder() -> ShardedStoreBuilder<B> {
        ShardedStoreBuilder::new()
    }

    /// The router.
    pub fn router(&self) -> &Arc<ShardRouter<B>> {
        &self.router
    }

    /// The scatter-gather executor for ordinary reads and writes.
    pub fn executor(&self) -> &ScatterGather<B> {
        &self.executor
    }

    /// The atomic round coordinator.
    pub fn coordinator(&self) -> &TransactionCoordinator {
        &self.coordinator
    }

    /// Shared metrics.
    pub fn metrics(&self) -> &Arc<ShardingMetrics> {
        &self.metrics
    }

    /// The configuration the store was built with.
    pub fn config(&self) -> &ShardingConfig {
        &self.config
    }

    /// Apply `op` atomically on the shards `query` routes to.
    pub async fn transaction<O>(
        &self,
        query: &Query,
        options: &RoutingOptions,
        op: O,
    ) -> Result<TransactionOutcome<O::Output>>
    where
        O: ShardOperation + 'static,
    {
        let decision = self.router.route(query, options)?;
        let participants = self.router.select(&decision)?;
        self.coordinator.run(participants, Arc::new(op)).await
    }

    /// Apply `op` atomically on an explicit set of shards.
    ///
    /// Duplicates are dropped keeping the first occurrence.
    pub async fn transaction_on<O>(
        &self,
        shards: &[ShardId],
        op: O,
    ) -> Result<TransactionOutcome<O::Output>>
    where
        O: ShardOperation + 'static,
    {
        let decision = RoutingDecision::SomeOf(shards.to_vec());
        let participants = self.router.select(&decision)?;
        self.coordinator.run(participants, Arc::new(op)).await
    }
}

/// Builder for [`ShardedStore`].
pub struct ShardedStoreBuilder<B: ?Sized> {
    shards: Option<ShardConfig<B>>,
    function: Option<Arc<dyn ShardFunction>>,
    config: ShardingConfig,
    metrics: Option<Arc<ShardingMetrics>>,
}

impl<B: ShardBackend + ?Sized + 'static> ShardedStoreBuilder<B> {
    /// Create a builder with default configuration.
    pub fn new() -> Self {
        Self {
            shards: None,
            function: None,
            config: ShardingConfig::default(),
            metrics: None,
        }
    }

    /// Set the shard configuration.
    pub fn shards(mut self, shards: ShardConfig<B>) -> Self {
        self.shards = Some(shards);
        self
    }

    /// Set the shard function.
    pub fn shard_function(mut self, function: impl ShardFunction + 'static) -> Self {
        self.function = Some(Arc::new(function));
        self
    }

    /// Set the configuration.
    pub fn config(mut self, config: ShardingConfig) -> Self {
        self.config = config;
        self
    }

    /// Share an existing metrics instance.
    pub fn metrics(mut self, metrics: Arc<ShardingMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build the store.
    pub fn build(self) -> Result<ShardedStore<B>> {
        self.config.validate()?;
        let shards = self
            .shards
            .ok_or_else(|| Error::Config("shards not configured".to_string()))?;
        let function = self
            .function
            .ok_or_else(|| Error::Config("shard function not configured".to_string()))?;

        let map = Arc::new(ShardMap::build(shards)?);
        let metrics = self.metrics.unwrap_or_default();

        tracing::info!(
            shards = map.len(),
            shard_key = ?self.config.shard_key,
            predicate_mode = ?self.config.predicate_mode,
            "Sharded store configured"
        );

        let router = Arc::new(ShardRouter::new(
            map,
            function,
            PredicateExtractor::new(self.config.predicate_mode),
            self.config.shard_key.clone(),
        ));
        let executor = ScatterGather::new(
            Arc::clone(&router),
            self.config.average,
            Arc::clone(&metrics),
        );
        let coordinator =
            TransactionCoordinator::new(self.config.transaction.clone(), Arc::clone(&metrics));

        Ok(ShardedStore {
            config: self.config,
            router,
            executor,
            coordinator,
            metrics,
        })
    }
}

impl<B: ShardBackend + ?Sized + 'static> Default for ShardedStoreBuilder<B> {
    fn default() -> Self {
        Self::new()
    }
}
