//! Configuration types for shard routing and coordination.

use crate::error::{Error, Result};
use crate::sharding::PredicateMode;
use std::time::Duration;

/// Main configuration, constructed once at startup and held by the
/// [`ShardedStore`](crate::ShardedStore).
#[derive(Debug, Clone, Default)]
pub struct ShardingConfig {
    /// Shard-key column used when a call carries no route-by directive.
    pub shard_key: Option<String>,

    /// How repeated constraints on the shard-key column are combined.
    pub predicate_mode: PredicateMode,

    /// How per-shard averages are merged.
    pub average: AverageStrategy,

    /// Atomic cross-shard round configuration.
    pub transaction: TransactionConfig,
}

impl ShardingConfig {
    /// Create a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default shard-key column.
    pub fn with_shard_key(mut self, column: impl Into<String>) -> Self {
        self.shard_key = Some(column.into());
        self
    }

    /// Set the predicate combination mode.
    pub fn with_predicate_mode(mut self, mode: PredicateMode) -> Self {
        self.predicate_mode = mode;
        self
    }

    /// Set the average merge strategy.
    pub fn with_average_strategy(mut self, average: AverageStrategy) -> Self {
        self.average = average;
        self
    }

    /// Set the transaction configuration.
    pub fn with_transaction_config(mut self, transaction: TransactionConfig) -> Self {
        self.transaction = transaction;
        self
    }

    /// Check the configuration for values that can never work.
    pub fn validate(&self) -> Result<()> {
        if let Some(column) = &self.shard_key {
            if column.is_empty() {
                return Err(Error::Config("shard_key must not be empty".to_string()));
            }
        }
        self.transaction.validate()
    }
}

/// Strategy for merging per-shard averages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AverageStrategy {
    /// Global `sum / count` from per-shard sum and count partials.
    #[default]
    RowWeighted,

    /// Mean of the per-shard averages, ignoring row counts.
    ///
    /// Only exact when every shard holds the same number of rows. Shards
    /// with no rows still count in the divisor.
    MeanOfShardAverages,
}

/// Configuration for atomic cross-shard rounds.
#[derive(Debug, Clone, Default)]
pub struct TransactionConfig {
    /// How long the coordinator waits for all reports before aborting.
    /// `None` waits indefinitely.
    pub decision_timeout: Option<Duration>,

    /// Maximum number of atomic rounds in flight at once.
    /// Workers hold backend locks until the decision arrives.
    pub max_concurrent: Option<usize>,
}

impl TransactionConfig {
    /// Create a configuration with no deadline and no concurrency bound.
    pub fn new() -> Self {
        Self::default()
    }

    /// Abort rounds that have not collected every report within `timeout`.
    pub fn with_decision_timeout(mut self, timeout: Duration) -> Self {
        self.decision_timeout = Some(timeout);
        self
    }

    /// Bound the number of concurrent atomic rounds.
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = Some(max);
        self
    }

    fn validate(&self) -> Result<()> {
        if self.decision_timeout == Some(Duration::ZERO) {
            return Err(Error::Config(
                "decision_timeout must be greater than zero".to_string(),
            ));
        }
        if self.max_concurrent == Some(0) {
            return Err(Error::Config(
                "max_concurrent must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
