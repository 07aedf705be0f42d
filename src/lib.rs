//! Shard routing and cross-shard coordination over pluggable backends.
//!
//! This crate routes data operations across independently addressable
//! partitions ("shards") and coordinates all-or-nothing writes across them:
//! - **Predicate-based routing** narrows a call to the shards its filter can touch
//! - **Scatter-gather** fans a call out and merges per-shard results by kind
//! - **Atomic rounds** commit a multi-shard write everywhere or nowhere
//!
//! Storage is never implemented here. Each shard is a handle implementing
//! [`ShardBackend`]; the crate only decides where calls go and how their
//! results combine.
//!
//! # Example
//!
//! ```rust,no_run
//! use shardline::sharding::{ModuloShardFunction, ShardConfig, UpdateMatching};
//! use shardline::testing::MemoryBackend;
//! use shardline::{Query, Row, RoutingOptions, ShardedStore, ShardingConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let backends: Vec<_> = (0..2)
//!         .map(|i| Arc::new(MemoryBackend::new(format!("shard-{}", i))))
//!         .collect();
//!
//!     let store = ShardedStore::builder()
//!         .shards(ShardConfig::ordered(backends))
//!         .shard_function(ModuloShardFunction::new(2))
//!         .config(ShardingConfig::new().with_shard_key("tenant_id"))
//!         .build()?;
//!
//!     // Grouped insert: one batch call per owning shard
//!     let rows = (1..=4)
//!         .map(|t| Row::new().with("id", t).with("tenant_id", t))
//!         .collect();
//!     store.executor().insert_all("orders", rows, &RoutingOptions::new()).await?;
//!
//!     // Routed read: only the shard owning tenant 3 is called
//!     let query = Query::new("orders").eq("tenant_id", 3);
//!     let found = store.executor().all(&query, &RoutingOptions::new()).await?;
//!     println!("found {} rows", found.len());
//!
//!     // Atomic write across every shard
//!     let op = UpdateMatching {
//!         query: Query::new("orders"),
//!         changes: Row::new().with("status", "archived"),
//!     };
//!     let outcome = store
//!         .transaction(&Query::new("orders"), &RoutingOptions::new(), op)
//!         .await?;
//!     println!("committed: {}", outcome.is_committed());
//!
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │            Application Layer                │
//! └─────────────────────────────────────────────┘
//!                     │
//!                     ▼
//! ┌─────────────────────────────────────────────┐
//! │              ShardedStore API               │
//! │  • executor().all / count / insert_all ...  │
//! │  • transaction(query, options, op)          │
//! └─────────────────────────────────────────────┘
//!                     │
//!     ┌───────────────┼───────────────┐
//!     ▼               ▼               ▼
//! ┌─────────┐   ┌───────────┐   ┌───────────┐
//! │ Router  │   │  Scatter  │   │Transaction│
//! │         │   │  Gather   │   │Coordinator│
//! └─────────┘   └───────────┘   └───────────┘
//! ```
//!
//! # Consistency Model
//!
//! - **Ordinary fan-out**: no cross-shard isolation or ordering; a failing
//!   shard fails the call without compensating shards that succeeded
//! - **Atomic rounds**: commit iff every participant succeeded locally;
//!   participants hold their local scope open until the decision arrives
//! - **Timeouts**: none by default; `decision_timeout` turns a stalled
//!   round into an abort

pub mod backend;
pub mod config;
pub mod error;
pub mod metrics;
pub mod sharding;
pub mod testing;
pub mod types;

// Re-export main types for convenience
pub use backend::{BackendError, BackendResult, ShardBackend, ShardTransaction};
pub use config::{AverageStrategy, ShardingConfig, TransactionConfig};
pub use error::{Error, Result};
pub use types::{
    AggregateKind, KeyValue, MutationResult, Query, Row, RoutingOptions, ShardId, Value,
};

// Re-export sharding types
pub use sharding::{
    FilterPredicate, PredicateMode, RoutingDecision, ScatterGather, ShardConfig, ShardFunction,
    ShardOperation, ShardRouter, ShardedStore, ShardedStoreBuilder, TransactionCoordinator,
    TransactionOutcome,
};

// Re-export metrics types
pub use metrics::{MetricsSnapshot, ShardingMetrics};
