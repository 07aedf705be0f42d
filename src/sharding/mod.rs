//! Shard routing, scatter-gather execution and atomic cross-shard rounds.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        ShardedStore                         │
//! │                                                             │
//! │  ┌───────────────────────────────────────────────────────┐  │
//! │  │                     ShardRouter                       │  │
//! │  │  - PredicateExtractor (filter -> shard-key values)    │  │
//! │  │  - ShardFunction      (value -> shard id)             │  │
//! │  │  - ShardMap           (shard id -> backend)           │  │
//! │  └───────────────────────────────────────────────────────┘  │
//! │                │                           │                │
//! │                ▼                           ▼                │
//! │  ┌─────────────────────────┐  ┌─────────────────────────┐   │
//! │  │      ScatterGather      │  │ TransactionCoordinator  │   │
//! │  │  fan-out, barrier,      │  │ one worker per shard,   │   │
//! │  │  per-kind merge         │  │ commit iff all succeed  │   │
//! │  └─────────────────────────┘  └─────────────────────────┘   │
//! │                │                           │                │
//! │                └─────────────┬─────────────┘                │
//! │                ┌─────────────┼─────────────┐                │
//! │                ▼             ▼             ▼                │
//! │           ┌─────────┐   ┌─────────┐   ┌─────────┐           │
//! │           │ Shard 0 │   │ Shard 1 │   │ Shard N │           │
//! │           └─────────┘   └─────────┘   └─────────┘           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Routing
//!
//! A call is routed in this order:
//!
//! 1. An explicit shard value addresses exactly one shard.
//! 2. A route-by column (or the configured default shard key) narrows the
//!    call to the shards owning the values the filter constrains it to.
//! 3. Otherwise the call is broadcast to every shard in registry order.
//!
//! Point lookups and single-entity writes never fan out; they fail with
//! `MissingRoutingKey` when no shard can be determined.
//!
//! # Failure semantics
//!
//! Non-transactional fan-out propagates the first failing shard's error (in
//! call order) after every call has returned. Shards that already applied a
//! write are not compensated. Use [`TransactionCoordinator`] when a
//! multi-shard write must be all-or-nothing.
//!
//! # Example
//!
//! ```rust,ignore
//! use shardline::sharding::{ModuloShardFunction, ShardConfig};
//! use shardline::{Query, RoutingOptions, ShardedStore, ShardingConfig};
//!
//! let store = ShardedStore::builder()
//!     .shards(ShardConfig::ordered(backends))
//!     .shard_function(ModuloShardFunction::new(2))
//!     .config(ShardingConfig::new().with_shard_key("tenant_id"))
//!     .build()?;
//!
//! // Narrowed to the shard owning tenant 7
//! let rows = store
//!     .executor()
//!     .all(&Query::new("orders").eq("tenant_id", 7), &RoutingOptions::new())
//!     .await?;
//! ```

mod executor;
mod merge;
mod predicate;
mod registry;
mod router;
mod shard_function;
mod store;
mod transaction;

pub use executor::ScatterGather;
pub use predicate::{
    matches_all, CompareOp, FilterPredicate, KeyConstraint, PredicateExtractor, PredicateMode,
};
pub use registry::{ShardConfig, ShardDescriptor, ShardMap};
pub use router::{RoutingDecision, ShardRouter};
pub use shard_function::{FnShardFunction, ModuloShardFunction, ShardFunction, DEFAULT_HASH_SEED};
pub use store::{ShardedStore, ShardedStoreBuilder};
pub use transaction::{
    CoordinatorPhase, Decision, DecisionMessage, DeleteMatching, FailureReason, ShardFailure,
    ShardOperation, ShardSuccess, TransactionCoordinator, TransactionOutcome, TransactionSession,
    UpdateMatching, WorkerReport, WorkerState,
};
