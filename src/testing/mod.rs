//! Testing utilities for sharded stores.
//!
//! - [`MemoryBackend`]: an in-memory shard backend with a call log,
//!   transactional staging and failure injection
//! - Scenario tests covering routing, fan-out and atomic rounds end to end
//!
//! # Example
//!
//! ```rust,ignore
//! use shardline::testing::MemoryBackend;
//! use shardline::BackendError;
//!
//! let shard = MemoryBackend::new("shard-0");
//! shard.seed("orders", vec![Row::new().with("id", 1).with("tenant_id", 4)]);
//!
//! // Fail the next ordinary call
//! shard.fail_next(BackendError::Unavailable("connection reset".into()));
//!
//! // Fail every write inside a transactional scope
//! shard.fail_transactions_with(BackendError::Conflict("row locked".into()));
//! ```

mod memory_backend;

mod scatter_gather_tests;
mod transaction_tests;

pub use memory_backend::{BackendCall, MemoryBackend};
