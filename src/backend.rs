//! Capability contract consumed from each shard's storage handle.
//!
//! The routing core never stores data itself. Every shard is represented by
//! a handle implementing [`ShardBackend`], and atomic rounds use the
//! backend's native transaction scope through [`ShardTransaction`].

use crate::types::{AggregateKind, MutationResult, Query, Row, Value};
use thiserror::Error;

/// Result type alias for backend calls.
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Errors raised by a shard backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The backend refused the operation (constraint, validation).
    #[error("rejected: {0}")]
    Rejected(String),

    /// The backend could not be reached.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The operation conflicted with concurrent work.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Any other backend failure.
    #[error("{0}")]
    Other(String),
}

/// Operations a shard handle must support.
#[async_trait::async_trait]
pub trait ShardBackend: Send + Sync + std::fmt::Debug {
    /// Return every row matching the query.
    async fn read(&self, query: &Query) -> BackendResult<Vec<Row>>;

    /// Look up a single row by primary key within the query's source.
    async fn get_one(&self, query: &Query, id: &Value) -> BackendResult<Option<Row>>;

    /// Whether any row matches the query.
    async fn exists(&self, query: &Query) -> BackendResult<bool>;

    /// Compute a partial aggregate over matching rows.
    ///
    /// `field` is `None` only for a row count. Returns `None` when the
    /// aggregate is undefined on this shard (for example, `min` over no rows).
    async fn aggregate(
        &self,
        query: &Query,
        kind: AggregateKind,
        field: Option<&str>,
    ) -> BackendResult<Option<Value>>;

    /// Insert one row.
    async fn insert(&self, source: &str, row: Row) -> BackendResult<MutationResult>;

    /// Insert a batch of rows.
    async fn insert_all(&self, source: &str, rows: Vec<Row>) -> BackendResult<MutationResult>;

    /// Update one entity, identified by its primary key.
    async fn update(&self, source: &str, entity: Row) -> BackendResult<MutationResult>;

    /// Delete one entity, identified by its primary key.
    async fn delete(&self, source: &str, entity: Row) -> BackendResult<MutationResult>;

    /// Apply `changes` to every row matching the query.
    async fn update_all(&self, query: &Query, changes: &Row) -> BackendResult<MutationResult>;

    /// Delete every row matching the query.
    async fn delete_all(&self, query: &Query) -> BackendResult<MutationResult>;

    /// Open a local transactional scope.
    async fn begin(&self) -> BackendResult<Box<dyn ShardTransaction>>;
}

/// A shard-local transactional scope.
///
/// Writes made through the scope become durable only on [`commit`]. A call
/// to [`rollback`] is the forced-rollback signal and must discard them even
/// when every operation inside the scope succeeded.
///
/// [`commit`]: ShardTransaction::commit
/// [`rollback`]: ShardTransaction::rollback
#[async_trait::async_trait]
pub trait ShardTransaction: Send {
    async fn read(&mut self, query: &Query) -> BackendResult<Vec<Row>>;

    async fn insert_all(&mut self, source: &str, rows: Vec<Row>) -> BackendResult<MutationResult>;

    async fn update_all(&mut self, query: &Query, changes: &Row) -> BackendResult<MutationResult>;

    async fn delete_all(&mut self, query: &Query) -> BackendResult<MutationResult>;

    /// Complete the scope normally, persisting its writes.
    async fn commit(&mut self) -> BackendResult<()>;

    /// Force the scope to roll back.
    async fn rollback(&mut self) -> BackendResult<()>;
}
