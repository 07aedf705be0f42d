//! Error types for shard routing and cross-shard coordination.

use crate::backend::BackendError;
use crate::types::{AggregateKind, ShardId};
use thiserror::Error;

/// Result type alias for shardline operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for routing, scatter-gather and transactions.
#[derive(Error, Debug)]
pub enum Error {
    /// The shard function produced an identifier that is not registered.
    #[error("unknown shard: {0}")]
    UnknownShard(ShardId),

    /// The same identifier was supplied twice in a keyed shard configuration.
    #[error("duplicate shard identifier: {0}")]
    DuplicateShard(ShardId),

    /// An operation that must address exactly one shard was called without
    /// a routing directive.
    #[error("{operation} requires an explicit shard value or route-by column")]
    MissingRoutingKey {
        /// Name of the operation that was rejected.
        operation: &'static str,
    },

    /// A row passed to a grouped insert lacks its shard-key field.
    #[error("row is missing shard key column `{column}`")]
    ShardKeyMissing {
        /// The shard-key column that was expected.
        column: String,
    },

    /// An aggregate other than a row count was requested without a field.
    #[error("{kind} aggregate requires a field")]
    MissingField {
        /// The aggregate that was requested.
        kind: AggregateKind,
    },

    /// A single-result lookup matched more than one row.
    #[error("expected at most one row, got {count}")]
    MultipleResults {
        /// Number of rows returned by the shard.
        count: usize,
    },

    /// A backend call on the non-transactional path failed.
    ///
    /// The backend's own error is carried unchanged. Calls on other shards
    /// that already completed are not compensated.
    #[error("shard {shard} failed: {source}")]
    Backend {
        /// Shard whose backend raised the error.
        shard: ShardId,
        /// The backend's error.
        #[source]
        source: BackendError,
    },

    /// A commit decision was broadcast but some workers could not finalize.
    #[error("commit incomplete on shards {shards:?}")]
    IncompleteCommit {
        /// Shards that did not confirm the commit.
        shards: Vec<ShardId>,
    },

    /// Aggregate arithmetic left the exact decimal range.
    #[error("aggregate overflow while merging {0}")]
    AggregateOverflow(&'static str),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Wrap a backend error with the shard it came from.
    pub fn backend(shard: ShardId, source: BackendError) -> Self {
        Error::Backend { shard, source }
    }

    /// The backend error behind this error, if any.
    pub fn backend_error(&self) -> Option<&BackendError> {
        match self {
            Error::Backend { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::UnknownShard(ShardId::Index(7));
        assert_eq!(err.to_string(), "unknown shard: 7");

        let err = Error::MissingRoutingKey { operation: "get" };
        assert_eq!(
            err.to_string(),
            "get requires an explicit shard value or route-by column"
        );
    }

    #[test]
    fn test_backend_error_is_preserved() {
        let err = Error::backend(
            ShardId::from("eu"),
            BackendError::Unavailable("connection refused".to_string()),
        );

        assert_eq!(
            err.backend_error(),
            Some(&BackendError::Unavailable("connection refused".to_string()))
        );
        assert!(err.to_string().contains("eu"));
    }
}
