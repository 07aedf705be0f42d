//! Immutable shard registry.
//!
//! Maps shard identifiers to backend handles. Built once at startup and
//! never mutated afterwards, so it can be shared freely behind an `Arc`.

use crate::error::{Error, Result};
use crate::types::ShardId;
use std::collections::HashMap;
use std::sync::Arc;

/// Shard configuration supplied at startup.
#[derive(Debug)]
pub enum ShardConfig<B: ?Sized> {
    /// Backends in order; identifiers are assigned `0..n-1`.
    Ordered(Vec<Arc<B>>),
    /// Explicit identifier for each backend, in construction order.
    Keyed(Vec<(ShardId, Arc<B>)>),
}

impl<B: ?Sized> ShardConfig<B> {
    /// Ordered configuration from any sequence of handles.
    pub fn ordered(backends: impl IntoIterator<Item = Arc<B>>) -> Self {
        ShardConfig::Ordered(backends.into_iter().collect())
    }

    /// Keyed configuration from `(identifier, handle)` pairs.
    pub fn keyed<I: Into<ShardId>>(entries: impl IntoIterator<Item = (I, Arc<B>)>) -> Self {
        ShardConfig::Keyed(
            entries
                .into_iter()
                .map(|(id, backend)| (id.into(), backend))
                .collect(),
        )
    }
}

/// A shard identifier bound to its backend handle.
#[derive(Debug)]
pub struct ShardDescriptor<B: ?Sized> {
    id: ShardId,
    backend: Arc<B>,
}

impl<B: ?Sized> ShardDescriptor<B> {
    /// Create a descriptor.
    pub fn new(id: ShardId, backend: Arc<B>) -> Self {
        Self { id, backend }
    }

    /// The shard identifier.
    pub fn id(&self) -> &ShardId {
        &self.id
    }

    /// The backend handle.
    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }
}

impl<B: ?Sized> Clone for ShardDescriptor<B> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            backend: Arc::clone(&self.backend),
        }
    }
}

/// Registry of every configured shard.
#[derive(Debug)]
pub struct ShardMap<B: ?Sized> {
    /// Descriptors in construction order.
    shards: Vec<ShardDescriptor<B>>,
    /// Identifier to position in `shards`.
    index: HashMap<ShardId, usize>,
}

impl<B: ?Sized> ShardMap<B> {
    /// Build the registry from its configuration.
    ///
    /// Fails with `DuplicateShard` if a keyed configuration repeats an
    /// identifier.
    pub fn build(config: ShardConfig<B>) -> Result<Self> {
        let entries: Vec<(ShardId, Arc<B>)> = match config {
            ShardConfig::Ordered(backends) => backends
                .into_iter()
                .enumerate()
                .map(|(idx, backend)| (ShardId::Index(idx as u32), backend))
                .collect(),
            ShardConfig::Keyed(entries) => entries,
        };

        let mut shards = Vec::with_capacity(entries.len());
        let mut index = HashMap::with_capacity(entries.len());

        for (id, backend) in entries {
            if index.contains_key(&id) {
                return Err(Error::DuplicateShard(id));
            }
            index.insert(id.clone(), shards.len());
            shards.push(ShardDescriptor::new(id, backend));
        }

        tracing::debug!(shards = shards.len(), "Shard map built");

        Ok(Self { shards, index })
    }

    /// Look up a shard by identifier.
    pub fn resolve(&self, id: &ShardId) -> Result<&ShardDescriptor<B>> {
        self.index
            .get(id)
            .map(|&pos| &self.shards[pos])
            .ok_or_else(|| Error::UnknownShard(id.clone()))
    }

    /// Whether an identifier is registered.
    pub fn contains(&self, id: &ShardId) -> bool {
        self.index.contains_key(id)
    }

    /// All shards, in construction order.
    pub fn all(&self) -> &[ShardDescriptor<B>] {
        &self.shards
    }

    /// All identifiers, in construction order.
    pub fn ids(&self) -> Vec<ShardId> {
        self.shards.iter().map(|s| s.id.clone()).collect()
    }

    /// Number of shards.
    pub fn len(&self) -> usize {
        self.shards.len()
    }

    /// Whether the registry holds no shards.
    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }
}
