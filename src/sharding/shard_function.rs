//! Shard functions: pure mappings from a shard-key value to a shard id.

use crate::types::{KeyValue, ShardId};
use std::fmt;
use std::hash::Hasher;
use twox_hash::XxHash64;

/// Default seed for hashing opaque keys.
pub const DEFAULT_HASH_SEED: u64 = 0x5AFE_CAFE_DEAD_BEEF;

/// Maps a shard-key value to the identifier of the shard owning it.
///
/// Implementations must be pure and total. The produced identifier is
/// checked against the registry by the router; an absent identifier is
/// reported as `UnknownShard`.
pub trait ShardFunction: Send + Sync + fmt::Debug {
    fn shard_for(&self, value: &KeyValue) -> ShardId;
}

/// `value mod n` for integers, seeded XxHash64 `mod n` for byte keys.
///
/// Produces `ShardId::Index` identifiers, matching an ordered shard
/// configuration of `n` backends.
#[derive(Debug, Clone)]
pub struct ModuloShardFunction {
    num_shards: u32,
    hash_seed: u64,
}

impl ModuloShardFunction {
    /// Create a modulo function over `num_shards` shards.
    pub fn new(num_shards: u32) -> Self {
        Self {
            num_shards: num_shards.max(1),
            hash_seed: DEFAULT_HASH_SEED,
        }
    }

    /// Set the hash seed used for byte keys.
    pub fn with_hash_seed(mut self, seed: u64) -> Self {
        self.hash_seed = seed;
        self
    }

    /// Number of shards this function spreads keys across.
    pub fn num_shards(&self) -> u32 {
        self.num_shards
    }

    /// Hash an opaque key.
    pub fn hash_bytes(&self, key: &[u8]) -> u64 {
        let mut hasher = XxHash64::with_seed(self.hash_seed);
        hasher.write(key);
        hasher.finish()
    }
}

impl ShardFunction for ModuloShardFunction {
    fn shard_for(&self, value: &KeyValue) -> ShardId {
        let idx = match value {
            KeyValue::Int(v) => v.rem_euclid(self.num_shards as i64) as u32,
            KeyValue::Bytes(b) => (self.hash_bytes(b) % self.num_shards as u64) as u32,
        };
        ShardId::Index(idx)
    }
}

/// Adapts a closure into a [`ShardFunction`].
pub struct FnShardFunction<F> {
    name: &'static str,
    f: F,
}

impl<F> FnShardFunction<F>
where
    F: Fn(&KeyValue) -> ShardId + Send + Sync,
{
    /// Wrap a closure. `name` only appears in debug output.
    pub fn new(name: &'static str, f: F) -> Self {
        Self { name, f }
    }
}

impl<F> fmt::Debug for FnShardFunction<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnShardFunction")
            .field("name", &self.name)
            .finish()
    }
}

impl<F> ShardFunction for FnShardFunction<F>
where
    F: Fn(&KeyValue) -> ShardId + Send + Sync,
{
    fn shard_for(&self, value: &KeyValue) -> ShardId {
        (self.f)(value)
    }
}
