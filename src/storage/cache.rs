//! Read-through cache for Merkle node lookups
//!
//! Transactions answer many small single-node reads while the tree writer
//! recomputes changed paths. This module caches those lookups, including
//! negative ones, in a sharded concurrent cache (quick-cache, S3-FIFO
//! eviction) keyed by revision and node position. The path preload pass
//! warms this cache with one bulk read before the writer starts.

use quick_cache::sync::Cache;

use crate::smt::node::NodeId;
use crate::types::Bytes32;

/// Default number of cached node lookups per transaction
pub const DEFAULT_NODE_CACHE_CAPACITY: usize = 16_384;

/// Cache key for node lookups
///
/// Combines the read revision and the encoded node position. Committed
/// history is append-only below the latest revision, so entries never go
/// stale within a transaction.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct CacheKey {
    revision: u64,
    node_key: Vec<u8>,
}

/// Cached revision-qualified node lookups
///
/// The cached value is `Option<Bytes32>`: `Some` for a stored node hash and
/// `None` for a confirmed absence, so repeated misses on empty subtrees
/// also skip the backing store.
pub struct NodeCache {
    cache: Cache<CacheKey, Option<Bytes32>>,
}

impl NodeCache {
    /// Creates a cache holding approximately `capacity` lookups
    pub fn new(capacity: usize) -> Self {
        Self { cache: Cache::new(capacity.max(1)) }
    }

    /// Returns the cached lookup outcome, or `None` on a cache miss
    pub fn get(&self, revision: u64, id: &NodeId) -> Option<Option<Bytes32>> {
        self.cache.get(&CacheKey { revision, node_key: id.storage_key() })
    }

    /// Records a lookup outcome
    pub fn insert(&self, revision: u64, id: &NodeId, hash: Option<Bytes32>) {
        self.cache.insert(CacheKey { revision, node_key: id.storage_key() }, hash);
    }
}
