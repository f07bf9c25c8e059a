//! Hasher implementations for sparse Merkle tree operations
//!
//! A [`MapHasher`] defines the leaf, interior-node, and empty-subtree hashes
//! of one tree, and through its output size the tree depth. All hashes are
//! domain-separated by tree id so that no digest computed for one map can be
//! replayed against another.

use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::errors::{Error, Result};
use crate::types::{Bytes32, HashStrategy, TreeId};

/// Domain separation tag for leaf hashes
pub const LEAF_DOMAIN_TAG: &[u8] = b"VMAP_LEAF_v0";

/// Domain separation tag for interior node hashes
pub const NODE_DOMAIN_TAG: &[u8] = b"VMAP_NODE_v0";

/// Domain separation tag for empty-subtree hashes
pub const EMPTY_DOMAIN_TAG: &[u8] = b"VMAP_EMPTY_v0";

/// Trait for hash functions used in sparse Merkle tree operations
///
/// Implementations must be deterministic: the root of a tree is a pure
/// function of its leaf multiset, and historical proofs are recomputed from
/// stored nodes at any later time.
pub trait MapHasher: Send + Sync {
    /// Returns the hash output size in bytes
    ///
    /// Leaf indices must have exactly this length; the tree has
    /// `8 * size()` levels below the root.
    fn size(&self) -> usize;

    /// Returns the tree depth in bits
    fn bit_len(&self) -> usize {
        8 * self.size()
    }

    /// Computes the hash for a leaf node
    ///
    /// An empty `value` must hash to the height-0 empty hash, making a leaf
    /// written with an empty value root-identical to an absent leaf.
    fn hash_leaf(&self, tree_id: TreeId, index: &[u8], value: &[u8]) -> Bytes32;

    /// Computes the hash of an empty subtree
    ///
    /// `height` is the number of tree levels below the subtree root; height
    /// 0 is an empty leaf and height `bit_len()` is the whole empty tree.
    /// `index` identifies the subtree position for strategies that need it.
    fn hash_empty(&self, tree_id: TreeId, index: &[u8], height: usize) -> Bytes32;

    /// Computes the hash for an interior node from its two children
    fn hash_children(&self, left: &Bytes32, right: &Bytes32) -> Bytes32;
}

/// Domain-separated SHA-256 hasher
///
/// This is the hasher behind [`HashStrategy::Sha256DomainSeparated`]:
/// 32-byte outputs, a 256-level tree, and empty-subtree hashes that depend
/// only on the tree id and height. Height independence from the index is
/// what lets [`EmptyHashes`] precompute the full ladder once per operation.
#[derive(Clone, Copy, Debug, Default)]
pub struct MapSha256Hasher;

impl MapSha256Hasher {
    fn empty_leaf_hash(&self, tree_id: TreeId) -> Bytes32 {
        let mut hasher = Sha256::new();
        hasher.update(EMPTY_DOMAIN_TAG);
        hasher.update(tree_id.to_be_bytes());
        hasher.finalize().into()
    }
}

impl MapHasher for MapSha256Hasher {
    fn size(&self) -> usize {
        32
    }

    fn hash_leaf(&self, tree_id: TreeId, index: &[u8], value: &[u8]) -> Bytes32 {
        if value.is_empty() {
            return self.hash_empty(tree_id, index, 0);
        }
        let mut hasher = Sha256::new();
        hasher.update(LEAF_DOMAIN_TAG);
        hasher.update(tree_id.to_be_bytes());
        hasher.update(index);
        hasher.update(value);
        hasher.finalize().into()
    }

    fn hash_empty(&self, tree_id: TreeId, _index: &[u8], height: usize) -> Bytes32 {
        let mut hash = self.empty_leaf_hash(tree_id);
        for _ in 0..height {
            hash = self.hash_children(&hash, &hash);
        }
        hash
    }

    fn hash_children(&self, left: &Bytes32, right: &Bytes32) -> Bytes32 {
        let mut hasher = Sha256::new();
        hasher.update(NODE_DOMAIN_TAG);
        hasher.update(left);
        hasher.update(right);
        hasher.finalize().into()
    }
}

/// Resolves a tree's configured hash strategy to a hasher
///
/// Fails with a precondition violation when the strategy has no registered
/// hasher.
pub fn new_map_hasher(strategy: HashStrategy) -> Result<Arc<dyn MapHasher>> {
    match strategy {
        HashStrategy::Sha256DomainSeparated => Ok(Arc::new(MapSha256Hasher)),
        #[allow(unreachable_patterns)]
        other => Err(Error::FailedPrecondition(format!(
            "no hasher registered for strategy {other:?}"
        ))),
    }
}

/// Precomputed empty-subtree hashes for one tree
///
/// One entry per height from 0 (empty leaf) to `bit_len` (empty tree).
/// Built once per operation so proof generation and subtree recomputation
/// substitute missing nodes without rehashing the ladder.
pub struct EmptyHashes {
    by_height: Vec<Bytes32>,
}

impl EmptyHashes {
    /// Builds the ladder for `tree_id` with the given hasher
    pub fn new(hasher: &dyn MapHasher, tree_id: TreeId) -> Self {
        let bit_len = hasher.bit_len();
        let mut by_height = Vec::with_capacity(bit_len + 1);
        by_height.push(hasher.hash_empty(tree_id, &[], 0));
        for height in 1..=bit_len {
            let below = by_height[height - 1];
            by_height.push(hasher.hash_children(&below, &below));
        }
        Self { by_height }
    }

    /// Returns the empty hash for a subtree with `height` levels below it
    pub fn at_height(&self, height: usize) -> Bytes32 {
        self.by_height[height]
    }
}
