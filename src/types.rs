//! Core type definitions for the verimap library
//!
//! This module defines the fundamental types shared across the storage
//! gateway, the sparse Merkle tree engine, and the map server.

/// Type alias for 32-byte arrays used across cryptographic operations
pub type Bytes32 = [u8; 32];

/// Identifier of one map instance
pub type TreeId = i64;

/// The hash strategy configured for a tree
///
/// The strategy is recorded on the tree descriptor at creation time and
/// resolved to a [`crate::hasher::MapHasher`] whenever the tree is opened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum HashStrategy {
    /// Domain-separated SHA-256 with 32-byte indices and a 256-level tree
    Sha256DomainSeparated,
}

/// Lifecycle state of a tree
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TreeState {
    /// The tree accepts reads and writes
    Active,
    /// The tree is read-only
    Frozen,
    /// The tree is being retired; reads are served, writes are refused
    Draining,
}

impl std::fmt::Display for TreeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TreeState::Active => write!(f, "active"),
            TreeState::Frozen => write!(f, "frozen"),
            TreeState::Draining => write!(f, "draining"),
        }
    }
}

/// Descriptor of one map instance
///
/// Created by the admin collaborator; the core observes it read-only.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tree {
    /// Tree identifier
    pub tree_id: TreeId,
    /// Hash strategy used for all leaf, interior, and empty-subtree hashes
    pub hash_strategy: HashStrategy,
    /// Current lifecycle state
    pub state: TreeState,
}

/// A key/value record in the map
///
/// `index` is the position of the leaf in the tree, not the plaintext key:
/// callers derive it by hashing their key, so indices are scattered across
/// the full `[0, 2^bit_len)` space and every index has the hasher's size.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MapLeaf {
    /// Position of the leaf; its length must equal the hasher output size
    pub index: Vec<u8>,
    /// The stored value; empty means the leaf is indistinguishable from an
    /// absent one as far as the root hash is concerned
    pub leaf_value: Vec<u8>,
    /// Opaque caller data stored alongside the value
    pub extra_data: Vec<u8>,
    /// Hash of the leaf; absent on input to writes, populated by the core
    /// before storage, and stripped on the no-proof read path
    pub leaf_hash: Option<Bytes32>,
}

/// A leaf together with its inclusion proof
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MapLeafInclusion {
    /// The leaf; empty-valued for indices never written
    pub leaf: MapLeaf,
    /// Sibling hashes ordered from the leaf sibling up to the child of the
    /// root; always exactly `bit_len` entries
    pub inclusion: Vec<Bytes32>,
}

/// The internal update primitive fed to the sparse Merkle tree writer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HashKeyValue {
    /// The leaf index
    pub hashed_key: Bytes32,
    /// The leaf hash stored at that index
    pub hashed_value: Bytes32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tree_state_display() {
        assert_eq!(TreeState::Active.to_string(), "active");
        assert_eq!(TreeState::Frozen.to_string(), "frozen");
        assert_eq!(TreeState::Draining.to_string(), "draining");
    }

    #[test]
    fn test_map_leaf_default() {
        let leaf = MapLeaf::default();

        assert!(leaf.index.is_empty());
        assert!(leaf.leaf_value.is_empty());
        assert!(leaf.extra_data.is_empty());
        assert_eq!(leaf.leaf_hash, None);
    }
}
