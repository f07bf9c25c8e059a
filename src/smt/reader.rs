//! Batched inclusion-proof generation
//!
//! The reader produces proofs for a batch of indices against one revision
//! by fetching the minimal set of sibling nodes: sibling ids are unioned
//! and deduplicated across the batch before a single storage read, so
//! overlapping upper prefixes are fetched once no matter how many requested
//! paths share them.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::context::OpContext;
use crate::errors::Result;
use crate::hasher::{EmptyHashes, MapHasher};
use crate::smt::node::NodeId;
use crate::storage::MapSnapshot;
use crate::types::{Bytes32, TreeId};

/// Inclusion-proof generator for one tree
pub struct SmtReader<'h> {
    hasher: &'h dyn MapHasher,
    empties: EmptyHashes,
}

impl<'h> SmtReader<'h> {
    /// Creates a reader for `tree_id`
    pub fn new(tree_id: TreeId, hasher: &'h dyn MapHasher) -> Self {
        let empties = EmptyHashes::new(hasher, tree_id);
        Self { hasher, empties }
    }

    /// Produces inclusion proofs for every index in the batch at `revision`
    ///
    /// Each proof has exactly `bit_len` sibling hashes ordered from the
    /// leaf sibling up to the child of the root; interior nodes absent from
    /// storage are substituted with the empty-subtree hash for their depth.
    /// Proofs for indices with no stored leaf are well defined and prove
    /// absence.
    pub fn batch_inclusion_proof(
        &self,
        ctx: &OpContext,
        tx: &dyn MapSnapshot,
        revision: u64,
        indices: &[Bytes32],
    ) -> Result<BTreeMap<Bytes32, Vec<Bytes32>>> {
        ctx.check()?;
        let bit_len = self.hasher.bit_len();

        let mut wanted = BTreeSet::new();
        for index in indices {
            for depth in 1..=bit_len {
                if let Some(sibling) = NodeId::from_index(index, depth).sibling() {
                    wanted.insert(sibling);
                }
            }
        }
        let ids: Vec<NodeId> = wanted.into_iter().collect();

        let nodes = tx.get_merkle_nodes(revision, &ids)?;
        let hashes: HashMap<NodeId, Bytes32> =
            nodes.into_iter().map(|node| (node.id, node.hash)).collect();
        ctx.check()?;

        let mut proofs = BTreeMap::new();
        for index in indices {
            let mut path = Vec::with_capacity(bit_len);
            for depth in (1..=bit_len).rev() {
                let hash = NodeId::from_index(index, depth)
                    .sibling()
                    .and_then(|sibling| hashes.get(&sibling).copied())
                    .unwrap_or_else(|| self.empties.at_height(bit_len - depth));
                path.push(hash);
            }
            proofs.insert(*index, path);
        }
        Ok(proofs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::MapSha256Hasher;
    use crate::smt::node::Node;
    use crate::smt::proof::verify_inclusion_proof;
    use crate::storage::{InMemoryMapStorage, MapStorage, MapTransaction};
    use crate::types::{HashStrategy, Tree, TreeState};

    fn test_tree() -> Tree {
        Tree { tree_id: 7, hash_strategy: HashStrategy::Sha256DomainSeparated, state: TreeState::Active }
    }

    #[test]
    fn test_proofs_for_empty_tree_prove_absence() {
        let storage = InMemoryMapStorage::new();
        let tree = test_tree();
        let hasher = MapSha256Hasher;
        let reader = SmtReader::new(tree.tree_id, &hasher);
        let snapshot = storage.snapshot(&tree).expect("snapshot should open");
        let index = [5u8; 32];

        let proofs = reader
            .batch_inclusion_proof(&OpContext::background(), &*snapshot, 0, &[index])
            .expect("proof generation should succeed");

        let path = proofs.get(&index).expect("proof should exist");
        assert_eq!(path.len(), 256);
        let empty_root = hasher.hash_empty(tree.tree_id, &index, 256);
        let verified =
            verify_inclusion_proof(&hasher, tree.tree_id, &index, b"", path, &empty_root)
                .expect("verification should succeed");
        assert!(verified);
    }

    #[test]
    fn test_batch_shares_sibling_fetches() {
        let hasher = MapSha256Hasher;
        let reader = SmtReader::new(7, &hasher);
        let mut left = [0u8; 32];
        left[31] = 1;
        let right = [0u8; 32];

        // Two indices differing only in the final bit share every upper
        // sibling, so their proofs agree except at the leaf level.
        let storage = InMemoryMapStorage::new();
        let tree = test_tree();
        let mut tx = storage.begin(&tree).expect("begin should succeed");
        tx.set_merkle_nodes(
            0,
            vec![Node { id: NodeId::from_index(&left, 256), hash: [3u8; 32] }],
        )
        .expect("set nodes should succeed");
        tx.commit().expect("commit should succeed");

        let snapshot = storage.snapshot(&tree).expect("snapshot should open");
        let proofs = reader
            .batch_inclusion_proof(&OpContext::background(), &*snapshot, 0, &[left, right])
            .expect("proof generation should succeed");

        let left_path = proofs.get(&left).expect("proof should exist");
        let right_path = proofs.get(&right).expect("proof should exist");
        assert_eq!(left_path[1..], right_path[1..]);
        assert_ne!(left_path[0], right_path[0]);
    }

    #[test]
    fn test_cancelled_context_aborts() {
        let storage = InMemoryMapStorage::new();
        let tree = test_tree();
        let hasher = MapSha256Hasher;
        let reader = SmtReader::new(tree.tree_id, &hasher);
        let snapshot = storage.snapshot(&tree).expect("snapshot should open");
        let ctx = OpContext::background();
        ctx.cancel();

        let outcome = reader.batch_inclusion_proof(&ctx, &*snapshot, 0, &[[0u8; 32]]);

        assert!(outcome.is_err());
    }
}
