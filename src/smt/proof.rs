//! Inclusion proof verification
//!
//! A proof is the ordered vector of sibling hashes that, combined with the
//! leaf hash, reconstructs the root. The same routine verifies presence and
//! absence: an absent or deleted leaf hashes to the empty-leaf hash, and
//! the reconstruction then matches a tree without it.

use crate::errors::{Error, Result};
use crate::hasher::MapHasher;
use crate::smt::node::bit_at;
use crate::types::{Bytes32, TreeId};

/// Verifies an inclusion proof for one leaf against a root hash
///
/// `proof` must contain exactly `bit_len` sibling hashes ordered from the
/// leaf sibling up to the child of the root, as produced by
/// [`crate::smt::SmtReader::batch_inclusion_proof`].
///
/// # Returns
/// `Ok(true)` if the reconstruction matches `root_hash`, `Ok(false)` if it
/// does not, or an error for a structurally invalid proof.
pub fn verify_inclusion_proof(
    hasher: &dyn MapHasher,
    tree_id: TreeId,
    index: &[u8],
    leaf_value: &[u8],
    proof: &[Bytes32],
    root_hash: &[u8],
) -> Result<bool> {
    if index.len() != hasher.size() {
        return Err(Error::InvalidArgument(format!(
            "index has wrong length: got={}, want={}",
            index.len(),
            hasher.size()
        )));
    }
    let bit_len = hasher.bit_len();
    if proof.len() != bit_len {
        return Err(Error::InvalidArgument(format!(
            "proof has wrong length: got={}, want={bit_len}",
            proof.len()
        )));
    }

    let mut hash = hasher.hash_leaf(tree_id, index, leaf_value);
    // proof[0] sits next to the leaf, so walking depths top-down through
    // the vector means walking the tree bottom-up.
    for depth in (1..=bit_len).rev() {
        let sibling = &proof[bit_len - depth];
        hash = if bit_at(index, depth - 1) == 0 {
            hasher.hash_children(&hash, sibling)
        } else {
            hasher.hash_children(sibling, &hash)
        };
    }
    Ok(hash.as_slice() == root_hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::{EmptyHashes, MapSha256Hasher};

    #[test]
    fn test_empty_proof_for_empty_tree() {
        let hasher = MapSha256Hasher;
        let empties = EmptyHashes::new(&hasher, 7);
        let index = [0u8; 32];
        let proof: Vec<Bytes32> =
            (1..=256).rev().map(|depth| empties.at_height(256 - depth)).collect();
        let root = hasher.hash_empty(7, &index, 256);

        let verified = verify_inclusion_proof(&hasher, 7, &index, b"", &proof, &root)
            .expect("verification should succeed");

        assert!(verified);
    }

    #[test]
    fn test_rejects_wrong_proof_length() {
        let hasher = MapSha256Hasher;

        let outcome = verify_inclusion_proof(&hasher, 7, &[0u8; 32], b"", &[], &[0u8; 32]);

        assert!(matches!(outcome, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_rejects_wrong_index_length() {
        let hasher = MapSha256Hasher;

        let outcome =
            verify_inclusion_proof(&hasher, 7, &[0u8; 16], b"", &[[0u8; 32]; 256], &[0u8; 32]);

        assert!(matches!(outcome, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_mismatched_root_fails_cleanly() {
        let hasher = MapSha256Hasher;

        let verified =
            verify_inclusion_proof(&hasher, 7, &[0u8; 32], b"x", &[[0u8; 32]; 256], &[1u8; 32])
                .expect("verification should succeed");

        assert!(!verified);
    }
}
