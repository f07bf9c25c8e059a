//! Sparse Merkle tree revision updates
//!
//! The writer takes a batch of `(index, leaf hash)` pairs and a target
//! revision, recomputes the affected interior nodes bottom-up, and yields
//! the new root. Work is grouped by leading index bits into independent
//! subtree units; each unit executes through the [`TxRunner`], so the
//! single-transaction runner serializes units on one session while the
//! multi-transaction runner lets them commit in parallel.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;

use crate::context::OpContext;
use crate::errors::{Error, Result};
use crate::hasher::{EmptyHashes, MapHasher};
use crate::smt::node::{Node, NodeId};
use crate::smt::runner::{job_panic_error, TxRunner};
use crate::storage::MapTransaction;
use crate::types::{Bytes32, HashKeyValue, TreeId};

/// Number of leading index bits that bound one work unit
///
/// Units cover disjoint subtrees below depth 8, so any node deeper than the
/// boundary is recomputed by exactly one unit; the depths above it are
/// joined in a final combine step.
const UNIT_PREFIX_BITS: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WriterState {
    Fresh,
    Staged,
    Finalized,
    Aborted,
}

/// Revision updater for one tree
///
/// A writer moves `Fresh → Staged → Finalized`; any failure parks it in
/// `Aborted`. Only a finalized writer's root may be signed and stored, and
/// the enclosing transaction must not commit after an abort.
pub struct SmtWriter {
    write_revision: u64,
    hasher: Arc<dyn MapHasher>,
    empties: EmptyHashes,
    state: WriterState,
    pending: BTreeMap<Bytes32, Bytes32>,
}

impl SmtWriter {
    /// Creates a writer that persists updated nodes at `write_revision`
    pub fn new(tree_id: TreeId, write_revision: u64, hasher: Arc<dyn MapHasher>) -> Self {
        let empties = EmptyHashes::new(hasher.as_ref(), tree_id);
        Self {
            write_revision,
            hasher,
            empties,
            state: WriterState::Fresh,
            pending: BTreeMap::new(),
        }
    }

    /// Stages the update batch
    ///
    /// May be called once, on a fresh writer; an empty batch is valid and
    /// leaves the root unchanged.
    pub fn set_leaves(&mut self, leaves: &[HashKeyValue]) -> Result<()> {
        if self.state != WriterState::Fresh {
            let state = self.state;
            self.state = WriterState::Aborted;
            return Err(Error::FailedPrecondition(format!(
                "leaves can only be staged once per writer (state: {state:?})"
            )));
        }
        for leaf in leaves {
            self.pending.insert(leaf.hashed_key, leaf.hashed_value);
        }
        self.state = WriterState::Staged;
        Ok(())
    }

    /// Recomputes and persists every affected interior node, returning the
    /// new root hash
    ///
    /// Output is deterministic in the staged multiset: unit scheduling
    /// never changes the root. Any storage or hashing failure aborts the
    /// writer.
    pub fn calculate_root(&mut self, ctx: &OpContext, runner: &dyn TxRunner) -> Result<Bytes32> {
        if self.state != WriterState::Staged {
            let state = self.state;
            self.state = WriterState::Aborted;
            return Err(Error::FailedPrecondition(format!(
                "no staged batch to calculate from (state: {state:?})"
            )));
        }
        let result = self.calculate_root_inner(ctx, runner);
        self.state = if result.is_ok() { WriterState::Finalized } else { WriterState::Aborted };
        result
    }

    fn calculate_root_inner(&mut self, ctx: &OpContext, runner: &dyn TxRunner) -> Result<Bytes32> {
        ctx.check()?;
        let pending = std::mem::take(&mut self.pending);
        let bit_len = self.hasher.bit_len();
        let read_revision = self.write_revision.saturating_sub(1);
        let write_revision = self.write_revision;
        let hasher = self.hasher.as_ref();
        let empties = &self.empties;

        if pending.is_empty() {
            let mut root = None;
            runner.run(&mut |tx| {
                root = Some(stored_or_empty_root(tx, read_revision, bit_len, empties)?);
                Ok(())
            })?;
            return root
                .ok_or_else(|| Error::Internal("transaction runner skipped the root read".to_string()));
        }

        let mut units: BTreeMap<u8, BTreeMap<NodeId, Bytes32>> = BTreeMap::new();
        for (index, leaf_hash) in pending {
            units
                .entry(index[0])
                .or_default()
                .insert(NodeId::from_index(&index, bit_len), leaf_hash);
        }

        let mut boundaries: BTreeMap<NodeId, Bytes32> = BTreeMap::new();
        let mut first_error: Option<Error> = None;
        thread::scope(|scope| {
            let mut handles = Vec::with_capacity(units.len());
            for (top_byte, unit) in units {
                handles.push(scope.spawn(move || -> Result<(NodeId, Bytes32)> {
                    ctx.check()?;
                    run_unit(
                        top_byte,
                        unit,
                        read_revision,
                        write_revision,
                        bit_len,
                        hasher,
                        empties,
                        runner,
                    )
                }));
            }
            for handle in handles {
                match handle.join() {
                    Ok(Ok((id, hash))) => {
                        boundaries.insert(id, hash);
                    }
                    Ok(Err(e)) => {
                        if first_error.is_none() {
                            first_error = Some(e);
                        }
                    }
                    Err(_) => {
                        if first_error.is_none() {
                            first_error = Some(job_panic_error());
                        }
                    }
                }
            }
        });
        if let Some(e) = first_error {
            return Err(e);
        }
        ctx.check()?;

        let mut root = None;
        runner.run(&mut |tx| {
            let computed = propagate(
                &boundaries,
                UNIT_PREFIX_BITS,
                0,
                read_revision,
                write_revision,
                false,
                bit_len,
                hasher,
                empties,
                tx,
            )?;
            root = computed.get(&NodeId::root()).copied();
            Ok(())
        })?;
        root.ok_or_else(|| Error::Internal("root hash missing after combining work units".to_string()))
    }
}

fn stored_or_empty_root(
    tx: &mut dyn MapTransaction,
    read_revision: u64,
    bit_len: usize,
    empties: &EmptyHashes,
) -> Result<Bytes32> {
    Ok(match tx.get_merkle_nodes(read_revision, &[NodeId::root()])?.pop() {
        Some(node) => node.hash,
        None => empties.at_height(bit_len),
    })
}

#[allow(clippy::too_many_arguments)]
fn run_unit(
    top_byte: u8,
    unit: BTreeMap<NodeId, Bytes32>,
    read_revision: u64,
    write_revision: u64,
    bit_len: usize,
    hasher: &dyn MapHasher,
    empties: &EmptyHashes,
    runner: &dyn TxRunner,
) -> Result<(NodeId, Bytes32)> {
    let boundary_id = NodeId::from_index(&[top_byte], UNIT_PREFIX_BITS);
    let mut boundary_hash: Option<Bytes32> = None;
    runner.run(&mut |tx| {
        let computed = propagate(
            &unit,
            bit_len,
            UNIT_PREFIX_BITS,
            read_revision,
            write_revision,
            true,
            bit_len,
            hasher,
            empties,
            tx,
        )?;
        boundary_hash = computed.get(&boundary_id).copied();
        Ok(())
    })?;
    boundary_hash
        .map(|hash| (boundary_id, hash))
        .ok_or_else(|| Error::Internal("transaction runner skipped a work unit".to_string()))
}

/// Recomputes the ancestors of `seeds` from `from_depth` up to `to_depth`
///
/// All seeds sit at `from_depth`. For every level, each changed node is
/// composed from its recomputed child and a sibling resolved in order from
/// the recomputed set, then storage at the read revision, then the
/// empty-subtree hash. Every recomputed node (and, when `write_seeds` is
/// set, the seeds themselves) is persisted at the write revision; seeds are
/// persisted by units because leaf-level nodes are other paths' siblings.
#[allow(clippy::too_many_arguments)]
fn propagate(
    seeds: &BTreeMap<NodeId, Bytes32>,
    from_depth: usize,
    to_depth: usize,
    read_revision: u64,
    write_revision: u64,
    write_seeds: bool,
    bit_len: usize,
    hasher: &dyn MapHasher,
    empties: &EmptyHashes,
    tx: &mut dyn MapTransaction,
) -> Result<BTreeMap<NodeId, Bytes32>> {
    let mut computed = seeds.clone();
    for depth in (to_depth..from_depth).rev() {
        let mut parents: BTreeMap<NodeId, (Bytes32, Bytes32)> = BTreeMap::new();
        for seed in seeds.keys() {
            let parent = seed.ancestor(depth);
            if parents.contains_key(&parent) {
                continue;
            }
            let child = seed.ancestor(depth + 1);
            let child_hash = *computed.get(&child).ok_or_else(|| {
                Error::Internal(format!("missing recomputed child at depth {}", depth + 1))
            })?;
            let sibling = child
                .sibling()
                .ok_or_else(|| Error::Internal("node below the root has no sibling".to_string()))?;
            let sibling_hash = match computed.get(&sibling) {
                Some(hash) => *hash,
                None => match tx
                    .get_merkle_nodes(read_revision, std::slice::from_ref(&sibling))?
                    .pop()
                {
                    Some(node) => node.hash,
                    None => empties.at_height(bit_len - depth - 1),
                },
            };
            let (left, right) = if child.bit(depth) == 0 {
                (child_hash, sibling_hash)
            } else {
                (sibling_hash, child_hash)
            };
            parents.insert(parent, (left, right));
        }
        for (id, (left, right)) in parents {
            computed.insert(id, hasher.hash_children(&left, &right));
        }
    }
    let nodes: Vec<Node> = computed
        .iter()
        .filter(|(id, _)| write_seeds || id.depth() < from_depth)
        .map(|(id, hash)| Node { id: id.clone(), hash: *hash })
        .collect();
    tx.set_merkle_nodes(write_revision, nodes)?;
    Ok(computed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::MapSha256Hasher;
    use crate::smt::node::bit_at;
    use crate::smt::proof::verify_inclusion_proof;
    use crate::smt::reader::SmtReader;
    use crate::smt::runner::{MultiTxRunner, SingleTxRunner};
    use crate::storage::{InMemoryMapStorage, MapStorage, MapTransaction};
    use crate::types::{HashStrategy, Tree, TreeState};

    fn test_tree() -> Tree {
        Tree { tree_id: 7, hash_strategy: HashStrategy::Sha256DomainSeparated, state: TreeState::Active }
    }

    fn leaf_update(hasher: &MapSha256Hasher, index: Bytes32, value: &[u8]) -> HashKeyValue {
        HashKeyValue { hashed_key: index, hashed_value: hasher.hash_leaf(7, &index, value) }
    }

    /// Folds a single leaf hash to the root assuming every sibling is empty
    fn lone_leaf_root(hasher: &MapSha256Hasher, index: &Bytes32, leaf_hash: Bytes32) -> Bytes32 {
        let empties = EmptyHashes::new(hasher, 7);
        let mut hash = leaf_hash;
        for depth in (1..=256).rev() {
            let sibling = empties.at_height(256 - depth);
            hash = if bit_at(index, depth - 1) == 0 {
                hasher.hash_children(&hash, &sibling)
            } else {
                hasher.hash_children(&sibling, &hash)
            };
        }
        hash
    }

    fn write_batch_single(storage: &InMemoryMapStorage, updates: &[HashKeyValue]) -> Bytes32 {
        let tree = test_tree();
        let mut tx = storage.begin(&tree).expect("begin should succeed");
        let write_revision = tx.write_revision() as u64;
        let mut writer = SmtWriter::new(7, write_revision, Arc::new(MapSha256Hasher));
        writer.set_leaves(updates).expect("staging should succeed");
        let root = {
            let runner = SingleTxRunner::new(&mut *tx);
            writer
                .calculate_root(&OpContext::background(), &runner)
                .expect("root calculation should succeed")
        };
        tx.commit().expect("commit should succeed");
        root
    }

    #[test]
    fn test_single_leaf_root_matches_manual_fold() {
        let hasher = MapSha256Hasher;
        let storage = InMemoryMapStorage::new();
        let mut index = [0u8; 32];
        index[0] = 0b1100_0000;
        let update = leaf_update(&hasher, index, b"value");

        let root = write_batch_single(&storage, &[update]);

        assert_eq!(root, lone_leaf_root(&hasher, &index, update.hashed_value));
    }

    #[test]
    fn test_empty_batch_keeps_previous_root() {
        let hasher = MapSha256Hasher;
        let storage = InMemoryMapStorage::new();
        let update = leaf_update(&hasher, [9u8; 32], b"value");
        let first = write_batch_single(&storage, &[update]);

        let second = write_batch_single(&storage, &[]);

        assert_eq!(second, first);
    }

    #[test]
    fn test_fresh_tree_empty_batch_yields_empty_root() {
        let hasher = MapSha256Hasher;
        let storage = InMemoryMapStorage::new();

        let root = write_batch_single(&storage, &[]);

        assert_eq!(root, hasher.hash_empty(7, &[0u8; 32], 256));
    }

    #[test]
    fn test_written_paths_verify_against_root() {
        let hasher = MapSha256Hasher;
        let storage = InMemoryMapStorage::new();
        let mut far = [0u8; 32];
        far[0] = 0xf0;
        let updates =
            vec![leaf_update(&hasher, [0u8; 32], b"left"), leaf_update(&hasher, far, b"right")];

        let root = write_batch_single(&storage, &updates);

        let tree = test_tree();
        let snapshot = storage.snapshot(&tree).expect("snapshot should open");
        let reader = SmtReader::new(7, &hasher);
        let proofs = reader
            .batch_inclusion_proof(&OpContext::background(), &*snapshot, 0, &[[0u8; 32], far])
            .expect("proof generation should succeed");
        for (index, value) in [([0u8; 32], b"left".as_slice()), (far, b"right".as_slice())] {
            let path = proofs.get(&index).expect("proof should exist");
            let verified = verify_inclusion_proof(&hasher, 7, &index, value, path, &root)
                .expect("verification should succeed");
            assert!(verified, "path for {} should verify", hex::encode(index));
        }
    }

    #[test]
    fn test_multi_and_single_runners_agree() {
        let hasher = MapSha256Hasher;
        let mut updates = Vec::new();
        for byte in [0x00u8, 0x01, 0x80, 0xfe] {
            let mut index = [byte; 32];
            index[31] = byte.wrapping_add(1);
            updates.push(leaf_update(&hasher, index, b"payload"));
        }

        let single_storage = InMemoryMapStorage::new();
        let single_root = write_batch_single(&single_storage, &updates);

        let multi_storage = InMemoryMapStorage::new();
        let tree = test_tree();
        let mut writer = SmtWriter::new(7, 0, Arc::new(MapSha256Hasher));
        writer.set_leaves(&updates).expect("staging should succeed");
        let runner = MultiTxRunner::new(Arc::new(multi_storage), tree);
        let multi_root = writer
            .calculate_root(&OpContext::background(), &runner)
            .expect("root calculation should succeed");

        assert_eq!(single_root, multi_root);
    }

    #[test]
    fn test_writer_state_machine() {
        let mut writer = SmtWriter::new(7, 0, Arc::new(MapSha256Hasher));
        let storage = InMemoryMapStorage::new();
        let runner = MultiTxRunner::new(Arc::new(storage), test_tree());

        assert!(writer.calculate_root(&OpContext::background(), &runner).is_err());
        // The failed call aborts the writer; staging is no longer allowed.
        assert!(writer.set_leaves(&[]).is_err());
    }

    #[test]
    fn test_cancellation_aborts_writer() {
        let mut writer = SmtWriter::new(7, 0, Arc::new(MapSha256Hasher));
        writer.set_leaves(&[]).expect("staging should succeed");
        let storage = InMemoryMapStorage::new();
        let runner = MultiTxRunner::new(Arc::new(storage), test_tree());
        let ctx = OpContext::background();
        ctx.cancel();

        let outcome = writer.calculate_root(&ctx, &runner);

        assert!(outcome.is_err());
        assert!(writer.set_leaves(&[]).is_err());
    }
}
