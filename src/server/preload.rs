//! Bulk warm-up of Merkle paths before a single-transaction update
//!
//! Under the single-transaction runner every writer work unit serializes on
//! one session, so its many small sibling reads would queue behind one
//! lock. This pass computes the union of all sibling node ids along the
//! input paths, in parallel producers feeding a bounded channel, and issues
//! one bulk read against the transaction to warm its node cache first.

use std::collections::BTreeSet;
use std::thread;

use crossbeam_channel::bounded;

use crate::context::OpContext;
use crate::errors::Result;
use crate::smt::node::NodeId;
use crate::storage::MapTransaction;
use crate::types::HashKeyValue;

/// Capacity of the producer/consumer queue of sibling ids
///
/// When producers outrun the consumer they block here rather than buffering
/// every id of a large batch at once.
const PRELOAD_QUEUE_CAPACITY: usize = 2048;

/// Warms the transaction's node cache with every sibling on the paths of
/// the update batch
///
/// The read result itself is discarded; the value is in the cache fills.
pub(crate) fn preload_merkle_paths(
    ctx: &OpContext,
    tx: &mut dyn MapTransaction,
    bit_len: usize,
    updates: &[HashKeyValue],
) -> Result<()> {
    ctx.check()?;
    let read_revision = tx.read_revision();
    if read_revision < 0 || updates.is_empty() {
        return Ok(());
    }
    let ids = all_sibling_ids(bit_len, updates);
    tx.get_merkle_nodes(read_revision as u64, &ids)?;
    Ok(())
}

/// Computes the deduplicated union of sibling ids across all update paths
///
/// Producers emit per-index sibling ids into the bounded queue; dropping
/// the last sender closes it, and the consumer folds everything into an
/// ordered set, so the result is deterministic regardless of scheduling.
fn all_sibling_ids(bit_len: usize, updates: &[HashKeyValue]) -> Vec<NodeId> {
    let workers = thread::available_parallelism().map(usize::from).unwrap_or(4).min(updates.len());
    let chunk_size = updates.len().div_ceil(workers.max(1)).max(1);
    let (sender, receiver) = bounded(PRELOAD_QUEUE_CAPACITY);

    let mut ids = BTreeSet::new();
    thread::scope(|scope| {
        for chunk in updates.chunks(chunk_size) {
            let sender = sender.clone();
            scope.spawn(move || {
                for update in chunk {
                    for depth in 1..=bit_len {
                        let Some(sibling) =
                            NodeId::from_index(&update.hashed_key, depth).sibling()
                        else {
                            continue;
                        };
                        if sender.send(sibling).is_err() {
                            return;
                        }
                    }
                }
            });
        }
        drop(sender);
        for id in receiver.iter() {
            ids.insert(id);
        }
    });
    ids.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{InMemoryMapStorage, MapStorage};
    use crate::types::{Bytes32, HashStrategy, Tree, TreeState};

    fn update(index: Bytes32) -> HashKeyValue {
        HashKeyValue { hashed_key: index, hashed_value: [0u8; 32] }
    }

    #[test]
    fn test_union_is_deduplicated_and_complete() {
        let mut sibling_index = [0u8; 32];
        sibling_index[31] = 1;

        let ids = all_sibling_ids(256, &[update([0u8; 32]), update(sibling_index)]);

        // The two paths differ only in the last bit: each contributes the
        // other's leaf as its level-256 sibling, and the remaining 255
        // sibling ids are shared.
        assert_eq!(ids.len(), 255 + 2);
        let expected: BTreeSet<NodeId> = ids.iter().cloned().collect();
        assert_eq!(expected.len(), ids.len());
    }

    #[test]
    fn test_preload_handles_uninitialized_trees() {
        let storage = InMemoryMapStorage::new();
        let tree = Tree {
            tree_id: 7,
            hash_strategy: HashStrategy::Sha256DomainSeparated,
            state: TreeState::Active,
        };
        let mut tx = storage.begin(&tree).expect("begin should succeed");

        let outcome =
            preload_merkle_paths(&OpContext::background(), &mut *tx, 256, &[update([0u8; 32])]);

        assert!(outcome.is_ok());
    }
}
