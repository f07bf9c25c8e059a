//! In-memory storage driver
//!
//! Backs a set of trees with versioned maps guarded by one store lock.
//! Committed history is append-only: a commit only ever inserts values at
//! its own write revision, so revision-filtered reads from concurrently
//! open sessions are stable and snapshots get isolation without copying.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::errors::{Error, Result};
use crate::roots::{MapRootV1, SignedMapRoot};
use crate::smt::node::{Node, NodeId};
use crate::storage::cache::{NodeCache, DEFAULT_NODE_CACHE_CAPACITY};
use crate::storage::{MapSnapshot, MapStorage, MapTransaction};
use crate::types::{Bytes32, MapLeaf, Tree, TreeId};

#[derive(Default)]
struct TreeData {
    leaves: BTreeMap<Vec<u8>, BTreeMap<u64, MapLeaf>>,
    nodes: BTreeMap<Vec<u8>, BTreeMap<u64, Bytes32>>,
    roots: BTreeMap<u64, SignedMapRoot>,
}

impl TreeData {
    fn latest_revision(&self) -> i64 {
        self.roots.keys().next_back().map(|rev| *rev as i64).unwrap_or(-1)
    }
}

#[derive(Default)]
struct StoreInner {
    trees: Mutex<HashMap<TreeId, TreeData>>,
}

impl StoreInner {
    fn lock(&self) -> MutexGuard<'_, HashMap<TreeId, TreeData>> {
        self.trees.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn latest_revision(&self, tree_id: TreeId) -> i64 {
        self.lock().get(&tree_id).map(TreeData::latest_revision).unwrap_or(-1)
    }
}

fn read_leaf(data: &TreeData, revision: u64, index: &[u8]) -> Option<MapLeaf> {
    data.leaves
        .get(index)
        .and_then(|history| history.range(..=revision).next_back())
        .map(|(_, leaf)| leaf.clone())
}

fn read_node(data: &TreeData, revision: u64, id: &NodeId) -> Option<Bytes32> {
    data.nodes
        .get(&id.storage_key())
        .and_then(|history| history.range(..=revision).next_back())
        .map(|(_, hash)| *hash)
}

/// In-memory [`MapStorage`] implementation
///
/// Cloning shares the underlying store, so every session opened from any
/// clone observes the same committed state.
#[derive(Clone, Default)]
pub struct InMemoryMapStorage {
    inner: Arc<StoreInner>,
}

impl InMemoryMapStorage {
    /// Creates an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl MapStorage for InMemoryMapStorage {
    fn snapshot(&self, tree: &Tree) -> Result<Box<dyn MapSnapshot>> {
        Ok(Box::new(MemorySnapshot {
            inner: self.inner.clone(),
            tree_id: tree.tree_id,
            latest: self.inner.latest_revision(tree.tree_id),
        }))
    }

    fn begin(&self, tree: &Tree) -> Result<Box<dyn MapTransaction>> {
        let latest = self.inner.latest_revision(tree.tree_id);
        Ok(Box::new(MemoryTransaction {
            inner: self.inner.clone(),
            tree_id: tree.tree_id,
            read_revision: latest,
            write_revision: latest + 1,
            pending_leaves: Vec::new(),
            pending_nodes: BTreeMap::new(),
            pending_root: None,
            committed: false,
            cache: NodeCache::new(DEFAULT_NODE_CACHE_CAPACITY),
        }))
    }

    fn check_accessible(&self) -> Result<()> {
        Ok(())
    }
}

/// Read-only session pinned to the latest revision at open
struct MemorySnapshot {
    inner: Arc<StoreInner>,
    tree_id: TreeId,
    latest: i64,
}

impl MapSnapshot for MemorySnapshot {
    fn latest_signed_map_root(&self) -> Result<Option<SignedMapRoot>> {
        latest_root(&self.inner, self.tree_id, self.latest)
    }

    fn get_signed_map_root(&self, revision: u64) -> Result<SignedMapRoot> {
        root_at(&self.inner, self.tree_id, self.latest, revision)
    }

    fn get_leaves(&self, revision: u64, indices: &[Vec<u8>]) -> Result<Vec<MapLeaf>> {
        let trees = self.inner.lock();
        let Some(data) = trees.get(&self.tree_id) else {
            return Ok(Vec::new());
        };
        Ok(indices.iter().filter_map(|index| read_leaf(data, revision, index)).collect())
    }

    fn get_merkle_nodes(&self, revision: u64, ids: &[NodeId]) -> Result<Vec<Node>> {
        let trees = self.inner.lock();
        let Some(data) = trees.get(&self.tree_id) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .filter_map(|id| {
                read_node(data, revision, id).map(|hash| Node { id: id.clone(), hash })
            })
            .collect())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

fn latest_root(inner: &StoreInner, tree_id: TreeId, latest: i64) -> Result<Option<SignedMapRoot>> {
    if latest < 0 {
        return Ok(None);
    }
    let trees = inner.lock();
    trees
        .get(&tree_id)
        .and_then(|data| data.roots.get(&(latest as u64)))
        .cloned()
        .map(Some)
        .ok_or_else(|| Error::Internal(format!("tree {tree_id} lost its root at revision {latest}")))
}

fn root_at(inner: &StoreInner, tree_id: TreeId, latest: i64, revision: u64) -> Result<SignedMapRoot> {
    if latest < 0 || revision > latest as u64 {
        return Err(Error::NotFound(format!(
            "tree {tree_id} has no signed map root at revision {revision}"
        )));
    }
    let trees = inner.lock();
    trees
        .get(&tree_id)
        .and_then(|data| data.roots.get(&revision))
        .cloned()
        .ok_or_else(|| {
            Error::NotFound(format!("tree {tree_id} has no signed map root at revision {revision}"))
        })
}

/// Read-write session buffering writes until commit
struct MemoryTransaction {
    inner: Arc<StoreInner>,
    tree_id: TreeId,
    read_revision: i64,
    write_revision: i64,
    pending_leaves: Vec<(Vec<u8>, MapLeaf)>,
    pending_nodes: BTreeMap<(u64, Vec<u8>), Bytes32>,
    pending_root: Option<(u64, SignedMapRoot)>,
    committed: bool,
    cache: NodeCache,
}

impl MapSnapshot for MemoryTransaction {
    fn latest_signed_map_root(&self) -> Result<Option<SignedMapRoot>> {
        latest_root(&self.inner, self.tree_id, self.read_revision)
    }

    fn get_signed_map_root(&self, revision: u64) -> Result<SignedMapRoot> {
        root_at(&self.inner, self.tree_id, self.read_revision, revision)
    }

    fn get_leaves(&self, revision: u64, indices: &[Vec<u8>]) -> Result<Vec<MapLeaf>> {
        let trees = self.inner.lock();
        let Some(data) = trees.get(&self.tree_id) else {
            return Ok(Vec::new());
        };
        Ok(indices.iter().filter_map(|index| read_leaf(data, revision, index)).collect())
    }

    fn get_merkle_nodes(&self, revision: u64, ids: &[NodeId]) -> Result<Vec<Node>> {
        let mut found = Vec::with_capacity(ids.len());
        let mut misses = Vec::new();
        for id in ids {
            match self.cache.get(revision, id) {
                Some(Some(hash)) => found.push(Node { id: id.clone(), hash }),
                Some(None) => {}
                None => misses.push(id),
            }
        }
        if !misses.is_empty() {
            let trees = self.inner.lock();
            let data = trees.get(&self.tree_id);
            for id in misses {
                let hash = data.and_then(|data| read_node(data, revision, id));
                self.cache.insert(revision, id, hash);
                if let Some(hash) = hash {
                    found.push(Node { id: id.clone(), hash });
                }
            }
        }
        Ok(found)
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

impl MapTransaction for MemoryTransaction {
    fn read_revision(&self) -> i64 {
        self.read_revision
    }

    fn write_revision(&self) -> i64 {
        self.write_revision
    }

    fn set(&mut self, index: &[u8], leaf: MapLeaf) -> Result<()> {
        self.pending_leaves.push((index.to_vec(), leaf));
        Ok(())
    }

    fn set_merkle_nodes(&mut self, revision: u64, nodes: Vec<Node>) -> Result<()> {
        for node in nodes {
            self.pending_nodes.insert((revision, node.id.storage_key()), node.hash);
        }
        Ok(())
    }

    fn store_signed_map_root(&mut self, root: SignedMapRoot) -> Result<()> {
        let decoded = MapRootV1::decode(&root.map_root)?;
        if decoded.revision as i64 != self.write_revision {
            return Err(Error::Internal(format!(
                "signed map root for revision {} stored in a transaction writing revision {}",
                decoded.revision, self.write_revision
            )));
        }
        self.pending_root = Some((decoded.revision, root));
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        if self.committed {
            return Err(Error::Internal("transaction already committed".to_string()));
        }
        let mut trees = self.inner.lock();
        let data = trees.entry(self.tree_id).or_default();
        // Serializability per (tree, write revision): the loser of a race
        // observes a newer committed root and fails here, its buffered
        // writes discarded.
        if data.latest_revision() != self.write_revision - 1 {
            return Err(Error::FailedPrecondition(format!(
                "tree {} already committed revision {}",
                self.tree_id, self.write_revision
            )));
        }
        for (index, leaf) in self.pending_leaves.drain(..) {
            data.leaves.entry(index).or_default().insert(self.write_revision as u64, leaf);
        }
        for ((revision, key), hash) in std::mem::take(&mut self.pending_nodes) {
            data.nodes.entry(key).or_default().insert(revision, hash);
        }
        if let Some((revision, root)) = self.pending_root.take() {
            data.roots.insert(revision, root);
        }
        self.committed = true;
        Ok(())
    }
}
