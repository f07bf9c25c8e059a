//! Map server operation handlers
//!
//! The server orchestrates every map operation: it validates requests,
//! loads the tree and its hasher, opens the right kind of storage session,
//! drives the sparse Merkle tree reader or writer, and assembles signed
//! responses. The RPC transport in front of it is an external collaborator;
//! these handlers are what it calls.

mod messages;
mod preload;

pub use messages::*;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::admin::{AdminStore, TreeOp};
use crate::context::OpContext;
use crate::errors::{Error, Result};
use crate::hasher::{new_map_hasher, MapHasher};
use crate::metrics::{Counter, InertMetricFactory, MetricFactory};
use crate::roots::{MapRootSigner, MapRootV1, SignedMapRoot};
use crate::server::preload::preload_merkle_paths;
use crate::smt::reader::SmtReader;
use crate::smt::runner::{job_panic_error, MultiTxRunner, SingleTxRunner, TxRunner};
use crate::smt::writer::SmtWriter;
use crate::storage::{MapSnapshot, MapStorage, MapTransaction};
use crate::types::{Bytes32, HashKeyValue, MapLeaf, MapLeafInclusion, Tree, TreeId};

/// Sentinel used internally to request the latest published revision
const MOST_RECENT_REVISION: i64 = -1;

/// Collaborators the map server is built from
pub struct MapRegistry {
    /// Source of tree descriptors
    pub admin: Arc<dyn AdminStore>,
    /// Backing store for leaves, nodes, and roots
    pub storage: Arc<dyn MapStorage>,
    /// Producer of signed map roots
    pub signer: Arc<dyn MapRootSigner>,
    /// Optional metric factory; the server degrades to inert metrics when
    /// absent
    pub metrics: Option<Arc<dyn MetricFactory>>,
}

/// Options selected when creating a [`MapServer`]
#[derive(Clone, Copy, Debug, Default)]
pub struct MapServerOptions {
    /// Run every tree update inside the one outer transaction
    pub use_single_transaction: bool,

    /// Warm the transaction's node cache with one bulk path read before
    /// the writer runs; only applies with `use_single_transaction`
    pub use_large_preload: bool,
}

/// Handler set for one verifiable-map service
pub struct MapServer {
    admin: Arc<dyn AdminStore>,
    storage: Arc<dyn MapStorage>,
    signer: Arc<dyn MapRootSigner>,
    opts: MapServerOptions,
    set_leaves_counter: Arc<dyn Counter>,
    get_leaves_counter: Arc<dyn Counter>,
}

impl MapServer {
    /// Creates a new server backed by the registry's collaborators
    pub fn new(registry: MapRegistry, opts: MapServerOptions) -> Self {
        if opts.use_single_transaction {
            warn!("running map updates in experimental single-transaction mode");
        }
        let metrics = registry
            .metrics
            .unwrap_or_else(|| Arc::new(InertMetricFactory) as Arc<dyn MetricFactory>);
        Self {
            admin: registry.admin,
            storage: registry.storage,
            signer: registry.signer,
            opts,
            set_leaves_counter: metrics.new_counter(
                "set_leaves",
                "Number of map leaves requested to be set",
                "map_id",
            ),
            get_leaves_counter: metrics.new_counter(
                "get_leaves",
                "Number of map leaves requested to be read",
                "map_id",
            ),
        }
    }

    /// Returns `Ok` when the backing store is reachable
    pub fn is_healthy(&self) -> Result<()> {
        self.storage.check_accessible()
    }

    /// Writes the revision 0 root of an uninitialized map
    pub fn init_map(&self, ctx: &OpContext, req: InitMapRequest) -> Result<InitMapResponse> {
        let map_id = req.map_id;
        let (tree, hasher) = self.tree_and_hasher(map_id, TreeOp::AdminInit)?;
        ctx.check()?;

        let mut tx = self.storage.begin(&tree)?;
        if tx.latest_signed_map_root()?.is_some() {
            return Err(Error::AlreadyExists(format!("map {map_id} is already initialized")));
        }
        debug!(map_id, "initializing map root at revision 0");
        let empty_index = vec![0u8; hasher.size()];
        let root_hash = hasher.hash_empty(tree.tree_id, &empty_index, hasher.bit_len());
        let created = self.make_signed_map_root(root_hash, 0, Vec::new())?;
        tx.store_signed_map_root(created.clone())?;
        ctx.check()?;
        tx.commit()?;
        Ok(InitMapResponse { created })
    }

    /// Returns the latest signed map root
    pub fn get_signed_map_root(
        &self,
        ctx: &OpContext,
        req: GetSignedMapRootRequest,
    ) -> Result<GetSignedMapRootResponse> {
        let tree = self.admin.get_tree(req.map_id, TreeOp::Query)?;
        ctx.check()?;
        let mut snapshot = self.storage.snapshot(&tree)?;
        let result = snapshot
            .latest_signed_map_root()
            .and_then(|root| root.ok_or(Error::TreeNeedsInit(req.map_id)));
        close_and_log(req.map_id, snapshot.as_mut(), "get_signed_map_root");
        Ok(GetSignedMapRootResponse { map_root: result? })
    }

    /// Returns the signed map root stored for one revision
    pub fn get_signed_map_root_by_revision(
        &self,
        ctx: &OpContext,
        req: GetSignedMapRootByRevisionRequest,
    ) -> Result<GetSignedMapRootResponse> {
        if req.revision < 0 {
            return Err(Error::InvalidArgument(format!(
                "map revision {} must be >= 0",
                req.revision
            )));
        }
        let tree = self.admin.get_tree(req.map_id, TreeOp::Query)?;
        ctx.check()?;
        let mut snapshot = self.storage.snapshot(&tree)?;
        let result = snapshot.get_signed_map_root(req.revision as u64);
        close_and_log(req.map_id, snapshot.as_mut(), "get_signed_map_root_by_revision");
        Ok(GetSignedMapRootResponse { map_root: result? })
    }

    /// Returns one leaf with its inclusion proof at the latest revision
    pub fn get_leaf(&self, ctx: &OpContext, req: GetMapLeafRequest) -> Result<GetMapLeafResponse> {
        let batch = self.leaves_with_proofs(
            ctx,
            req.map_id,
            std::slice::from_ref(&req.index),
            MOST_RECENT_REVISION,
        )?;
        single_inclusion(req.map_id, batch)
    }

    /// Returns one leaf with its inclusion proof at a specific revision
    pub fn get_leaf_by_revision(
        &self,
        ctx: &OpContext,
        req: GetMapLeafByRevisionRequest,
    ) -> Result<GetMapLeafResponse> {
        if req.revision < 0 {
            return Err(Error::InvalidArgument(format!(
                "map revision {} must be >= 0",
                req.revision
            )));
        }
        let batch = self.leaves_with_proofs(
            ctx,
            req.map_id,
            std::slice::from_ref(&req.index),
            req.revision,
        )?;
        single_inclusion(req.map_id, batch)
    }

    /// Returns a batch of leaves with proofs at the latest revision
    pub fn get_leaves(
        &self,
        ctx: &OpContext,
        req: GetMapLeavesRequest,
    ) -> Result<GetMapLeavesResponse> {
        self.leaves_with_proofs(ctx, req.map_id, &req.indices, MOST_RECENT_REVISION)
    }

    /// Returns a batch of leaves with proofs at a specific revision
    pub fn get_leaves_by_revision(
        &self,
        ctx: &OpContext,
        req: GetMapLeavesByRevisionRequest,
    ) -> Result<GetMapLeavesResponse> {
        if req.revision < 0 {
            return Err(Error::InvalidArgument(format!(
                "map revision {} must be >= 0",
                req.revision
            )));
        }
        self.leaves_with_proofs(ctx, req.map_id, &req.indices, req.revision)
    }

    /// Returns a batch of leaves without proofs at a specific revision
    ///
    /// `leaf_hash` is stripped from the result because the write path only
    /// ever supplies values.
    pub fn get_leaves_by_revision_no_proof(
        &self,
        ctx: &OpContext,
        req: GetMapLeavesByRevisionRequest,
    ) -> Result<MapLeavesResponse> {
        if req.revision < 0 {
            return Err(Error::InvalidArgument(format!(
                "map revision {} must be >= 0",
                req.revision
            )));
        }
        let (tree, hasher) = self.tree_and_hasher(req.map_id, TreeOp::Query)?;
        validate_indices(hasher.size(), req.indices.iter().map(Vec::as_slice))?;
        ctx.check()?;

        let mut snapshot = self.storage.snapshot(&tree)?;
        let result = snapshot.get_leaves(req.revision as u64, &req.indices);
        close_and_log(req.map_id, snapshot.as_mut(), "get_leaves_by_revision_no_proof");
        let mut leaves = result?;
        for leaf in &mut leaves {
            leaf.leaf_hash = None;
        }
        Ok(MapLeavesResponse { leaves })
    }

    /// Writes one new revision from a batch of leaves
    pub fn set_leaves(
        &self,
        ctx: &OpContext,
        req: SetMapLeavesRequest,
    ) -> Result<SetMapLeavesResponse> {
        let SetMapLeavesRequest { map_id, mut leaves, metadata, expected_revision } = req;
        self.set_leaves_counter.add(leaves.len() as u64, &map_id.to_string());

        let (tree, hasher) = self.tree_and_hasher(map_id, TreeOp::UpdateMap)?;
        validate_indices(hasher.size(), leaves.iter().map(|leaf| leaf.index.as_slice()))?;
        ctx.check()?;

        let mut updates = Vec::with_capacity(leaves.len());
        for leaf in &mut leaves {
            let leaf_hash = hasher.hash_leaf(tree.tree_id, &leaf.index, &leaf.leaf_value);
            leaf.leaf_hash = Some(leaf_hash);
            updates.push(HashKeyValue { hashed_key: leaf_key(&leaf.index)?, hashed_value: leaf_hash });
        }

        let mut tx = self.storage.begin(&tree)?;
        if tx.latest_signed_map_root()?.is_none() {
            return Err(Error::TreeNeedsInit(map_id));
        }
        let write_revision = checked_write_revision(&*tx, expected_revision)?;
        debug!(map_id, write_revision, "writing at revision");

        for leaf in &leaves {
            tx.set(&leaf.index, leaf.clone())?;
        }
        ctx.check()?;

        if self.opts.use_single_transaction && self.opts.use_large_preload {
            preload_merkle_paths(ctx, &mut *tx, hasher.bit_len(), &updates)?;
        }

        let root_hash = {
            let runner = self.new_tx_runner(&tree, &mut *tx);
            let mut writer = SmtWriter::new(tree.tree_id, write_revision as u64, hasher.clone());
            writer.set_leaves(&updates)?;
            writer.calculate_root(ctx, runner.as_ref())?
        };

        let map_root = self.make_signed_map_root(root_hash, write_revision as u64, metadata)?;
        tx.store_signed_map_root(map_root.clone())?;
        ctx.check()?;
        tx.commit()?;
        Ok(SetMapLeavesResponse { map_root })
    }

    /// Fetches leaves and their inclusion proofs concurrently
    ///
    /// A negative `revision` adopts the revision of the latest signed root.
    fn leaves_with_proofs(
        &self,
        ctx: &OpContext,
        map_id: TreeId,
        indices: &[Vec<u8>],
        revision: i64,
    ) -> Result<GetMapLeavesResponse> {
        let (tree, hasher) = self.tree_and_hasher(map_id, TreeOp::Query)?;
        validate_indices(hasher.size(), indices.iter().map(Vec::as_slice))?;
        self.get_leaves_counter.add(indices.len() as u64, &map_id.to_string());
        ctx.check()?;

        let mut snapshot = self.storage.snapshot(&tree)?;
        let result =
            self.leaves_with_proofs_inner(ctx, &tree, hasher.as_ref(), &*snapshot, indices, revision);
        close_and_log(map_id, snapshot.as_mut(), "get_leaves_by_revision");
        result
    }

    fn leaves_with_proofs_inner(
        &self,
        ctx: &OpContext,
        tree: &Tree,
        hasher: &dyn MapHasher,
        snapshot: &dyn MapSnapshot,
        indices: &[Vec<u8>],
        revision: i64,
    ) -> Result<GetMapLeavesResponse> {
        let map_id = tree.tree_id;
        let root = if revision < 0 {
            snapshot.latest_signed_map_root()?.ok_or(Error::TreeNeedsInit(map_id))?
        } else {
            snapshot.get_signed_map_root(revision as u64)?
        };
        let decoded = MapRootV1::decode(&root.map_root)?;
        let revision = decoded.revision;

        let keys = indices.iter().map(|index| leaf_key(index)).collect::<Result<Vec<_>>>()?;
        let reader = SmtReader::new(map_id, hasher);
        ctx.check()?;

        let mut leaves_result: Result<Vec<MapLeaf>> = Ok(Vec::new());
        let mut proofs_result: Result<BTreeMap<Bytes32, Vec<Bytes32>>> = Ok(BTreeMap::new());
        thread::scope(|scope| {
            let leaves_handle = scope.spawn(|| snapshot.get_leaves(revision, indices));
            let proofs_handle =
                scope.spawn(|| reader.batch_inclusion_proof(ctx, snapshot, revision, &keys));
            leaves_result = leaves_handle.join().unwrap_or_else(|_| Err(job_panic_error()));
            proofs_result = proofs_handle.join().unwrap_or_else(|_| Err(job_panic_error()));
        });
        let leaves = leaves_result?;
        let mut proofs = proofs_result?;

        let mut leaves_by_index: HashMap<Vec<u8>, MapLeaf> =
            leaves.into_iter().map(|leaf| (leaf.index.clone(), leaf)).collect();
        debug!(map_id, wanted = indices.len(), found = leaves_by_index.len(), "fetched leaves");

        let mut inclusions = Vec::with_capacity(indices.len());
        for (index, key) in indices.iter().zip(&keys) {
            let leaf = leaves_by_index
                .remove(index)
                .unwrap_or_else(|| MapLeaf { index: index.clone(), ..MapLeaf::default() });
            let inclusion = proofs.remove(key).ok_or_else(|| {
                Error::Internal(format!("no inclusion proof produced for index {}", hex::encode(index)))
            })?;
            inclusions.push(MapLeafInclusion { leaf, inclusion });
        }
        Ok(GetMapLeavesResponse { map_root: root, inclusions })
    }

    fn tree_and_hasher(&self, map_id: TreeId, op: TreeOp) -> Result<(Tree, Arc<dyn MapHasher>)> {
        let tree = self.admin.get_tree(map_id, op)?;
        let hasher = new_map_hasher(tree.hash_strategy)?;
        Ok((tree, hasher))
    }

    fn new_tx_runner<'a>(
        &self,
        tree: &Tree,
        tx: &'a mut dyn MapTransaction,
    ) -> Box<dyn TxRunner + 'a> {
        if self.opts.use_single_transaction {
            Box::new(SingleTxRunner::new(tx))
        } else {
            Box::new(MultiTxRunner::new(self.storage.clone(), tree.clone()))
        }
    }

    fn make_signed_map_root(
        &self,
        root_hash: Bytes32,
        revision: u64,
        metadata: Vec<u8>,
    ) -> Result<SignedMapRoot> {
        let timestamp_nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| Error::Internal(format!("system clock before unix epoch: {e}")))?
            .as_nanos() as u64;
        let map_root =
            MapRootV1 { root_hash: root_hash.to_vec(), timestamp_nanos, revision, metadata };
        self.signer.sign_map_root(&map_root)
    }
}

/// Extracts the single inclusion from a batch response
fn single_inclusion(map_id: TreeId, mut batch: GetMapLeavesResponse) -> Result<GetMapLeafResponse> {
    if batch.inclusions.len() != 1 {
        warn!(map_id, got = batch.inclusions.len(), "requested 1 leaf, got a different count");
        return Err(Error::Internal(format!(
            "requested 1 leaf, got {} leaves",
            batch.inclusions.len()
        )));
    }
    let inclusion = batch.inclusions.remove(0);
    Ok(GetMapLeafResponse { map_root: batch.map_root, inclusion })
}

/// Returns the revision the transaction will commit at, asserting the
/// caller's expectation when one was given
///
/// An `expected_revision` of zero means no assertion, so "this must be the
/// first write" cannot be expressed; the behavior is kept for
/// compatibility.
fn checked_write_revision(tx: &dyn MapTransaction, expected_revision: i64) -> Result<i64> {
    let write_revision = tx.write_revision();
    if expected_revision != 0 && write_revision != expected_revision {
        return Err(Error::FailedPrecondition(format!(
            "can't write to revision {expected_revision}"
        )));
    }
    Ok(write_revision)
}

/// Checks that every index has the hasher's size and appears once
///
/// Indices are the ordinal positions of leaves, obtained by hashing the
/// caller's key, so they are scattered across the whole index space and
/// must all have the same width as the tree's hash.
fn validate_indices<'a, I>(index_size: usize, indices: I) -> Result<()>
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut seen = std::collections::HashSet::new();
    for (position, index) in indices.into_iter().enumerate() {
        if index.len() != index_size {
            return Err(Error::InvalidArgument(format!(
                "index at position {position} has wrong length: got={}, want={index_size}",
                index.len()
            )));
        }
        if !seen.insert(index) {
            return Err(Error::InvalidArgument(format!(
                "duplicate index detected at position {position}"
            )));
        }
    }
    Ok(())
}

fn leaf_key(index: &[u8]) -> Result<Bytes32> {
    index.try_into().map_err(|_| {
        Error::Internal(format!("index of {} bytes does not fit the tree key", index.len()))
    })
}

fn close_and_log(map_id: TreeId, snapshot: &mut dyn MapSnapshot, op: &str) {
    if let Err(e) = snapshot.close() {
        warn!(map_id, op, error = %e, "snapshot close failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_indices_flags_position() {
        let short = vec![0u8; 16];
        let full = vec![1u8; 32];

        let outcome = validate_indices(32, [full.as_slice(), short.as_slice()]);

        match outcome {
            Err(Error::InvalidArgument(message)) => assert!(message.contains("position 1")),
            other => panic!("expected invalid argument, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_indices_flags_duplicates() {
        let index = vec![1u8; 32];

        let outcome = validate_indices(32, [index.as_slice(), index.as_slice()]);

        match outcome {
            Err(Error::InvalidArgument(message)) => {
                assert!(message.contains("duplicate"));
                assert!(message.contains("position 1"));
            }
            other => panic!("expected invalid argument, got {other:?}"),
        }
    }

    #[test]
    fn test_checked_write_revision_zero_means_no_assertion() {
        use crate::storage::{InMemoryMapStorage, MapStorage};
        use crate::types::{HashStrategy, TreeState};

        let storage = InMemoryMapStorage::new();
        let tree = Tree {
            tree_id: 7,
            hash_strategy: HashStrategy::Sha256DomainSeparated,
            state: TreeState::Active,
        };
        let tx = storage.begin(&tree).expect("begin should succeed");

        assert_eq!(checked_write_revision(&*tx, 0).expect("no assertion"), 0);
        assert!(matches!(
            checked_write_revision(&*tx, 5),
            Err(Error::FailedPrecondition(_))
        ));
    }
}
