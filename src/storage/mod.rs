//! Storage gateway for map trees
//!
//! This module provides a trait-based abstraction over the backing store of
//! one tree, so different drivers (embedded, SQL, remote) can be used
//! interchangeably. Two kinds of sessions exist: read-only snapshots pinned
//! to the latest published revision at open, and read-write transactions
//! that materialize exactly one new revision when committed.

mod cache;
mod memory;

pub use cache::NodeCache;
pub use memory::InMemoryMapStorage;

use crate::errors::Result;
use crate::roots::SignedMapRoot;
use crate::smt::node::{Node, NodeId};
use crate::types::{MapLeaf, Tree};

/// Read-only view of one tree
///
/// All reads are revision-filtered: a leaf or node read at revision `r`
/// returns the most recent value written at a revision at or below `r`.
/// Reads never observe uncommitted writes.
pub trait MapSnapshot: Send + Sync {
    /// Returns the latest signed map root, or `None` when the tree has no
    /// root yet and needs initialization
    ///
    /// The `None` outcome is control flow for the init path; other callers
    /// convert it to [`crate::errors::Error::TreeNeedsInit`].
    fn latest_signed_map_root(&self) -> Result<Option<SignedMapRoot>>;

    /// Returns the signed map root stored for `revision`
    fn get_signed_map_root(&self, revision: u64) -> Result<SignedMapRoot>;

    /// Returns the leaves stored at the given indices as of `revision`
    ///
    /// Indices with no leaf at or below `revision` are omitted from the
    /// result; callers substitute empty leaves where the API requires them.
    fn get_leaves(&self, revision: u64, indices: &[Vec<u8>]) -> Result<Vec<MapLeaf>>;

    /// Returns the Merkle nodes stored at the given ids as of `revision`
    ///
    /// Missing nodes are omitted; the tree engine substitutes the
    /// depth-appropriate empty-subtree hash.
    fn get_merkle_nodes(&self, revision: u64, ids: &[NodeId]) -> Result<Vec<Node>>;

    /// Releases the snapshot
    fn close(&mut self) -> Result<()>;
}

/// Read-write session over one tree
///
/// A transaction buffers its writes and applies them atomically on
/// [`commit`](MapTransaction::commit). Transactions are serializable per
/// `(tree, write_revision)`: of two transactions racing for the same write
/// revision at most one commits, the loser fails with a precondition
/// violation. Dropping an uncommitted transaction rolls it back.
pub trait MapTransaction: MapSnapshot {
    /// Returns the highest committed revision visible when the transaction
    /// started, or -1 for an uninitialized tree
    fn read_revision(&self) -> i64;

    /// Returns the revision this transaction will materialize if committed
    fn write_revision(&self) -> i64;

    /// Buffers a leaf write at this transaction's write revision
    fn set(&mut self, index: &[u8], leaf: MapLeaf) -> Result<()>;

    /// Buffers Merkle node writes at the given revision
    fn set_merkle_nodes(&mut self, revision: u64, nodes: Vec<Node>) -> Result<()>;

    /// Buffers the signed map root for this transaction's write revision
    fn store_signed_map_root(&mut self, root: SignedMapRoot) -> Result<()>;

    /// Atomically applies all buffered writes
    fn commit(&mut self) -> Result<()>;
}

/// Factory for sessions over map trees
pub trait MapStorage: Send + Sync {
    /// Opens a read-only snapshot of `tree`
    fn snapshot(&self, tree: &Tree) -> Result<Box<dyn MapSnapshot>>;

    /// Begins a read-write transaction on `tree`
    fn begin(&self, tree: &Tree) -> Result<Box<dyn MapTransaction>>;

    /// Pings the backing store
    fn check_accessible(&self) -> Result<()>;
}
