//! Admin store access to tree descriptors
//!
//! The admin collaborator owns tree lifecycles; the map server only reads
//! descriptors from it. Fetches are qualified by the intended operation so
//! the store can refuse trees whose state forbids it.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use crate::errors::{Error, Result};
use crate::types::{Tree, TreeId, TreeState};

/// The operation a tree is being fetched for
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TreeOp {
    /// Initializing the map's first root
    AdminInit,
    /// Serving reads
    Query,
    /// Writing a new revision
    UpdateMap,
}

/// Read access to tree descriptors
pub trait AdminStore: Send + Sync {
    /// Fetches the descriptor for `tree_id`, checked against `op`
    ///
    /// Fails with `not-found` for unknown trees and `failed-precondition`
    /// when the tree state forbids the operation: only active trees accept
    /// initialization or writes, while frozen and draining trees still
    /// serve reads.
    fn get_tree(&self, tree_id: TreeId, op: TreeOp) -> Result<Tree>;
}

/// In-memory [`AdminStore`] implementation
#[derive(Default)]
pub struct InMemoryAdminStore {
    trees: RwLock<HashMap<TreeId, Tree>>,
}

impl InMemoryAdminStore {
    /// Creates an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tree descriptor
    pub fn create_tree(&self, tree: Tree) -> Result<()> {
        let mut trees = self.trees.write().unwrap_or_else(PoisonError::into_inner);
        if trees.contains_key(&tree.tree_id) {
            return Err(Error::AlreadyExists(format!("tree {} already exists", tree.tree_id)));
        }
        trees.insert(tree.tree_id, tree);
        Ok(())
    }

    /// Replaces the lifecycle state of an existing tree
    pub fn set_tree_state(&self, tree_id: TreeId, state: TreeState) -> Result<()> {
        let mut trees = self.trees.write().unwrap_or_else(PoisonError::into_inner);
        let tree = trees
            .get_mut(&tree_id)
            .ok_or_else(|| Error::NotFound(format!("tree {tree_id} not found")))?;
        tree.state = state;
        Ok(())
    }
}

impl AdminStore for InMemoryAdminStore {
    fn get_tree(&self, tree_id: TreeId, op: TreeOp) -> Result<Tree> {
        let trees = self.trees.read().unwrap_or_else(PoisonError::into_inner);
        let tree = trees
            .get(&tree_id)
            .ok_or_else(|| Error::NotFound(format!("tree {tree_id} not found")))?;
        match op {
            TreeOp::AdminInit | TreeOp::UpdateMap if tree.state != TreeState::Active => {
                Err(Error::FailedPrecondition(format!(
                    "tree {tree_id} is {} and cannot be written",
                    tree.state
                )))
            }
            _ => Ok(tree.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HashStrategy;

    fn tree(state: TreeState) -> Tree {
        Tree { tree_id: 7, hash_strategy: HashStrategy::Sha256DomainSeparated, state }
    }

    #[test]
    fn test_unknown_tree_is_not_found() {
        let store = InMemoryAdminStore::new();

        assert!(matches!(store.get_tree(7, TreeOp::Query), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_duplicate_create_is_rejected() {
        let store = InMemoryAdminStore::new();
        store.create_tree(tree(TreeState::Active)).expect("create should succeed");

        assert!(matches!(
            store.create_tree(tree(TreeState::Active)),
            Err(Error::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_frozen_tree_refuses_writes_but_serves_reads() {
        let store = InMemoryAdminStore::new();
        store.create_tree(tree(TreeState::Frozen)).expect("create should succeed");

        assert!(matches!(
            store.get_tree(7, TreeOp::UpdateMap),
            Err(Error::FailedPrecondition(_))
        ));
        assert!(matches!(
            store.get_tree(7, TreeOp::AdminInit),
            Err(Error::FailedPrecondition(_))
        ));
        assert!(store.get_tree(7, TreeOp::Query).is_ok());
    }

    #[test]
    fn test_set_tree_state() {
        let store = InMemoryAdminStore::new();
        store.create_tree(tree(TreeState::Active)).expect("create should succeed");

        store.set_tree_state(7, TreeState::Draining).expect("state change should succeed");

        assert!(matches!(
            store.get_tree(7, TreeOp::UpdateMap),
            Err(Error::FailedPrecondition(_))
        ));
    }
}
