//! Transaction runners for the sparse Merkle tree writer
//!
//! A [`TxRunner`] decides which transaction a unit of tree work executes
//! in. The writer itself never opens or commits transactions; it hands each
//! work unit to the runner and the runner supplies the session.

use std::sync::{Arc, Mutex, PoisonError};

use crate::errors::{Error, Result};
use crate::storage::{MapStorage, MapTransaction};
use crate::types::Tree;

/// A unit of tree work executed against some transaction
pub type TxJob<'j> = dyn FnMut(&mut dyn MapTransaction) -> Result<()> + Send + 'j;

/// Strategy for executing tree work units in transactions
pub trait TxRunner: Sync {
    /// Executes `job` in a transaction chosen by the runner
    fn run(&self, job: &mut TxJob<'_>) -> Result<()>;
}

/// Executes every job against one shared outer transaction
///
/// Jobs serialize on the transaction lock, which is the simplest consistent
/// mode; the path preload pass exists to soften the cost of that lock.
pub struct SingleTxRunner<'a> {
    tx: Mutex<&'a mut dyn MapTransaction>,
}

impl<'a> SingleTxRunner<'a> {
    /// Wraps the outer transaction of the enclosing write
    pub fn new(tx: &'a mut dyn MapTransaction) -> Self {
        Self { tx: Mutex::new(tx) }
    }
}

impl TxRunner for SingleTxRunner<'_> {
    fn run(&self, job: &mut TxJob<'_>) -> Result<()> {
        let mut tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        job(&mut **tx)
    }
}

/// Executes each job in its own fresh read-write transaction
///
/// Jobs proceed in parallel without sharing a lock. If one job's
/// transaction commits and another's fails, storage is left with a partial
/// revision until the enclosing write retries; the signed root is only
/// published by the outer transaction, so readers never observe it. This
/// trade-off is accepted for speed.
pub struct MultiTxRunner {
    storage: Arc<dyn MapStorage>,
    tree: Tree,
}

impl MultiTxRunner {
    /// Creates a runner opening transactions on `tree` through `storage`
    pub fn new(storage: Arc<dyn MapStorage>, tree: Tree) -> Self {
        Self { storage, tree }
    }
}

impl TxRunner for MultiTxRunner {
    fn run(&self, job: &mut TxJob<'_>) -> Result<()> {
        let mut tx = self.storage.begin(&self.tree)?;
        match job(&mut *tx) {
            Ok(()) => tx.commit(),
            Err(e) => {
                // Dropping the transaction rolls it back.
                Err(e)
            }
        }
    }
}

/// Maps a poisoned or panicked job into the internal error kind
pub(crate) fn job_panic_error() -> Error {
    Error::Internal("tree update task panicked".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryMapStorage;
    use crate::types::{HashStrategy, TreeState};

    fn test_tree() -> Tree {
        Tree { tree_id: 7, hash_strategy: HashStrategy::Sha256DomainSeparated, state: TreeState::Active }
    }

    #[test]
    fn test_single_runner_reuses_outer_transaction() {
        let storage = InMemoryMapStorage::new();
        let tree = test_tree();
        let mut tx = storage.begin(&tree).expect("begin should succeed");
        let outer_write_revision = tx.write_revision();
        let runner = SingleTxRunner::new(&mut *tx);

        let mut seen = Vec::new();
        runner
            .run(&mut |tx| {
                seen.push(tx.write_revision());
                Ok(())
            })
            .expect("job should succeed");
        runner
            .run(&mut |tx| {
                seen.push(tx.write_revision());
                Ok(())
            })
            .expect("job should succeed");

        assert_eq!(seen, vec![outer_write_revision, outer_write_revision]);
    }

    #[test]
    fn test_multi_runner_commits_per_job() {
        let storage = InMemoryMapStorage::new();
        let tree = test_tree();
        let runner = MultiTxRunner::new(Arc::new(storage), tree);

        let outcome = runner.run(&mut |tx| {
            assert_eq!(tx.write_revision(), 0);
            Ok(())
        });

        assert!(outcome.is_ok());
    }

    #[test]
    fn test_multi_runner_propagates_job_error() {
        let storage = InMemoryMapStorage::new();
        let runner = MultiTxRunner::new(Arc::new(storage), test_tree());

        let outcome =
            runner.run(&mut |_| Err(Error::Internal("boom".to_string())));

        assert_eq!(outcome, Err(Error::Internal("boom".to_string())));
    }
}
