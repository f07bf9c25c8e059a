//! Sparse Merkle tree engine
//!
//! The tree is a binary Merkle tree whose depth equals the hash bit length;
//! leaves are indexed by fixed-width byte strings and absent subtrees have
//! deterministic empty hashes. This module provides node addressing, batch
//! inclusion-proof generation, revision updates, and proof verification.

pub mod node;
pub mod proof;
pub mod reader;
pub mod runner;
pub mod writer;

pub use node::{bit_at, Node, NodeId};
pub use proof::verify_inclusion_proof;
pub use reader::SmtReader;
pub use runner::{MultiTxRunner, SingleTxRunner, TxRunner};
pub use writer::SmtWriter;
