#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Verimap
//!
//! An authenticated, versioned key/value store backed by a sparse Merkle
//! tree. Leaves are set in batches, each batch committing one new revision
//! summarized by a signed root; reads return leaves together with
//! cryptographic inclusion proofs against the signed root of the requested
//! revision.
//!
//! The crate is organized leaves-first:
//!
//! - [`hasher`]: leaf, interior-node, and empty-subtree hashing;
//! - [`storage`]: snapshots and serializable read-write transactions over
//!   one tree;
//! - [`smt`]: node addressing, batched inclusion proofs, revision updates,
//!   and proof verification;
//! - [`server`]: the operation handlers orchestrating validation, storage
//!   sessions, the tree engine, and the signer;
//! - [`admin`], [`roots`], [`metrics`], [`context`]: the collaborator
//!   contracts those layers are built against.

pub mod admin;
pub mod context;
pub mod errors;
pub mod hasher;
pub mod metrics;
pub mod roots;
pub mod server;
pub mod smt;
pub mod storage;
pub mod types;

pub use context::OpContext;
pub use errors::{Error, Result};
pub use types::Bytes32;
