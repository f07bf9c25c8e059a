//! Error types for the verimap library
//!
//! Every fallible operation in the crate reports one of the kinds below.
//! The kinds mirror the failure surface of the RPC layer: a transport
//! collaborator can map each variant onto its own status codes without
//! inspecting message strings.

use thiserror::Error;

/// The main error type for the verimap library
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// A request was malformed: bad index length, duplicate index, or a
    /// negative revision on a revision-qualified read.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A precondition for the operation does not hold: write-revision
    /// mismatch, hasher lookup failure, or a tree state that forbids the
    /// operation.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// The target already exists, e.g. initializing a map twice.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// A revision or leaf the API requires to be present is absent.
    /// Absent leaves in batched reads are not errors; they come back as
    /// empty leaves.
    #[error("not found: {0}")]
    NotFound(String),

    /// An internal invariant broke mid-request.
    #[error("internal: {0}")]
    Internal(String),

    /// Storage or signer unavailable, or the operation was cancelled.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The operation deadline expired.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The tree has no signed root yet and must be initialized first.
    /// The init path treats this as normal control flow; every other
    /// path surfaces it.
    #[error("map {0} needs initialization")]
    TreeNeedsInit(i64),
}

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;
