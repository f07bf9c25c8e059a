//! Request and response messages for the map server operations
//!
//! These are the handler-level message shapes; the transport collaborator
//! maps them onto its own wire format. Every request carries the map id of
//! the tree it addresses.

use crate::roots::SignedMapRoot;
use crate::types::{MapLeaf, MapLeafInclusion, TreeId};

/// Request to initialize a map with its revision 0 root
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InitMapRequest {
    /// Target map
    pub map_id: TreeId,
}

/// Response to [`InitMapRequest`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InitMapResponse {
    /// The freshly created revision 0 root
    pub created: SignedMapRoot,
}

/// Request for the latest signed map root
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetSignedMapRootRequest {
    /// Target map
    pub map_id: TreeId,
}

/// Request for the signed map root at one revision
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetSignedMapRootByRevisionRequest {
    /// Target map
    pub map_id: TreeId,
    /// Requested revision; must be non-negative
    pub revision: i64,
}

/// Response carrying one signed map root
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetSignedMapRootResponse {
    /// The requested root
    pub map_root: SignedMapRoot,
}

/// Request for one leaf at the latest revision
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetMapLeafRequest {
    /// Target map
    pub map_id: TreeId,
    /// Leaf index
    pub index: Vec<u8>,
}

/// Request for one leaf at a specific revision
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetMapLeafByRevisionRequest {
    /// Target map
    pub map_id: TreeId,
    /// Leaf index
    pub index: Vec<u8>,
    /// Requested revision; must be non-negative
    pub revision: i64,
}

/// Response carrying one leaf with its proof
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetMapLeafResponse {
    /// Root the proof verifies against
    pub map_root: SignedMapRoot,
    /// The leaf and its inclusion path
    pub inclusion: MapLeafInclusion,
}

/// Request for a batch of leaves at the latest revision
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetMapLeavesRequest {
    /// Target map
    pub map_id: TreeId,
    /// Leaf indices; each must have the hasher's size and be unique
    pub indices: Vec<Vec<u8>>,
}

/// Request for a batch of leaves at a specific revision
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetMapLeavesByRevisionRequest {
    /// Target map
    pub map_id: TreeId,
    /// Leaf indices; each must have the hasher's size and be unique
    pub indices: Vec<Vec<u8>>,
    /// Requested revision; must be non-negative
    pub revision: i64,
}

/// Response carrying a batch of leaves with proofs
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetMapLeavesResponse {
    /// Root the proofs verify against
    pub map_root: SignedMapRoot,
    /// One inclusion per requested index, in request order
    pub inclusions: Vec<MapLeafInclusion>,
}

/// Response carrying a batch of leaves without proofs
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MapLeavesResponse {
    /// The stored leaves with `leaf_hash` stripped
    pub leaves: Vec<MapLeaf>,
}

/// Request to write one new revision
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SetMapLeavesRequest {
    /// Target map
    pub map_id: TreeId,
    /// Leaves to set; `leaf_hash` is ignored on input
    pub leaves: Vec<MapLeaf>,
    /// Opaque metadata recorded in the new signed root
    pub metadata: Vec<u8>,
    /// When non-zero, the write fails unless it lands at exactly this
    /// revision; zero means no assertion
    pub expected_revision: i64,
}

/// Response to [`SetMapLeavesRequest`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SetMapLeavesResponse {
    /// The signed root of the new revision
    pub map_root: SignedMapRoot,
}
