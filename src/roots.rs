//! Signed map roots and their wire encoding
//!
//! A [`MapRootV1`] commits to the full key/value state at one revision. It
//! travels inside a [`SignedMapRoot`]: the versioned binary encoding of the
//! root plus a signature over exactly those bytes. The encoding round-trips
//! bit-exactly, so verifying the signature and re-encoding the decoded root
//! always agree.

use ed25519_dalek::{Signature, Signer as _, Verifier as _};
pub use ed25519_dalek::{SigningKey, VerifyingKey};

use crate::errors::{Error, Result};

/// Version tag of the [`MapRootV1`] encoding
pub const MAP_ROOT_VERSION: u16 = 1;

/// The data portion of a signed map root
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MapRootV1 {
    /// Root hash of the sparse Merkle tree at this revision
    pub root_hash: Vec<u8>,
    /// Nanoseconds since the Unix epoch at which the root was produced
    pub timestamp_nanos: u64,
    /// Revision this root commits to
    pub revision: u64,
    /// Opaque caller metadata carried by the revision's write
    pub metadata: Vec<u8>,
}

impl MapRootV1 {
    /// Encodes the root into its versioned, length-prefixed binary form
    ///
    /// Layout: version (u16 BE), root hash length (u8) and bytes, timestamp
    /// (u64 BE), revision (u64 BE), metadata length (u16 BE) and bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.root_hash.len() > u8::MAX as usize {
            return Err(Error::Internal(format!(
                "root hash of {} bytes does not fit the encoding",
                self.root_hash.len()
            )));
        }
        if self.metadata.len() > u16::MAX as usize {
            return Err(Error::InvalidArgument(format!(
                "metadata of {} bytes does not fit the encoding",
                self.metadata.len()
            )));
        }
        let mut out = Vec::with_capacity(2 + 1 + self.root_hash.len() + 8 + 8 + 2 + self.metadata.len());
        out.extend_from_slice(&MAP_ROOT_VERSION.to_be_bytes());
        out.push(self.root_hash.len() as u8);
        out.extend_from_slice(&self.root_hash);
        out.extend_from_slice(&self.timestamp_nanos.to_be_bytes());
        out.extend_from_slice(&self.revision.to_be_bytes());
        out.extend_from_slice(&(self.metadata.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.metadata);
        Ok(out)
    }

    /// Decodes a root from its binary form
    ///
    /// Rejects unknown versions, truncated input, and trailing bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cursor = bytes;
        let version = u16::from_be_bytes(take_array(&mut cursor)?);
        if version != MAP_ROOT_VERSION {
            return Err(Error::Internal(format!("unknown map root version {version}")));
        }
        let hash_len = take(&mut cursor, 1)?[0] as usize;
        let root_hash = take(&mut cursor, hash_len)?.to_vec();
        let timestamp_nanos = u64::from_be_bytes(take_array(&mut cursor)?);
        let revision = u64::from_be_bytes(take_array(&mut cursor)?);
        let metadata_len = u16::from_be_bytes(take_array(&mut cursor)?) as usize;
        let metadata = take(&mut cursor, metadata_len)?.to_vec();
        if !cursor.is_empty() {
            return Err(Error::Internal(format!(
                "{} trailing bytes after map root",
                cursor.len()
            )));
        }
        Ok(Self { root_hash, timestamp_nanos, revision, metadata })
    }
}

fn take<'a>(cursor: &mut &'a [u8], len: usize) -> Result<&'a [u8]> {
    if cursor.len() < len {
        return Err(Error::Internal("truncated map root encoding".to_string()));
    }
    let (head, tail) = cursor.split_at(len);
    *cursor = tail;
    Ok(head)
}

fn take_array<const N: usize>(cursor: &mut &[u8]) -> Result<[u8; N]> {
    let mut out = [0u8; N];
    out.copy_from_slice(take(cursor, N)?);
    Ok(out)
}

/// Signed wire envelope around an encoded [`MapRootV1`]
///
/// Immutable once stored; readers verify the signature against the exact
/// `map_root` bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedMapRoot {
    /// The encoded [`MapRootV1`]
    pub map_root: Vec<u8>,
    /// Signature over `map_root`
    pub signature: Vec<u8>,
}

/// Trait for producing signed map roots
pub trait MapRootSigner: Send + Sync {
    /// Encodes and signs a map root
    fn sign_map_root(&self, root: &MapRootV1) -> Result<SignedMapRoot>;
}

/// Ed25519-backed map root signer
pub struct Ed25519MapRootSigner {
    key: SigningKey,
}

impl Ed25519MapRootSigner {
    /// Creates a signer from an existing signing key
    pub fn new(key: SigningKey) -> Self {
        Self { key }
    }

    /// Creates a signer from a 32-byte seed
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self { key: SigningKey::from_bytes(seed) }
    }

    /// Returns the verifying key matching this signer
    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }
}

impl MapRootSigner for Ed25519MapRootSigner {
    fn sign_map_root(&self, root: &MapRootV1) -> Result<SignedMapRoot> {
        let map_root = root.encode()?;
        let signature = self.key.sign(&map_root);
        Ok(SignedMapRoot { map_root, signature: signature.to_bytes().to_vec() })
    }
}

/// Verifies a signed map root and returns the decoded root on success
pub fn verify_signed_map_root(key: &VerifyingKey, root: &SignedMapRoot) -> Result<MapRootV1> {
    let signature = Signature::from_slice(&root.signature)
        .map_err(|e| Error::InvalidArgument(format!("malformed signature: {e}")))?;
    key.verify(&root.map_root, &signature)
        .map_err(|_| Error::InvalidArgument("signature verification failed".to_string()))?;
    MapRootV1::decode(&root.map_root)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_root() -> MapRootV1 {
        MapRootV1 {
            root_hash: vec![0xab; 32],
            timestamp_nanos: 1_234_567_890,
            revision: 42,
            metadata: b"batch-7".to_vec(),
        }
    }

    #[test]
    fn test_encode_decode_round_trip_is_bit_exact() {
        let root = sample_root();

        let encoded = root.encode().expect("encoding should succeed");
        let decoded = MapRootV1::decode(&encoded).expect("decoding should succeed");

        assert_eq!(decoded, root);
        assert_eq!(decoded.encode().expect("re-encoding should succeed"), encoded);
    }

    #[test]
    fn test_decode_rejects_bad_input() {
        let encoded = sample_root().encode().expect("encoding should succeed");

        assert!(MapRootV1::decode(&encoded[..encoded.len() - 1]).is_err());

        let mut trailing = encoded.clone();
        trailing.push(0);
        assert!(MapRootV1::decode(&trailing).is_err());

        let mut wrong_version = encoded;
        wrong_version[1] = 9;
        assert!(MapRootV1::decode(&wrong_version).is_err());
    }

    #[test]
    fn test_encode_rejects_oversized_metadata() {
        let root = MapRootV1 { metadata: vec![0u8; u16::MAX as usize + 1], ..sample_root() };

        assert!(matches!(root.encode(), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_sign_and_verify() {
        let signer = Ed25519MapRootSigner::from_seed(&[17u8; 32]);
        let root = sample_root();

        let signed = signer.sign_map_root(&root).expect("signing should succeed");
        let verified = verify_signed_map_root(&signer.verifying_key(), &signed)
            .expect("verification should succeed");

        assert_eq!(verified, root);
    }

    #[test]
    fn test_verify_rejects_tampered_root() {
        let signer = Ed25519MapRootSigner::from_seed(&[17u8; 32]);
        let mut signed = signer.sign_map_root(&sample_root()).expect("signing should succeed");
        signed.map_root[3] ^= 1;

        assert!(verify_signed_map_root(&signer.verifying_key(), &signed).is_err());
    }
}
