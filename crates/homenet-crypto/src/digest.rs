//! Digest helpers: SHA-1 identity ids, SHA-256 image and service tags.

use sha1::{Digest as _, Sha1};
use sha2::Sha256;

use homenet_types::IdentityId;

/// Derive an identity id from a public key.
///
/// `identity_id = SHA-1(public_key)`, 20 bytes. The public key may be any
/// length the wire accepts; derivation never fails.
pub fn identity_id(public_key: &[u8]) -> IdentityId {
    let digest = Sha1::digest(public_key);
    let mut bytes = [0u8; 20];
    bytes.copy_from_slice(&digest);
    IdentityId::from_bytes(bytes)
}

/// SHA-256 of arbitrary bytes, used for image integrity checks.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let digest = Sha256::digest(data);
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&digest);
    bytes
}

/// The service tag registered with the location service:
/// `SHA-256(network public key)`.
pub fn service_tag(network_public_key: &[u8]) -> [u8; 32] {
    sha256(network_public_key)
}
