//! # homenet-crypto
//!
//! Cryptographic primitives for the homenet profile server:
//!
//! - **Ed25519** signing and verification via [`ed25519`]
//! - **SHA-1** identity-id derivation and **SHA-256** digests via [`digest`]
//!
//! Identities on the network are Ed25519 keys; an identity id is the 20-byte
//! SHA-1 of the public key, and a server's network id is its own Ed25519
//! public key. SHA-256 is used for image integrity checks and the service
//! tag the server registers with the location service.

pub mod digest;
pub mod ed25519;

pub use digest::{identity_id, service_tag, sha256};
pub use ed25519::{KeyPair, Signature, SigningKey, VerifyingKey};

use homenet_types::NetworkId;

/// A server's network identity: its Ed25519 keypair and the 32-byte
/// network id, which is the public key itself.
pub struct NodeKeys {
    pub keypair: KeyPair,
    pub network_id: NetworkId,
}

impl NodeKeys {
    /// Wrap a keypair.
    pub fn new(keypair: KeyPair) -> Self {
        let network_id = NetworkId::from_bytes(keypair.verifying_key.to_bytes());
        Self {
            keypair,
            network_id,
        }
    }
}

/// Error types for cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Malformed key or signature bytes.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Signature did not verify.
    #[error("signature verification failed")]
    SignatureVerification,
}

/// Result type alias for cryptographic operations.
pub type Result<T> = std::result::Result<T, CryptoError>;
