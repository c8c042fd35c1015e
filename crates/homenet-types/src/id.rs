//! Fixed-size identifier newtypes.

use serde::{Deserialize, Serialize};

use crate::{Result, TypesError};

/// A 20-byte identity identifier, `SHA-1(public key)`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityId([u8; 20]);

/// A 32-byte network identifier of a profile server: its Ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NetworkId([u8; 32]);

/// An opaque 128-bit handle naming an image blob on disk.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageHandle([u8; 16]);

impl IdentityId {
    /// Wrap raw identifier bytes.
    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Parse an identifier from a byte slice.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 20] = bytes
            .try_into()
            .map_err(|_| TypesError::invalid("identity_id", format!("{} bytes", bytes.len())))?;
        Ok(Self(arr))
    }

    /// Raw identifier bytes.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl NetworkId {
    /// Wrap raw identifier bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse an identifier from a byte slice.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| TypesError::invalid("network_id", format!("{} bytes", bytes.len())))?;
        Ok(Self(arr))
    }

    /// Raw identifier bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl ImageHandle {
    /// Wrap raw handle bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Parse a handle from a byte slice.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 16] = bytes
            .try_into()
            .map_err(|_| TypesError::invalid("image_handle", format!("{} bytes", bytes.len())))?;
        Ok(Self(arr))
    }

    /// Raw handle bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Lowercase hex form used for on-disk file names.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Debug for IdentityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IdentityId({})", hex::encode(self.0))
    }
}

impl std::fmt::Display for IdentityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for NetworkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NetworkId({})", hex::encode(self.0))
    }
}

impl std::fmt::Display for NetworkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for ImageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ImageHandle({})", hex::encode(self.0))
    }
}

impl std::fmt::Display for ImageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_id_roundtrip() {
        let id = IdentityId::from_bytes([7u8; 20]);
        let restored = IdentityId::from_slice(id.as_bytes()).expect("valid slice");
        assert_eq!(id, restored);
    }

    #[test]
    fn test_identity_id_wrong_length() {
        assert!(IdentityId::from_slice(&[0u8; 19]).is_err());
        assert!(IdentityId::from_slice(&[0u8; 21]).is_err());
    }

    #[test]
    fn test_network_id_wrong_length() {
        assert!(NetworkId::from_slice(&[0u8; 20]).is_err());
    }

    #[test]
    fn test_image_handle_hex() {
        let handle = ImageHandle::from_bytes([0xAB; 16]);
        assert_eq!(handle.to_hex(), "ab".repeat(16));
    }
}
