//! The profile record shared by the repository, server, and replicator.

use serde::{Deserialize, Serialize};

use crate::{
    GpsLocation, IdentityId, ImageHandle, NetworkId, Result, TypesError, MAX_EXTRA_DATA_BYTES,
    MAX_NAME_BYTES, MAX_PUBLIC_KEY_BYTES, MAX_TYPE_BYTES, MIN_PUBLIC_KEY_BYTES,
};

/// Semantic profile version. `(0, 0, 0)` means the owner has never
/// initialized the profile.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProfileVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ProfileVersion {
    /// Construct a version triple.
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Whether the profile has ever been initialized by its owner.
    pub fn is_initialized(&self) -> bool {
        *self != Self::default()
    }
}

impl std::fmt::Display for ProfileVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Whether a profile is hosted locally or mirrored from a neighbor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProfileScope {
    /// We answer for the owner of this profile.
    Hosted,
    /// Mirrored from the neighbor with the given network id.
    Neighbor(NetworkId),
}

/// A stored identity profile.
#[derive(Clone, Debug, PartialEq)]
pub struct Profile {
    /// `SHA-1(public_key)`, the primary key.
    pub identity_id: IdentityId,
    /// Ed25519 public key of the owner (32-256 bytes).
    pub public_key: Vec<u8>,
    /// Profile type, e.g. `"IoP.Person"`.
    pub profile_type: String,
    /// Display name. Required but may be the empty string.
    pub name: String,
    /// Owner-assigned version; `0.0.0` until first update.
    pub version: ProfileVersion,
    /// Initial GPS location.
    pub location: GpsLocation,
    /// Free-form extra data.
    pub extra_data: String,
    /// Handle of the full-size profile image, if any.
    pub profile_image: Option<ImageHandle>,
    /// Handle of the thumbnail image, if any.
    pub thumbnail_image: Option<ImageHandle>,
    /// Unix timestamp after which the hosting agreement is expired.
    /// `None` means active. Always `None` for neighbor profiles.
    pub expires_at: Option<u64>,
    /// Hosted or mirrored-from-neighbor.
    pub scope: ProfileScope,
}

impl Profile {
    /// Validate field bounds against the documented limits.
    pub fn validate(&self) -> Result<()> {
        if self.public_key.len() < MIN_PUBLIC_KEY_BYTES
            || self.public_key.len() > MAX_PUBLIC_KEY_BYTES
        {
            return Err(TypesError::invalid(
                "public_key",
                format!("{} bytes", self.public_key.len()),
            ));
        }
        if self.name.len() > MAX_NAME_BYTES {
            return Err(TypesError::invalid(
                "name",
                format!("{} bytes", self.name.len()),
            ));
        }
        if self.profile_type.len() > MAX_TYPE_BYTES {
            return Err(TypesError::invalid(
                "profile_type",
                format!("{} bytes", self.profile_type.len()),
            ));
        }
        if self.extra_data.len() > MAX_EXTRA_DATA_BYTES {
            return Err(TypesError::invalid(
                "extra_data",
                format!("{} bytes", self.extra_data.len()),
            ));
        }
        Ok(())
    }

    /// Source neighbor id, or `None` for hosted profiles.
    pub fn host_node_id(&self) -> Option<NetworkId> {
        match self.scope {
            ProfileScope::Hosted => None,
            ProfileScope::Neighbor(id) => Some(id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Profile {
        Profile {
            identity_id: IdentityId::from_bytes([1u8; 20]),
            public_key: vec![2u8; 32],
            profile_type: "IoP.Person".to_string(),
            name: "Alice".to_string(),
            version: ProfileVersion::new(1, 0, 0),
            location: GpsLocation::new(50.08, 14.43).expect("valid location"),
            extra_data: String::new(),
            profile_image: None,
            thumbnail_image: None,
            expires_at: None,
            scope: ProfileScope::Hosted,
        }
    }

    #[test]
    fn test_valid_profile() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn test_name_too_long() {
        let mut p = sample();
        p.name = "x".repeat(MAX_NAME_BYTES + 1);
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_empty_name_allowed() {
        let mut p = sample();
        p.name = String::new();
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_type_too_long() {
        let mut p = sample();
        p.profile_type = "x".repeat(MAX_TYPE_BYTES + 1);
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_extra_data_too_long() {
        let mut p = sample();
        p.extra_data = "x".repeat(MAX_EXTRA_DATA_BYTES + 1);
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_public_key_bounds() {
        let mut p = sample();
        p.public_key = vec![0u8; MIN_PUBLIC_KEY_BYTES - 1];
        assert!(p.validate().is_err());
        p.public_key = vec![0u8; MAX_PUBLIC_KEY_BYTES + 1];
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_version_initialized() {
        assert!(!ProfileVersion::default().is_initialized());
        assert!(ProfileVersion::new(0, 0, 1).is_initialized());
    }

    #[test]
    fn test_version_ordering() {
        assert!(ProfileVersion::new(1, 2, 0) > ProfileVersion::new(1, 1, 9));
    }

    #[test]
    fn test_host_node_id() {
        let mut p = sample();
        assert_eq!(p.host_node_id(), None);
        let nid = NetworkId::from_bytes([9u8; 32]);
        p.scope = ProfileScope::Neighbor(nid);
        assert_eq!(p.host_node_id(), Some(nid));
    }
}
