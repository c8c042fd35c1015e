//! # homenet-types
//!
//! Shared domain types for the homenet profile server: identifiers, GPS
//! locations, and the profile record with its field limits.

pub mod id;
pub mod location;
pub mod profile;

pub use id::{IdentityId, ImageHandle, NetworkId};
pub use location::GpsLocation;
pub use profile::{Profile, ProfileScope, ProfileVersion};

/// Maximum profile name length in UTF-8 bytes.
pub const MAX_NAME_BYTES: usize = 64;

/// Maximum profile type length in UTF-8 bytes.
pub const MAX_TYPE_BYTES: usize = 32;

/// Maximum extra-data length in UTF-8 bytes.
pub const MAX_EXTRA_DATA_BYTES: usize = 200;

/// Maximum profile image size in bytes (20 KiB).
pub const MAX_PROFILE_IMAGE_BYTES: usize = 20 * 1024;

/// Maximum thumbnail image size in bytes (5 KiB).
pub const MAX_THUMBNAIL_IMAGE_BYTES: usize = 5 * 1024;

/// Maximum relationship-card payload in bytes.
pub const MAX_RELATIONSHIP_PAYLOAD_BYTES: usize = 200;

/// Minimum accepted public key length in bytes.
pub const MIN_PUBLIC_KEY_BYTES: usize = 32;

/// Maximum accepted public key length in bytes.
pub const MAX_PUBLIC_KEY_BYTES: usize = 256;

/// Error type for domain value validation.
#[derive(Debug, thiserror::Error)]
pub enum TypesError {
    /// A field was outside its documented bounds.
    #[error("invalid value for {field}: {reason}")]
    InvalidValue {
        /// Name of the offending field.
        field: &'static str,
        /// Human-readable reason.
        reason: String,
    },
}

/// Result type alias for domain validation.
pub type Result<T> = std::result::Result<T, TypesError>;

impl TypesError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}
