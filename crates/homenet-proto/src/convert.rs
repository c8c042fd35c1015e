//! Conversions between wire messages and domain types.

use homenet_crypto::identity_id;
use homenet_types::{GpsLocation, Profile, ProfileScope, ProfileVersion, TypesError};

use crate::messages::{ProfileInformation, SemVer};

impl From<ProfileVersion> for SemVer {
    fn from(v: ProfileVersion) -> Self {
        Self {
            major: v.major,
            minor: v.minor,
            patch: v.patch,
        }
    }
}

impl From<SemVer> for ProfileVersion {
    fn from(v: SemVer) -> Self {
        Self::new(v.major, v.minor, v.patch)
    }
}

impl ProfileInformation {
    /// Build the wire form of a stored profile. Image hashes are supplied
    /// by the caller, which has the blob bytes at hand; the stored handle
    /// is a truncation and cannot reproduce them.
    pub fn from_profile(
        profile: &Profile,
        profile_image_hash: Vec<u8>,
        thumbnail_image_hash: Vec<u8>,
    ) -> Self {
        Self {
            version: Some(profile.version.into()),
            public_key: profile.public_key.clone(),
            profile_type: profile.profile_type.clone(),
            name: profile.name.clone(),
            latitude_e7: profile.location.latitude_e7(),
            longitude_e7: profile.location.longitude_e7(),
            extra_data: profile.extra_data.clone(),
            profile_image_hash,
            thumbnail_image_hash,
        }
    }

    /// Validate the wire form and build a domain profile. The identity id
    /// is derived from the public key; image handles are assigned later by
    /// whoever stores the blobs.
    pub fn to_profile(&self, scope: ProfileScope) -> Result<Profile, TypesError> {
        let location = GpsLocation::from_e7(self.latitude_e7, self.longitude_e7)?;
        let profile = Profile {
            identity_id: identity_id(&self.public_key),
            public_key: self.public_key.clone(),
            profile_type: self.profile_type.clone(),
            name: self.name.clone(),
            version: self.version.map(Into::into).unwrap_or_default(),
            location,
            extra_data: self.extra_data.clone(),
            profile_image: None,
            thumbnail_image: None,
            expires_at: None,
            scope,
        };
        profile.validate()?;
        Ok(profile)
    }
}
