//! Building and enqueueing replication actions.
//!
//! The payload of every queue row is the prost-encoded
//! [`SharedProfileUpdateItem`] snapshot taken at enqueue time. Callers run
//! these functions on the same connection (transaction) as the profile
//! mutation that caused them.

use prost::Message as _;
use rusqlite::Connection;

use homenet_db::queries::{actions, followers};
use homenet_db::queries::actions::ActionKind;
use homenet_images::ImageStore;
use homenet_proto::messages::{
    shared_profile_update_item, ProfileInformation, SharedProfileAddItem, SharedProfileChangeItem,
    SharedProfileRefreshItem, SharedProfileRemoveItem, SharedProfileUpdateItem,
};
use homenet_types::{IdentityId, Profile};

use crate::Result;

/// Build the wire form of a stored profile, recomputing image hashes from
/// the blobs on disk. Missing blobs yield empty hashes rather than errors;
/// the row is the source of truth.
pub fn wire_profile(images: &ImageStore, profile: &Profile) -> ProfileInformation {
    let image_hash = profile
        .profile_image
        .and_then(|h| images.load_blocking(&h).ok())
        .map(|data| homenet_crypto::sha256(&data).to_vec())
        .unwrap_or_default();
    let thumbnail_hash = profile
        .thumbnail_image
        .and_then(|h| images.load_blocking(&h).ok())
        .map(|data| homenet_crypto::sha256(&data).to_vec())
        .unwrap_or_default();
    ProfileInformation::from_profile(profile, image_hash, thumbnail_hash)
}

/// Thumbnail bytes for a profile, empty if it has none.
pub fn thumbnail_bytes(images: &ImageStore, profile: &Profile) -> Vec<u8> {
    profile
        .thumbnail_image
        .and_then(|h| images.load_blocking(&h).ok())
        .unwrap_or_default()
}

/// Build an AddProfile item.
pub fn add_item(images: &ImageStore, profile: &Profile) -> SharedProfileUpdateItem {
    SharedProfileUpdateItem {
        action: Some(shared_profile_update_item::Action::Add(
            SharedProfileAddItem {
                profile: Some(wire_profile(images, profile)),
                thumbnail: thumbnail_bytes(images, profile),
            },
        )),
    }
}

/// Build a ChangeProfile item.
pub fn change_item(images: &ImageStore, profile: &Profile) -> SharedProfileUpdateItem {
    SharedProfileUpdateItem {
        action: Some(shared_profile_update_item::Action::Change(
            SharedProfileChangeItem {
                profile: Some(wire_profile(images, profile)),
                thumbnail: thumbnail_bytes(images, profile),
            },
        )),
    }
}

/// Build a RemoveProfile item.
pub fn remove_item(identity_id: &IdentityId) -> SharedProfileUpdateItem {
    SharedProfileUpdateItem {
        action: Some(shared_profile_update_item::Action::Remove(
            SharedProfileRemoveItem {
                identity_id: identity_id.as_bytes().to_vec(),
            },
        )),
    }
}

/// Build a RefreshProfile keep-alive item.
pub fn refresh_item(identity_id: &IdentityId) -> SharedProfileUpdateItem {
    SharedProfileUpdateItem {
        action: Some(shared_profile_update_item::Action::Refresh(
            SharedProfileRefreshItem {
                identity_id: identity_id.as_bytes().to_vec(),
            },
        )),
    }
}

/// The queue kind matching an item.
fn kind_of(item: &SharedProfileUpdateItem) -> ActionKind {
    match item.action {
        Some(shared_profile_update_item::Action::Add(_)) => ActionKind::AddProfile,
        Some(shared_profile_update_item::Action::Change(_)) => ActionKind::ChangeProfile,
        Some(shared_profile_update_item::Action::Remove(_)) => ActionKind::RemoveProfile,
        Some(shared_profile_update_item::Action::Refresh(_)) | None => ActionKind::RefreshProfile,
    }
}

/// Enqueue one item for every current follower. Returns the number of
/// rows enqueued. Run inside the mutation's transaction.
pub fn enqueue_for_all_followers(
    conn: &Connection,
    identity_id: &IdentityId,
    item: &SharedProfileUpdateItem,
    now: u64,
) -> Result<usize> {
    let payload = item.encode_to_vec();
    let kind = kind_of(item);
    let mut enqueued = 0;
    for follower in followers::list(conn)? {
        actions::enqueue(
            conn,
            &follower.network_id,
            &follower.endpoint(),
            kind,
            Some(identity_id),
            &payload,
            now,
        )?;
        enqueued += 1;
    }
    Ok(enqueued)
}
