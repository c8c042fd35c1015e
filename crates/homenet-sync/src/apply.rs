//! Receiver-side application of incoming shared-profile updates.
//!
//! Incoming actions are idempotent so an at-least-once sender can replay
//! them freely: Add on an existing (neighbor, identity) becomes Change,
//! Change on a missing one becomes Add, Remove on a missing one is a
//! no-op.

use rusqlite::Connection;

use homenet_db::queries::{identities, neighbors};
use homenet_db::DbError;
use homenet_images::{ImageKind, ImageStore};
use homenet_proto::messages::{shared_profile_update_item::Action, SharedProfileUpdateItem};
use homenet_types::{IdentityId, NetworkId, ProfileScope};

use crate::{Result, SyncError};

/// Counts of what a batch did, for logging.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Applied {
    pub added: usize,
    pub changed: usize,
    pub removed: usize,
    pub refreshed: usize,
}

/// Apply one batch of updates from the neighbor `source`.
///
/// The whole batch runs in a single transaction; thumbnails are written to
/// the blob store first, so a rolled-back transaction at worst leaves an
/// orphan blob for the vacuum worker.
pub fn apply_batch(
    conn: &mut Connection,
    images: &ImageStore,
    source: &NetworkId,
    items: &[SharedProfileUpdateItem],
    now: u64,
) -> Result<Applied> {
    let mut counts = Applied::default();

    // Blob writes happen outside the transaction.
    let mut prepared = Vec::with_capacity(items.len());
    for item in items {
        prepared.push(prepare_item(images, source, item)?);
    }

    let tx = conn.transaction().map_err(DbError::Sqlite)?;
    for prepared_item in prepared {
        match prepared_item {
            Prepared::Upsert(profile) => {
                let exists =
                    identities::get_neighbor(&tx, &profile.identity_id, source).is_ok();
                if exists {
                    identities::update(&tx, &profile)?;
                    counts.changed += 1;
                } else {
                    identities::insert(&tx, &profile, now)?;
                    counts.added += 1;
                }
            }
            Prepared::Remove(identity_id) => {
                if identities::delete_neighbor_profile(&tx, &identity_id, source)? {
                    counts.removed += 1;
                }
            }
            Prepared::Refresh(_) => {
                counts.refreshed += 1;
            }
        }
    }
    let profile_count = identities::count_for_neighbor(&tx, source)?;
    neighbors::set_profile_count(&tx, source, profile_count)?;
    tx.commit().map_err(DbError::Sqlite)?;

    tracing::debug!(
        source = %source,
        added = counts.added,
        changed = counts.changed,
        removed = counts.removed,
        "shared profile batch applied"
    );
    Ok(counts)
}

enum Prepared {
    Upsert(homenet_types::Profile),
    Remove(IdentityId),
    Refresh(IdentityId),
}

fn prepare_item(
    images: &ImageStore,
    source: &NetworkId,
    item: &SharedProfileUpdateItem,
) -> Result<Prepared> {
    match &item.action {
        Some(Action::Add(add)) => {
            let info = add
                .profile
                .as_ref()
                .ok_or_else(|| SyncError::InvalidItem("add item without profile".into()))?;
            let mut profile = info
                .to_profile(ProfileScope::Neighbor(*source))
                .map_err(|e| SyncError::InvalidItem(e.to_string()))?;
            profile.thumbnail_image = save_thumbnail(images, &add.thumbnail)?;
            Ok(Prepared::Upsert(profile))
        }
        Some(Action::Change(change)) => {
            let info = change
                .profile
                .as_ref()
                .ok_or_else(|| SyncError::InvalidItem("change item without profile".into()))?;
            let mut profile = info
                .to_profile(ProfileScope::Neighbor(*source))
                .map_err(|e| SyncError::InvalidItem(e.to_string()))?;
            profile.thumbnail_image = save_thumbnail(images, &change.thumbnail)?;
            Ok(Prepared::Upsert(profile))
        }
        Some(Action::Remove(remove)) => {
            let id = IdentityId::from_slice(&remove.identity_id)
                .map_err(|e| SyncError::InvalidItem(e.to_string()))?;
            Ok(Prepared::Remove(id))
        }
        Some(Action::Refresh(refresh)) => {
            let id = IdentityId::from_slice(&refresh.identity_id)
                .map_err(|e| SyncError::InvalidItem(e.to_string()))?;
            Ok(Prepared::Refresh(id))
        }
        None => Err(SyncError::InvalidItem("item without action".into())),
    }
}

fn save_thumbnail(
    images: &ImageStore,
    thumbnail: &[u8],
) -> Result<Option<homenet_types::ImageHandle>> {
    if thumbnail.is_empty() {
        return Ok(None);
    }
    if thumbnail.len() > ImageKind::Thumbnail.max_bytes() {
        return Err(SyncError::InvalidItem(format!(
            "thumbnail of {} bytes",
            thumbnail.len()
        )));
    }
    // Content addressing makes this write race-free against concurrent
    // batches carrying the same bytes.
    let handle = ImageStore::handle_for(thumbnail);
    std::fs::create_dir_all(images.root())?;
    let shard = images.root().join(&handle.to_hex()[..2]);
    std::fs::create_dir_all(&shard)?;
    let path = shard.join(format!("{}.dat", handle.to_hex()));
    if !path.exists() {
        std::fs::write(&path, thumbnail)?;
    }
    Ok(Some(handle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use homenet_proto::messages::{
        ProfileInformation, SemVer, SharedProfileAddItem, SharedProfileChangeItem,
        SharedProfileRemoveItem,
    };

    fn nid(byte: u8) -> NetworkId {
        NetworkId::from_bytes([byte; 32])
    }

    fn wire_profile(byte: u8, name: &str) -> ProfileInformation {
        ProfileInformation {
            version: Some(SemVer {
                major: 1,
                minor: 0,
                patch: 0,
            }),
            public_key: vec![byte; 32],
            profile_type: "IoP.Person".to_string(),
            name: name.to_string(),
            latitude_e7: 500_000_000,
            longitude_e7: 140_000_000,
            extra_data: String::new(),
            profile_image_hash: Vec::new(),
            thumbnail_image_hash: Vec::new(),
        }
    }

    fn add(byte: u8, name: &str) -> SharedProfileUpdateItem {
        SharedProfileUpdateItem {
            action: Some(Action::Add(SharedProfileAddItem {
                profile: Some(wire_profile(byte, name)),
                thumbnail: Vec::new(),
            })),
        }
    }

    fn change(byte: u8, name: &str) -> SharedProfileUpdateItem {
        SharedProfileUpdateItem {
            action: Some(Action::Change(SharedProfileChangeItem {
                profile: Some(wire_profile(byte, name)),
                thumbnail: Vec::new(),
            })),
        }
    }

    fn remove(byte: u8) -> SharedProfileUpdateItem {
        SharedProfileUpdateItem {
            action: Some(Action::Remove(SharedProfileRemoveItem {
                identity_id: homenet_crypto::identity_id(&[byte; 32])
                    .as_bytes()
                    .to_vec(),
            })),
        }
    }

    async fn setup() -> (tempfile::TempDir, rusqlite::Connection, ImageStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let conn = homenet_db::open_memory().expect("open db");
        let images = ImageStore::open(dir.path().join("images"))
            .await
            .expect("open images");
        homenet_db::queries::neighbors::upsert(&conn, &nid(9), "h", 1, 0, 100).expect("neighbor");
        (dir, conn, images)
    }

    #[tokio::test]
    async fn test_add_then_replay_becomes_change() {
        let (_dir, mut conn, images) = setup().await;

        let counts =
            apply_batch(&mut conn, &images, &nid(9), &[add(1, "Alice")], 100).expect("apply");
        assert_eq!(counts.added, 1);

        // Replaying the same Add is idempotent: it lands as a Change.
        let counts =
            apply_batch(&mut conn, &images, &nid(9), &[add(1, "Alice")], 101).expect("apply");
        assert_eq!(counts.added, 0);
        assert_eq!(counts.changed, 1);
    }

    #[tokio::test]
    async fn test_change_on_missing_becomes_add() {
        let (_dir, mut conn, images) = setup().await;
        let counts =
            apply_batch(&mut conn, &images, &nid(9), &[change(1, "Alice")], 100).expect("apply");
        assert_eq!(counts.added, 1);
        assert_eq!(counts.changed, 0);
    }

    #[tokio::test]
    async fn test_refresh_is_a_counted_noop() {
        let (_dir, mut conn, images) = setup().await;
        apply_batch(&mut conn, &images, &nid(9), &[add(1, "Alice")], 100).expect("apply");

        let refresh = SharedProfileUpdateItem {
            action: Some(Action::Refresh(
                homenet_proto::messages::SharedProfileRefreshItem {
                    identity_id: homenet_crypto::identity_id(&[1u8; 32])
                        .as_bytes()
                        .to_vec(),
                },
            )),
        };
        let counts = apply_batch(&mut conn, &images, &nid(9), &[refresh], 101).expect("apply");
        assert_eq!(counts.refreshed, 1);
        assert_eq!(counts.changed, 0);

        let id = homenet_crypto::identity_id(&[1u8; 32]);
        let profile = identities::get_neighbor(&conn, &id, &nid(9)).expect("get");
        assert_eq!(profile.name, "Alice");
    }

    #[tokio::test]
    async fn test_remove_on_missing_is_noop() {
        let (_dir, mut conn, images) = setup().await;
        let counts = apply_batch(&mut conn, &images, &nid(9), &[remove(1)], 100).expect("apply");
        assert_eq!(counts.removed, 0);
    }

    #[tokio::test]
    async fn test_full_cycle_updates_profile_count() {
        let (_dir, mut conn, images) = setup().await;
        apply_batch(
            &mut conn,
            &images,
            &nid(9),
            &[add(1, "Alice"), add(2, "Bob")],
            100,
        )
        .expect("apply");
        let neighbor = homenet_db::queries::neighbors::get(&conn, &nid(9)).expect("get");
        assert_eq!(neighbor.profile_count, 2);

        apply_batch(&mut conn, &images, &nid(9), &[remove(1)], 101).expect("apply");
        let neighbor = homenet_db::queries::neighbors::get(&conn, &nid(9)).expect("get");
        assert_eq!(neighbor.profile_count, 1);
    }

    #[tokio::test]
    async fn test_change_updates_fields() {
        let (_dir, mut conn, images) = setup().await;
        apply_batch(&mut conn, &images, &nid(9), &[add(1, "Alice")], 100).expect("apply");
        apply_batch(&mut conn, &images, &nid(9), &[change(1, "Alicia")], 101).expect("apply");

        let id = homenet_crypto::identity_id(&[1u8; 32]);
        let profile = identities::get_neighbor(&conn, &id, &nid(9)).expect("get");
        assert_eq!(profile.name, "Alicia");
    }

    #[tokio::test]
    async fn test_thumbnail_saved_and_referenced() {
        let (_dir, mut conn, images) = setup().await;
        let thumb = vec![5u8; 64];
        let item = SharedProfileUpdateItem {
            action: Some(Action::Add(SharedProfileAddItem {
                profile: Some(wire_profile(1, "Alice")),
                thumbnail: thumb.clone(),
            })),
        };
        apply_batch(&mut conn, &images, &nid(9), &[item], 100).expect("apply");

        let id = homenet_crypto::identity_id(&[1u8; 32]);
        let profile = identities::get_neighbor(&conn, &id, &nid(9)).expect("get");
        let handle = profile.thumbnail_image.expect("thumbnail handle");
        assert_eq!(images.load(&handle).await.expect("load"), thumb);
    }

    #[tokio::test]
    async fn test_invalid_item_rejects_batch() {
        let (_dir, mut conn, images) = setup().await;
        let bad = SharedProfileUpdateItem { action: None };
        assert!(matches!(
            apply_batch(&mut conn, &images, &nid(9), &[bad], 100),
            Err(SyncError::InvalidItem(_))
        ));
    }
}
