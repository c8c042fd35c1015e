//! # homenet-images
//!
//! Content-addressed image blob store.
//!
//! Each blob lives at `images/<first-2-hex>/<handle>.dat`, where the
//! handle is the first 16 bytes of the blob's SHA-256 — saving the same
//! bytes twice yields the same handle and one file. Writes are atomic:
//! the bytes go to a temp file, the temp file is fsynced and renamed into
//! place, and the parent directory is fsynced so a crash cannot leave a
//! half-written blob behind a live handle. Size caps are enforced before
//! anything touches the disk.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;

use homenet_crypto::sha256;
use homenet_types::{ImageHandle, MAX_PROFILE_IMAGE_BYTES, MAX_THUMBNAIL_IMAGE_BYTES};

/// Which cap applies to a stored image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageKind {
    /// Full-size profile image, at most 20 KiB.
    Profile,
    /// Thumbnail, at most 5 KiB.
    Thumbnail,
}

impl ImageKind {
    /// The size cap in bytes for this kind.
    pub fn max_bytes(&self) -> usize {
        match self {
            Self::Profile => MAX_PROFILE_IMAGE_BYTES,
            Self::Thumbnail => MAX_THUMBNAIL_IMAGE_BYTES,
        }
    }
}

/// Error types for blob-store operations.
#[derive(Debug, thiserror::Error)]
pub enum ImageStoreError {
    /// Body exceeds the cap for its kind.
    #[error("image too large: {size} bytes, max {max}")]
    TooLarge { size: usize, max: usize },

    /// No blob under that handle.
    #[error("image not found: {0}")]
    NotFound(ImageHandle),

    /// Underlying filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for blob-store operations.
pub type Result<T> = std::result::Result<T, ImageStoreError>;

/// The on-disk image blob store.
#[derive(Clone, Debug)]
pub struct ImageStore {
    root: PathBuf,
}

impl ImageStore {
    /// Open a store rooted at the given directory, creating it if needed.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Derive the content-addressed handle for image bytes.
    pub fn handle_for(data: &[u8]) -> ImageHandle {
        let digest = sha256(data);
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        ImageHandle::from_bytes(bytes)
    }

    fn blob_path(&self, handle: &ImageHandle) -> PathBuf {
        let name = handle.to_hex();
        self.root.join(&name[..2]).join(format!("{name}.dat"))
    }

    /// Store image bytes, enforcing the cap for `kind`, and return the
    /// content-addressed handle. Saving bytes that are already stored is
    /// a no-op returning the same handle.
    pub async fn save(&self, kind: ImageKind, data: &[u8]) -> Result<ImageHandle> {
        if data.len() > kind.max_bytes() {
            return Err(ImageStoreError::TooLarge {
                size: data.len(),
                max: kind.max_bytes(),
            });
        }

        let handle = Self::handle_for(data);
        let path = self.blob_path(&handle);
        if tokio::fs::try_exists(&path).await? {
            return Ok(handle);
        }

        let parent = path
            .parent()
            .ok_or_else(|| std::io::Error::other("blob path has no parent"))?
            .to_path_buf();
        tokio::fs::create_dir_all(&parent).await?;

        let tmp = parent.join(format!("{}.tmp", handle.to_hex()));
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);

        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        sync_dir(&parent).await?;

        tracing::debug!(%handle, bytes = data.len(), "image blob stored");
        Ok(handle)
    }

    /// Read a blob synchronously. For callers that cannot await, such as
    /// code building replication payloads inside a database transaction;
    /// blobs are at most 20 KiB so the stall is negligible.
    pub fn load_blocking(&self, handle: &ImageHandle) -> Result<Vec<u8>> {
        match std::fs::read(self.blob_path(handle)) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ImageStoreError::NotFound(*handle))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read a blob back.
    pub async fn load(&self, handle: &ImageHandle) -> Result<Vec<u8>> {
        match tokio::fs::read(self.blob_path(handle)).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ImageStoreError::NotFound(*handle))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Whether a blob exists.
    pub async fn exists(&self, handle: &ImageHandle) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.blob_path(handle)).await?)
    }

    /// Unlink a blob and fsync its parent directory. Removing a missing
    /// blob is a no-op.
    pub async fn remove(&self, handle: &ImageHandle) -> Result<()> {
        let path = self.blob_path(handle);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                if let Some(parent) = path.parent() {
                    sync_dir(parent).await?;
                }
                tracing::debug!(%handle, "image blob removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete every blob whose handle is not in `live`. Returns the number
    /// of blobs removed. Stray temp files are cleaned up as well.
    pub async fn gc_orphans(&self, live: &HashSet<ImageHandle>) -> Result<usize> {
        let mut removed = 0;
        let mut shards = tokio::fs::read_dir(&self.root).await?;
        while let Some(shard) = shards.next_entry().await? {
            if !shard.file_type().await?.is_dir() {
                continue;
            }
            let mut blobs = tokio::fs::read_dir(shard.path()).await?;
            while let Some(blob) = blobs.next_entry().await? {
                let name = blob.file_name();
                let Some(name) = name.to_str() else { continue };
                if name.ends_with(".tmp") {
                    tokio::fs::remove_file(blob.path()).await?;
                    removed += 1;
                    continue;
                }
                let Some(hex) = name.strip_suffix(".dat") else {
                    continue;
                };
                let Ok(bytes) = hex_to_handle(hex) else {
                    continue;
                };
                if !live.contains(&bytes) {
                    tokio::fs::remove_file(blob.path()).await?;
                    removed += 1;
                }
            }
            sync_dir(&shard.path()).await?;
        }
        if removed > 0 {
            tracing::info!(removed, "orphan image blobs collected");
        }
        Ok(removed)
    }
}

fn hex_to_handle(hex: &str) -> std::result::Result<ImageHandle, ()> {
    if hex.len() != 32 {
        return Err(());
    }
    let mut bytes = [0u8; 16];
    for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
        let s = std::str::from_utf8(chunk).map_err(|_| ())?;
        bytes[i] = u8::from_str_radix(s, 16).map_err(|_| ())?;
    }
    Ok(ImageHandle::from_bytes(bytes))
}

/// Fsync a directory so a rename or unlink inside it is durable.
async fn sync_dir(path: &Path) -> std::io::Result<()> {
    let dir = std::fs::File::open(path)?;
    tokio::task::spawn_blocking(move || dir.sync_all())
        .await
        .map_err(std::io::Error::other)??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> (tempfile::TempDir, ImageStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ImageStore::open(dir.path().join("images"))
            .await
            .expect("open store");
        (dir, store)
    }

    #[tokio::test]
    async fn test_save_load_roundtrip() {
        let (_dir, store) = test_store().await;
        let data = vec![7u8; 1024];
        let handle = store.save(ImageKind::Profile, &data).await.expect("save");
        let restored = store.load(&handle).await.expect("load");
        assert_eq!(restored, data);
    }

    #[tokio::test]
    async fn test_content_addressing_dedupes() {
        let (_dir, store) = test_store().await;
        let data = b"same bytes".to_vec();
        let h1 = store.save(ImageKind::Thumbnail, &data).await.expect("save");
        let h2 = store.save(ImageKind::Thumbnail, &data).await.expect("save");
        assert_eq!(h1, h2);
    }

    #[tokio::test]
    async fn test_profile_cap_enforced() {
        let (_dir, store) = test_store().await;
        let oversized = vec![0u8; MAX_PROFILE_IMAGE_BYTES + 1];
        match store.save(ImageKind::Profile, &oversized).await {
            Err(ImageStoreError::TooLarge { size, max }) => {
                assert_eq!(size, MAX_PROFILE_IMAGE_BYTES + 1);
                assert_eq!(max, MAX_PROFILE_IMAGE_BYTES);
            }
            other => assert!(other.is_err(), "expected TooLarge"),
        }
    }

    #[tokio::test]
    async fn test_thumbnail_cap_is_tighter() {
        let (_dir, store) = test_store().await;
        let data = vec![0u8; MAX_THUMBNAIL_IMAGE_BYTES + 1];
        assert!(store.save(ImageKind::Thumbnail, &data).await.is_err());
        // The same bytes are fine as a full-size image.
        assert!(store.save(ImageKind::Profile, &data).await.is_ok());
    }

    #[tokio::test]
    async fn test_load_missing_is_not_found() {
        let (_dir, store) = test_store().await;
        let handle = ImageHandle::from_bytes([9u8; 16]);
        assert!(matches!(
            store.load(&handle).await,
            Err(ImageStoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_and_remove_again() {
        let (_dir, store) = test_store().await;
        let handle = store
            .save(ImageKind::Thumbnail, b"bytes")
            .await
            .expect("save");
        store.remove(&handle).await.expect("remove");
        assert!(!store.exists(&handle).await.expect("exists"));
        // Second removal is a no-op.
        store.remove(&handle).await.expect("remove again");
    }

    #[tokio::test]
    async fn test_gc_keeps_live_blobs() {
        let (_dir, store) = test_store().await;
        let live_handle = store
            .save(ImageKind::Thumbnail, b"live")
            .await
            .expect("save");
        let dead_handle = store
            .save(ImageKind::Thumbnail, b"dead")
            .await
            .expect("save");

        let mut live = HashSet::new();
        live.insert(live_handle);
        let removed = store.gc_orphans(&live).await.expect("gc");

        assert_eq!(removed, 1);
        assert!(store.exists(&live_handle).await.expect("exists"));
        assert!(!store.exists(&dead_handle).await.expect("exists"));
    }

    #[tokio::test]
    async fn test_sharded_layout() {
        let (_dir, store) = test_store().await;
        let handle = store
            .save(ImageKind::Thumbnail, b"layout")
            .await
            .expect("save");
        let hex = handle.to_hex();
        let expected = store.root().join(&hex[..2]).join(format!("{hex}.dat"));
        assert!(tokio::fs::try_exists(&expected).await.expect("exists"));
    }
}
