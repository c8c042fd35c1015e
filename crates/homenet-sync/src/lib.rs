//! # homenet-sync
//!
//! The neighborhood replicator: the LOC client loop, follower
//! registration with snapshot enqueue, the per-follower action-queue
//! drainers, and the receiver-side idempotent application of incoming
//! profile updates.
//!
//! ## Delivery model
//!
//! Every mutation of a hosted profile enqueues one durable
//! `neighborhood_actions` row per follower inside the same transaction as
//! the mutation. One drainer task per target drains its rows in sequence
//! order over an authenticated conversation to the target's primary role.
//! This gives at-least-once delivery with per-(follower, identity) FIFO
//! ordering; the receiving side makes replays harmless.

pub mod actions;
pub mod apply;
pub mod client;
pub mod drainer;
pub mod followers;
pub mod loc;
pub mod neighbors;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex, Notify};

use homenet_crypto::NodeKeys;
use homenet_images::ImageStore;

/// Rows per snapshot chunk and per update batch on the wire.
pub const SNAPSHOT_CHUNK: usize = 1000;

/// Timeout for one outbound replication round-trip.
pub const SEND_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);

/// Delay between LOC reconnect attempts.
pub const LOC_RECONNECT_DELAY: std::time::Duration = std::time::Duration::from_secs(10);

/// Consecutive delivery failures before a follower is marked unhealthy.
pub const UNHEALTHY_AFTER_FAILURES: u32 = 5;

/// Base delay of the drainer's exponential backoff.
pub const BACKOFF_BASE: std::time::Duration = std::time::Duration::from_secs(10);

/// Cap of the drainer's exponential backoff.
pub const BACKOFF_CAP: std::time::Duration = std::time::Duration::from_secs(3600);

/// Hours a follower may stay unhealthy before it is removed.
pub const UNHEALTHY_REMOVAL_SECS: u64 = 24 * 3600;

/// Seconds of delivery silence after which a follower gets a
/// RefreshProfile keep-alive sweep.
pub const REFRESH_INTERVAL_SECS: u64 = 24 * 3600;

/// Error types for replicator operations.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("database error: {0}")]
    Db(#[from] homenet_db::DbError),

    #[error("wire error: {0}")]
    Proto(#[from] homenet_proto::ProtoError),

    #[error("crypto error: {0}")]
    Crypto(#[from] homenet_crypto::CryptoError),

    #[error("image store error: {0}")]
    Images(#[from] homenet_images::ImageStoreError),

    #[error("peer rejected request: status {0}")]
    Rejected(i32),

    #[error("peer misbehaved: {0}")]
    Peer(String),

    #[error("invalid replicated item: {0}")]
    InvalidItem(String),

    #[error("timed out")]
    Timeout,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for replicator operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Replication settings from the daemon configuration.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// The location service endpoint.
    pub loc_endpoint: SocketAddr,
    /// Our primary-role port, advertised to LOC and to peers.
    pub primary_port: u16,
    /// Neighbor cap.
    pub max_neighbors: u64,
    /// Seconds without a LOC refresh after which a neighbor is stale.
    pub neighbor_expiration_secs: u64,
}

/// Shared state for the replicator tasks.
pub struct SyncContext {
    /// The single database connection, shared with the role server.
    pub db: Arc<Mutex<rusqlite::Connection>>,
    /// Image blob store (thumbnails of mirrored profiles).
    pub images: ImageStore,
    /// The server's network identity keys.
    pub keys: Arc<NodeKeys>,
    /// Pinged whenever actions are enqueued.
    pub actions_changed: Arc<Notify>,
    /// Shutdown fan-out.
    pub shutdown: broadcast::Sender<()>,
    /// Replication settings.
    pub config: SyncConfig,
}

impl SyncContext {
    /// Current Unix time in seconds.
    pub fn now(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default()
    }
}
