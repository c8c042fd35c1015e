//! # homenet-server
//!
//! The connection and role server plus the per-connection conversation
//! state machine.
//!
//! Four TCP roles are exposed on distinct listeners: primary (plain, role
//! advertisement and neighbor replication), client non-TLS (lightweight
//! lookups and reduced-cap search), client TLS (full client
//! conversations), and app-service TLS (relaying between checked-in
//! clients). Each accepted socket becomes a [`conversation::Conversation`]
//! task that walks the NEW → STARTED → VERIFIED → CHECKED_IN → RELAYING
//! state machine, enforcing per-state and per-role message legality.

pub mod conversation;
pub mod hosting;
pub mod neighborhood;
pub mod registry;
pub mod relationships;
pub mod relay;
pub mod roles;
pub mod search;
pub mod tls;

use std::sync::Arc;

use tokio::sync::{broadcast, Mutex, Notify};

use homenet_crypto::NodeKeys;
use homenet_images::ImageStore;
use homenet_proto::messages::ProfileQueryInformation;
use homenet_search::ResultCache;

/// Error types for server operations. These are infrastructure failures;
/// client-visible protocol errors travel as response status codes instead.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("database error: {0}")]
    Db(#[from] homenet_db::DbError),

    #[error("wire error: {0}")]
    Proto(#[from] homenet_proto::ProtoError),

    #[error("crypto error: {0}")]
    Crypto(#[from] homenet_crypto::CryptoError),

    #[error("image store error: {0}")]
    Images(#[from] homenet_images::ImageStoreError),

    #[error("replication error: {0}")]
    Sync(#[from] homenet_sync::SyncError),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;

/// Capacity and cap configuration.
#[derive(Clone, Debug)]
pub struct ServerLimits {
    /// Active hosting agreements this server accepts.
    pub max_hosted_identities: u64,
    /// Neighbor cap.
    pub max_neighbors: u64,
    /// Follower cap.
    pub max_followers: u64,
    /// Server-wide connection cap across all roles.
    pub max_connections: usize,
    /// Search result cap on the TLS client role.
    pub tls_search_cap: u32,
    /// Search result cap on the non-TLS client role.
    pub non_tls_search_cap: u32,
    /// Days an expired hosting agreement is retained before purge.
    pub hosting_retention_days: u64,
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            max_hosted_identities: 10_000,
            max_neighbors: 105,
            max_followers: 200,
            max_connections: 1024,
            tls_search_cap: 1000,
            non_tls_search_cap: 100,
            hosting_retention_days: 14,
        }
    }
}

/// Ports the four roles are bound to, advertised by ListRoles.
#[derive(Clone, Copy, Debug)]
pub struct RolePorts {
    pub primary: u16,
    pub client_non_tls: u16,
    pub client_tls: u16,
    pub app_service_tls: u16,
}

/// Key for the search-result cache: (connection id, request fingerprint).
pub type SearchCacheKey = (u64, u64);

/// Server-wide shared state handed to every conversation.
pub struct ServerContext {
    /// The single database connection, shared with the replicator tasks.
    pub db: Arc<Mutex<rusqlite::Connection>>,
    /// Image blob store.
    pub images: ImageStore,
    /// The server's network identity keys.
    pub keys: Arc<NodeKeys>,
    /// Capacity configuration.
    pub limits: ServerLimits,
    /// Role port advertisement.
    pub ports: RolePorts,
    /// Search-result cache for paging.
    pub search_cache: std::sync::Mutex<ResultCache<SearchCacheKey, ProfileQueryInformation>>,
    /// In-memory relationship cards.
    pub relationships: std::sync::Mutex<relationships::RelationshipStore>,
    /// Live-connection registry for check-in lookup and relay pairing.
    pub registry: registry::Registry,
    /// Pinged whenever replication actions are enqueued, waking drainers.
    pub actions_changed: Arc<Notify>,
    /// Shutdown fan-out.
    pub shutdown: broadcast::Sender<()>,
}

impl ServerContext {
    /// Current Unix time in seconds.
    pub fn now(&self) -> u64 {
        unix_now()
    }
}

/// Current Unix time in seconds.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Shared handle to the server context.
pub type Context = Arc<ServerContext>;
