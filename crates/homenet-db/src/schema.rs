//! SQL schema definitions.

/// Complete schema for the v1 profile-server database.
pub const SCHEMA_V1: &str = r#"
-- ============================================================
-- Identities: hosted profiles and neighbor mirrors
-- ============================================================

-- host_node_id is the empty blob for profiles hosted here and holds the
-- 32-byte network id of the source server for mirrored profiles (a NULL
-- would defeat the composite primary key). Mirrored rows never expire;
-- they are removed by the neighbor-removal cascade.
CREATE TABLE IF NOT EXISTS identities (
    identity_id BLOB NOT NULL,
    host_node_id BLOB NOT NULL DEFAULT x'',
    public_key BLOB NOT NULL,
    profile_type TEXT NOT NULL DEFAULT '',
    name TEXT NOT NULL DEFAULT '',
    version_major INTEGER NOT NULL DEFAULT 0,
    version_minor INTEGER NOT NULL DEFAULT 0,
    version_patch INTEGER NOT NULL DEFAULT 0,
    latitude REAL NOT NULL DEFAULT 0,
    longitude REAL NOT NULL DEFAULT 0,
    location_cell INTEGER NOT NULL DEFAULT 0,
    extra_data TEXT NOT NULL DEFAULT '',
    profile_image BLOB,
    thumbnail_image BLOB,
    expires_at INTEGER,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (identity_id, host_node_id)
);

CREATE INDEX IF NOT EXISTS idx_identities_host ON identities(host_node_id);
CREATE INDEX IF NOT EXISTS idx_identities_geo ON identities(latitude, longitude);
CREATE INDEX IF NOT EXISTS idx_identities_cell ON identities(location_cell);
CREATE INDEX IF NOT EXISTS idx_identities_type ON identities(profile_type);
CREATE INDEX IF NOT EXISTS idx_identities_expires ON identities(expires_at)
    WHERE expires_at IS NOT NULL;

-- ============================================================
-- Neighbors: peers whose profiles we mirror
-- ============================================================

CREATE TABLE IF NOT EXISTS neighbors (
    network_id BLOB PRIMARY KEY,
    ip_address TEXT NOT NULL,
    primary_port INTEGER NOT NULL,
    distance_bucket INTEGER NOT NULL DEFAULT 0,
    last_refreshed_at INTEGER NOT NULL,
    profile_count INTEGER NOT NULL DEFAULT 0,
    pending_removal INTEGER NOT NULL DEFAULT 0
);

-- ============================================================
-- Followers: peers that mirror our profiles
-- ============================================================

CREATE TABLE IF NOT EXISTS followers (
    network_id BLOB PRIMARY KEY,
    ip_address TEXT NOT NULL,
    primary_port INTEGER NOT NULL,
    initialized INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    last_notified_at INTEGER,
    unhealthy_since INTEGER
);

-- ============================================================
-- Durable replication action queue
-- ============================================================

-- target_endpoint is snapshotted at enqueue time so a StopHosting can
-- still be delivered after its neighbor row is gone.
CREATE TABLE IF NOT EXISTS neighborhood_actions (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    target_id BLOB NOT NULL,
    target_endpoint TEXT NOT NULL,
    kind INTEGER NOT NULL,
    identity_id BLOB,
    payload BLOB NOT NULL,
    enqueued_at INTEGER NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_actions_target ON neighborhood_actions(target_id, seq);

-- ============================================================
-- Settings
-- ============================================================

CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;
