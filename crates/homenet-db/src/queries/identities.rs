//! Identity profile queries: hosted profiles and neighbor mirrors.
//!
//! Both kinds live in the `identities` table; the `host_node_id` column is
//! the empty blob for hosted rows and the source server's network id for
//! mirrored rows. Stage-1 search predicates are assembled here from the
//! typed forms in `homenet-search`.

use rusqlite::{params, types::Value, Connection, OptionalExtension};

use homenet_search::wildcard::escape_like;
use homenet_search::{GeoBounds, TextPredicate};
use homenet_types::{
    GpsLocation, IdentityId, ImageHandle, NetworkId, Profile, ProfileScope, ProfileVersion,
};

use crate::{DbError, Result};

/// Sentinel `host_node_id` value for hosted rows.
const HOSTED: &[u8] = &[];

/// Stage-1 search filter, already translated from the client's wildcards
/// and search circle.
#[derive(Clone, Debug)]
pub struct SearchFilter {
    /// Only profiles hosted by this server.
    pub hosted_only: bool,
    /// Type predicate; `None` matches every type.
    pub profile_type: Option<TextPredicate>,
    /// Name predicate; `None` matches every name.
    pub name: Option<TextPredicate>,
    /// Coarse geographic bounds.
    pub bounds: GeoBounds,
    /// Optional cap on candidate rows pulled from storage. The coarse
    /// rectangle over-selects, so result-count limits belong to stage 2;
    /// this exists for callers that want a hard safety bound instead.
    pub limit: Option<usize>,
}

const PROFILE_COLUMNS: &str = "identity_id, host_node_id, public_key, profile_type, name, \
     version_major, version_minor, version_patch, latitude, longitude, \
     extra_data, profile_image, thumbnail_image, expires_at";

struct RawRow {
    identity_id: Vec<u8>,
    host_node_id: Vec<u8>,
    public_key: Vec<u8>,
    profile_type: String,
    name: String,
    version_major: u32,
    version_minor: u32,
    version_patch: u32,
    latitude: f64,
    longitude: f64,
    extra_data: String,
    profile_image: Option<Vec<u8>>,
    thumbnail_image: Option<Vec<u8>>,
    expires_at: Option<i64>,
}

fn raw_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        identity_id: row.get(0)?,
        host_node_id: row.get(1)?,
        public_key: row.get(2)?,
        profile_type: row.get(3)?,
        name: row.get(4)?,
        version_major: row.get(5)?,
        version_minor: row.get(6)?,
        version_patch: row.get(7)?,
        latitude: row.get(8)?,
        longitude: row.get(9)?,
        extra_data: row.get(10)?,
        profile_image: row.get(11)?,
        thumbnail_image: row.get(12)?,
        expires_at: row.get(13)?,
    })
}

fn profile_from_raw(raw: RawRow) -> Result<Profile> {
    let identity_id = IdentityId::from_slice(&raw.identity_id)
        .map_err(|e| DbError::Corrupt(format!("identity_id: {e}")))?;
    let scope = if raw.host_node_id.is_empty() {
        ProfileScope::Hosted
    } else {
        ProfileScope::Neighbor(
            NetworkId::from_slice(&raw.host_node_id)
                .map_err(|e| DbError::Corrupt(format!("host_node_id: {e}")))?,
        )
    };
    let location = GpsLocation::new(raw.latitude, raw.longitude)
        .map_err(|e| DbError::Corrupt(format!("location: {e}")))?;
    let profile_image = raw
        .profile_image
        .map(|h| ImageHandle::from_slice(&h))
        .transpose()
        .map_err(|e| DbError::Corrupt(format!("profile_image: {e}")))?;
    let thumbnail_image = raw
        .thumbnail_image
        .map(|h| ImageHandle::from_slice(&h))
        .transpose()
        .map_err(|e| DbError::Corrupt(format!("thumbnail_image: {e}")))?;

    Ok(Profile {
        identity_id,
        public_key: raw.public_key,
        profile_type: raw.profile_type,
        name: raw.name,
        version: ProfileVersion::new(raw.version_major, raw.version_minor, raw.version_patch),
        location,
        extra_data: raw.extra_data,
        profile_image,
        thumbnail_image,
        expires_at: raw.expires_at.map(|t| t as u64),
        scope,
    })
}

fn host_value(profile: &Profile) -> Vec<u8> {
    match profile.host_node_id() {
        Some(id) => id.as_bytes().to_vec(),
        None => HOSTED.to_vec(),
    }
}

/// Insert a new profile row.
///
/// Fails with [`DbError::Constraint`] if the (identity, scope) pair
/// already exists.
pub fn insert(conn: &Connection, profile: &Profile, now: u64) -> Result<()> {
    let result = conn.execute(
        "INSERT INTO identities (identity_id, host_node_id, public_key, profile_type, name, \
         version_major, version_minor, version_patch, latitude, longitude, location_cell, \
         extra_data, profile_image, thumbnail_image, expires_at, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        params![
            profile.identity_id.as_bytes().as_slice(),
            host_value(profile),
            profile.public_key,
            profile.profile_type,
            profile.name,
            profile.version.major,
            profile.version.minor,
            profile.version.patch,
            profile.location.latitude(),
            profile.location.longitude(),
            profile.location.cell(),
            profile.extra_data,
            profile.profile_image.map(|h| h.as_bytes().to_vec()),
            profile.thumbnail_image.map(|h| h.as_bytes().to_vec()),
            profile.expires_at.map(|t| t as i64),
            now as i64,
        ],
    );
    match result {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Err(DbError::Constraint(format!(
                "identity {} already exists",
                profile.identity_id
            )))
        }
        Err(e) => Err(DbError::Sqlite(e)),
    }
}

/// Overwrite every mutable column of an existing profile row.
pub fn update(conn: &Connection, profile: &Profile) -> Result<()> {
    let changed = conn.execute(
        "UPDATE identities SET public_key = ?3, profile_type = ?4, name = ?5, \
         version_major = ?6, version_minor = ?7, version_patch = ?8, \
         latitude = ?9, longitude = ?10, location_cell = ?11, extra_data = ?12, \
         profile_image = ?13, thumbnail_image = ?14, expires_at = ?15 \
         WHERE identity_id = ?1 AND host_node_id = ?2",
        params![
            profile.identity_id.as_bytes().as_slice(),
            host_value(profile),
            profile.public_key,
            profile.profile_type,
            profile.name,
            profile.version.major,
            profile.version.minor,
            profile.version.patch,
            profile.location.latitude(),
            profile.location.longitude(),
            profile.location.cell(),
            profile.extra_data,
            profile.profile_image.map(|h| h.as_bytes().to_vec()),
            profile.thumbnail_image.map(|h| h.as_bytes().to_vec()),
            profile.expires_at.map(|t| t as i64),
        ],
    )?;
    if changed == 0 {
        return Err(DbError::NotFound(format!(
            "identity {}",
            profile.identity_id
        )));
    }
    Ok(())
}

/// Fetch a hosted profile.
pub fn get_hosted(conn: &Connection, id: &IdentityId) -> Result<Profile> {
    let raw = conn
        .query_row(
            &format!(
                "SELECT {PROFILE_COLUMNS} FROM identities \
                 WHERE identity_id = ?1 AND host_node_id = x''"
            ),
            [id.as_bytes().as_slice()],
            raw_from_row,
        )
        .optional()?;
    match raw {
        Some(raw) => profile_from_raw(raw),
        None => Err(DbError::NotFound(format!("identity {id}"))),
    }
}

/// Fetch a mirrored profile from a specific neighbor.
pub fn get_neighbor(conn: &Connection, id: &IdentityId, source: &NetworkId) -> Result<Profile> {
    let raw = conn
        .query_row(
            &format!(
                "SELECT {PROFILE_COLUMNS} FROM identities \
                 WHERE identity_id = ?1 AND host_node_id = ?2"
            ),
            params![id.as_bytes().as_slice(), source.as_bytes().as_slice()],
            raw_from_row,
        )
        .optional()?;
    match raw {
        Some(raw) => profile_from_raw(raw),
        None => Err(DbError::NotFound(format!("identity {id}"))),
    }
}

/// Fetch a profile by id, preferring the hosted row over mirrors.
pub fn get_any(conn: &Connection, id: &IdentityId) -> Result<Profile> {
    let raw = conn
        .query_row(
            &format!(
                "SELECT {PROFILE_COLUMNS} FROM identities \
                 WHERE identity_id = ?1 \
                 ORDER BY length(host_node_id) ASC LIMIT 1"
            ),
            [id.as_bytes().as_slice()],
            raw_from_row,
        )
        .optional()?;
    match raw {
        Some(raw) => profile_from_raw(raw),
        None => Err(DbError::NotFound(format!("identity {id}"))),
    }
}

/// Set or clear the expiration of a hosted profile.
pub fn set_expiration(conn: &Connection, id: &IdentityId, expires_at: Option<u64>) -> Result<()> {
    let changed = conn.execute(
        "UPDATE identities SET expires_at = ?2 \
         WHERE identity_id = ?1 AND host_node_id = x''",
        params![id.as_bytes().as_slice(), expires_at.map(|t| t as i64)],
    )?;
    if changed == 0 {
        return Err(DbError::NotFound(format!("identity {id}")));
    }
    Ok(())
}

/// Count active hosted profiles (capacity checks).
pub fn count_hosted_active(conn: &Connection) -> Result<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM identities \
         WHERE host_node_id = x'' AND expires_at IS NULL",
        [],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

/// Count mirrored profiles from one neighbor.
pub fn count_for_neighbor(conn: &Connection, source: &NetworkId) -> Result<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM identities WHERE host_node_id = ?1",
        [source.as_bytes().as_slice()],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

/// One page of active, initialized hosted profiles in stable identity
/// order. Used to build snapshot chunks for a new follower.
pub fn list_hosted_active(conn: &Connection, offset: u64, limit: u64) -> Result<Vec<Profile>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PROFILE_COLUMNS} FROM identities \
         WHERE host_node_id = x'' AND expires_at IS NULL \
           AND NOT (version_major = 0 AND version_minor = 0 AND version_patch = 0) \
         ORDER BY identity_id LIMIT ?1 OFFSET ?2"
    ))?;
    let raws = stmt
        .query_map(params![limit as i64, offset as i64], raw_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    raws.into_iter().map(profile_from_raw).collect()
}

/// Delete every mirrored profile from a neighbor. Returns the removed
/// thumbnail handles so their blobs can be deleted too.
pub fn delete_neighbor_profiles(
    conn: &Connection,
    source: &NetworkId,
) -> Result<Vec<ImageHandle>> {
    let mut stmt = conn.prepare(
        "SELECT thumbnail_image FROM identities \
         WHERE host_node_id = ?1 AND thumbnail_image IS NOT NULL",
    )?;
    let handles: Vec<Vec<u8>> = stmt
        .query_map([source.as_bytes().as_slice()], |row| row.get(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    conn.execute(
        "DELETE FROM identities WHERE host_node_id = ?1",
        [source.as_bytes().as_slice()],
    )?;
    handles
        .iter()
        .map(|h| {
            ImageHandle::from_slice(h).map_err(|e| DbError::Corrupt(format!("thumbnail: {e}")))
        })
        .collect()
}

/// Delete a single mirrored profile. Missing rows are a no-op, matching
/// the replication idempotence rules.
pub fn delete_neighbor_profile(
    conn: &Connection,
    id: &IdentityId,
    source: &NetworkId,
) -> Result<bool> {
    let changed = conn.execute(
        "DELETE FROM identities WHERE identity_id = ?1 AND host_node_id = ?2",
        params![id.as_bytes().as_slice(), source.as_bytes().as_slice()],
    )?;
    Ok(changed > 0)
}

/// Delete hosted profiles expired longer ago than `retention_secs`.
/// Returns (identity id, image handles) of every purged row.
pub fn purge_expired(
    conn: &Connection,
    now: u64,
    retention_secs: u64,
) -> Result<Vec<(IdentityId, Vec<ImageHandle>)>> {
    let cutoff = now.saturating_sub(retention_secs) as i64;
    let mut stmt = conn.prepare(
        "SELECT identity_id, profile_image, thumbnail_image FROM identities \
         WHERE host_node_id = x'' AND expires_at IS NOT NULL AND expires_at <= ?1",
    )?;
    let rows: Vec<(Vec<u8>, Option<Vec<u8>>, Option<Vec<u8>>)> = stmt
        .query_map([cutoff], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    conn.execute(
        "DELETE FROM identities \
         WHERE host_node_id = x'' AND expires_at IS NOT NULL AND expires_at <= ?1",
        [cutoff],
    )?;

    rows.into_iter()
        .map(|(id, image, thumb)| {
            let id = IdentityId::from_slice(&id)
                .map_err(|e| DbError::Corrupt(format!("identity_id: {e}")))?;
            let mut handles = Vec::new();
            for h in [image, thumb].into_iter().flatten() {
                handles.push(
                    ImageHandle::from_slice(&h)
                        .map_err(|e| DbError::Corrupt(format!("image handle: {e}")))?,
                );
            }
            Ok((id, handles))
        })
        .collect()
}

/// Every image handle referenced by any row. Used by the orphan-blob GC.
pub fn all_image_handles(conn: &Connection) -> Result<Vec<ImageHandle>> {
    let mut stmt = conn.prepare(
        "SELECT profile_image FROM identities WHERE profile_image IS NOT NULL \
         UNION \
         SELECT thumbnail_image FROM identities WHERE thumbnail_image IS NOT NULL",
    )?;
    let raw: Vec<Vec<u8>> = stmt
        .query_map([], |row| row.get(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    raw.iter()
        .map(|h| {
            ImageHandle::from_slice(h).map_err(|e| DbError::Corrupt(format!("image handle: {e}")))
        })
        .collect()
}

/// Stage-1 candidate query: coarse type, name, and geographic predicates
/// pushed into SQL. Stage 2 refines the candidates in memory.
pub fn search(conn: &Connection, filter: &SearchFilter) -> Result<Vec<Profile>> {
    let mut sql = format!(
        "SELECT {PROFILE_COLUMNS} FROM identities \
         WHERE NOT (version_major = 0 AND version_minor = 0 AND version_patch = 0) \
           AND (host_node_id != x'' OR expires_at IS NULL)"
    );
    let mut params_vec: Vec<Value> = Vec::new();

    if filter.hosted_only {
        sql.push_str(" AND host_node_id = x''");
    }
    if let Some(pred) = &filter.profile_type {
        push_text_predicate(&mut sql, &mut params_vec, "profile_type", pred);
    }
    if let Some(pred) = &filter.name {
        push_text_predicate(&mut sql, &mut params_vec, "name", pred);
    }
    push_geo_bounds(&mut sql, &mut params_vec, &filter.bounds);

    if let Some(limit) = filter.limit {
        params_vec.push(Value::Integer(limit as i64));
        sql.push_str(&format!(" LIMIT ?{}", params_vec.len()));
    }

    let mut stmt = conn.prepare(&sql)?;
    let raws = stmt
        .query_map(rusqlite::params_from_iter(params_vec), raw_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    raws.into_iter().map(profile_from_raw).collect()
}

fn push_text_predicate(
    sql: &mut String,
    params_vec: &mut Vec<Value>,
    column: &str,
    pred: &TextPredicate,
) {
    match pred {
        TextPredicate::Equals(p) => {
            params_vec.push(Value::Text(p.clone()));
            sql.push_str(&format!(
                " AND {column} = ?{} COLLATE NOCASE",
                params_vec.len()
            ));
        }
        TextPredicate::StartsWith(p) => {
            params_vec.push(Value::Text(format!("{}%", escape_like(p))));
            sql.push_str(&format!(
                " AND {column} LIKE ?{} ESCAPE '\\'",
                params_vec.len()
            ));
        }
        TextPredicate::EndsWith(p) => {
            params_vec.push(Value::Text(format!("%{}", escape_like(p))));
            sql.push_str(&format!(
                " AND {column} LIKE ?{} ESCAPE '\\'",
                params_vec.len()
            ));
        }
        TextPredicate::Contains(p) => {
            params_vec.push(Value::Text(format!("%{}%", escape_like(p))));
            sql.push_str(&format!(
                " AND {column} LIKE ?{} ESCAPE '\\'",
                params_vec.len()
            ));
        }
    }
}

fn push_geo_bounds(sql: &mut String, params_vec: &mut Vec<Value>, bounds: &GeoBounds) {
    match bounds {
        GeoBounds::None => {}
        GeoBounds::MinLat(min_lat) => {
            params_vec.push(Value::Real(*min_lat));
            sql.push_str(&format!(" AND latitude >= ?{}", params_vec.len()));
        }
        GeoBounds::MaxLat(max_lat) => {
            params_vec.push(Value::Real(*max_lat));
            sql.push_str(&format!(" AND latitude <= ?{}", params_vec.len()));
        }
        GeoBounds::Rect {
            min_lat,
            max_lat,
            min_lon,
            max_lon,
        } => {
            params_vec.push(Value::Real(*min_lat));
            let p_min_lat = params_vec.len();
            params_vec.push(Value::Real(*max_lat));
            let p_max_lat = params_vec.len();
            params_vec.push(Value::Real(*min_lon));
            let p_min_lon = params_vec.len();
            params_vec.push(Value::Real(*max_lon));
            let p_max_lon = params_vec.len();
            sql.push_str(&format!(
                " AND latitude >= ?{p_min_lat} AND latitude <= ?{p_max_lat} \
                 AND longitude >= ?{p_min_lon} AND longitude <= ?{p_max_lon}"
            ));
        }
        GeoBounds::SplitRect {
            min_lat,
            max_lat,
            west_from,
            east_to,
        } => {
            params_vec.push(Value::Real(*min_lat));
            let p_min_lat = params_vec.len();
            params_vec.push(Value::Real(*max_lat));
            let p_max_lat = params_vec.len();
            params_vec.push(Value::Real(*west_from));
            let p_west = params_vec.len();
            params_vec.push(Value::Real(*east_to));
            let p_east = params_vec.len();
            sql.push_str(&format!(
                " AND latitude >= ?{p_min_lat} AND latitude <= ?{p_max_lat} \
                 AND (longitude >= ?{p_west} OR longitude <= ?{p_east})"
            ));
        }
    }
}
