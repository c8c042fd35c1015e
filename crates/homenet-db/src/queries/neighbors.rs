//! Neighbor queries: peers whose profiles we mirror.

use rusqlite::{params, Connection, OptionalExtension};

use homenet_types::NetworkId;

use crate::{DbError, Result};

/// A raw neighbor row.
#[derive(Clone, Debug)]
pub struct NeighborRow {
    pub network_id: NetworkId,
    pub ip_address: String,
    pub primary_port: u16,
    pub distance_bucket: u32,
    pub last_refreshed_at: u64,
    pub profile_count: u64,
    pub pending_removal: bool,
}

fn row_to_neighbor(row: &rusqlite::Row<'_>) -> rusqlite::Result<(Vec<u8>, NeighborRow)> {
    let id: Vec<u8> = row.get(0)?;
    Ok((
        id.clone(),
        NeighborRow {
            network_id: NetworkId::from_bytes([0u8; 32]),
            ip_address: row.get(1)?,
            primary_port: row.get::<_, i64>(2)? as u16,
            distance_bucket: row.get::<_, i64>(3)? as u32,
            last_refreshed_at: row.get::<_, i64>(4)? as u64,
            profile_count: row.get::<_, i64>(5)? as u64,
            pending_removal: row.get::<_, bool>(6)?,
        },
    ))
}

fn finish(raw: (Vec<u8>, NeighborRow)) -> Result<NeighborRow> {
    let (id, mut row) = raw;
    row.network_id =
        NetworkId::from_slice(&id).map_err(|e| DbError::Corrupt(format!("network_id: {e}")))?;
    Ok(row)
}

const COLUMNS: &str = "network_id, ip_address, primary_port, distance_bucket, \
     last_refreshed_at, profile_count, pending_removal";

/// Insert a neighbor or refresh its contact data. Refreshing clears a
/// pending-removal mark, so a LOC flap does not drop mirrored profiles.
pub fn upsert(
    conn: &Connection,
    network_id: &NetworkId,
    ip_address: &str,
    primary_port: u16,
    distance_bucket: u32,
    now: u64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO neighbors \
         (network_id, ip_address, primary_port, distance_bucket, last_refreshed_at) \
         VALUES (?1, ?2, ?3, ?4, ?5) \
         ON CONFLICT(network_id) DO UPDATE SET \
           ip_address = excluded.ip_address, \
           primary_port = excluded.primary_port, \
           distance_bucket = excluded.distance_bucket, \
           last_refreshed_at = excluded.last_refreshed_at, \
           pending_removal = 0",
        params![
            network_id.as_bytes().as_slice(),
            ip_address,
            i64::from(primary_port),
            i64::from(distance_bucket),
            now as i64,
        ],
    )?;
    Ok(())
}

/// Fetch one neighbor.
pub fn get(conn: &Connection, network_id: &NetworkId) -> Result<NeighborRow> {
    let raw = conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM neighbors WHERE network_id = ?1"),
            [network_id.as_bytes().as_slice()],
            row_to_neighbor,
        )
        .optional()?;
    match raw {
        Some(raw) => finish(raw),
        None => Err(DbError::NotFound(format!("neighbor {network_id}"))),
    }
}

/// List all neighbors.
pub fn list(conn: &Connection) -> Result<Vec<NeighborRow>> {
    let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM neighbors"))?;
    let raws = stmt
        .query_map([], row_to_neighbor)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    raws.into_iter().map(finish).collect()
}

/// Count neighbors (capacity checks).
pub fn count(conn: &Connection) -> Result<u64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM neighbors", [], |row| row.get(0))?;
    Ok(count as u64)
}

/// Mark a neighbor for removal; the cascade worker deletes its rows.
pub fn mark_pending_removal(conn: &Connection, network_id: &NetworkId) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE neighbors SET pending_removal = 1 WHERE network_id = ?1",
        [network_id.as_bytes().as_slice()],
    )?;
    Ok(changed > 0)
}

/// Neighbors marked for removal.
pub fn list_pending_removal(conn: &Connection) -> Result<Vec<NeighborRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM neighbors WHERE pending_removal = 1"
    ))?;
    let raws = stmt
        .query_map([], row_to_neighbor)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    raws.into_iter().map(finish).collect()
}

/// Neighbors not refreshed by the location service since `cutoff`.
pub fn list_stale(conn: &Connection, cutoff: u64) -> Result<Vec<NeighborRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM neighbors WHERE last_refreshed_at < ?1"
    ))?;
    let raws = stmt
        .query_map([cutoff as i64], row_to_neighbor)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    raws.into_iter().map(finish).collect()
}

/// Delete a neighbor row.
pub fn remove(conn: &Connection, network_id: &NetworkId) -> Result<bool> {
    let changed = conn.execute(
        "DELETE FROM neighbors WHERE network_id = ?1",
        [network_id.as_bytes().as_slice()],
    )?;
    Ok(changed > 0)
}

/// Update the cached count of profiles mirrored from a neighbor.
pub fn set_profile_count(conn: &Connection, network_id: &NetworkId, count: u64) -> Result<()> {
    conn.execute(
        "UPDATE neighbors SET profile_count = ?2 WHERE network_id = ?1",
        params![network_id.as_bytes().as_slice(), count as i64],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Connection {
        crate::open_memory().expect("open test db")
    }

    fn nid(byte: u8) -> NetworkId {
        NetworkId::from_bytes([byte; 32])
    }

    #[test]
    fn test_upsert_and_get() {
        let conn = test_db();
        upsert(&conn, &nid(1), "198.51.100.7", 16987, 2, 1000).expect("upsert");

        let row = get(&conn, &nid(1)).expect("get");
        assert_eq!(row.ip_address, "198.51.100.7");
        assert_eq!(row.primary_port, 16987);
        assert_eq!(row.distance_bucket, 2);
        assert!(!row.pending_removal);
    }

    #[test]
    fn test_upsert_refresh_no_duplicates() {
        let conn = test_db();
        upsert(&conn, &nid(1), "198.51.100.7", 16987, 2, 1000).expect("first");
        upsert(&conn, &nid(1), "198.51.100.8", 16988, 3, 2000).expect("second");

        assert_eq!(count(&conn).expect("count"), 1);
        let row = get(&conn, &nid(1)).expect("get");
        assert_eq!(row.ip_address, "198.51.100.8");
        assert_eq!(row.last_refreshed_at, 2000);
    }

    #[test]
    fn test_refresh_clears_pending_removal() {
        let conn = test_db();
        upsert(&conn, &nid(1), "198.51.100.7", 16987, 0, 1000).expect("upsert");
        assert!(mark_pending_removal(&conn, &nid(1)).expect("mark"));
        assert_eq!(list_pending_removal(&conn).expect("list").len(), 1);

        upsert(&conn, &nid(1), "198.51.100.7", 16987, 0, 2000).expect("refresh");
        assert!(list_pending_removal(&conn).expect("list").is_empty());
    }

    #[test]
    fn test_stale_listing() {
        let conn = test_db();
        upsert(&conn, &nid(1), "a", 1, 0, 1000).expect("upsert");
        upsert(&conn, &nid(2), "b", 2, 0, 5000).expect("upsert");

        let stale = list_stale(&conn, 2000).expect("stale");
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].network_id, nid(1));
    }

    #[test]
    fn test_remove() {
        let conn = test_db();
        upsert(&conn, &nid(1), "a", 1, 0, 1000).expect("upsert");
        assert!(remove(&conn, &nid(1)).expect("remove"));
        assert!(!remove(&conn, &nid(1)).expect("second remove"));
        assert!(matches!(get(&conn, &nid(1)), Err(DbError::NotFound(_))));
    }
}
