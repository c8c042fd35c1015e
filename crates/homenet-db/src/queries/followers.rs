//! Follower queries: peers that mirror our profiles.

use rusqlite::{params, Connection, OptionalExtension};

use homenet_types::NetworkId;

use crate::{DbError, Result};

/// A raw follower row.
#[derive(Clone, Debug)]
pub struct FollowerRow {
    pub network_id: NetworkId,
    pub ip_address: String,
    pub primary_port: u16,
    /// The initial snapshot has been fully delivered.
    pub initialized: bool,
    pub created_at: u64,
    pub last_notified_at: Option<u64>,
    pub unhealthy_since: Option<u64>,
}

impl FollowerRow {
    /// `ip:port` form used as the drainer's dial target.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.ip_address, self.primary_port)
    }
}

const COLUMNS: &str = "network_id, ip_address, primary_port, initialized, created_at, \
     last_notified_at, unhealthy_since";

fn row_to_follower(row: &rusqlite::Row<'_>) -> rusqlite::Result<(Vec<u8>, FollowerRow)> {
    let id: Vec<u8> = row.get(0)?;
    Ok((
        id,
        FollowerRow {
            network_id: NetworkId::from_bytes([0u8; 32]),
            ip_address: row.get(1)?,
            primary_port: row.get::<_, i64>(2)? as u16,
            initialized: row.get::<_, bool>(3)?,
            created_at: row.get::<_, i64>(4)? as u64,
            last_notified_at: row.get::<_, Option<i64>>(5)?.map(|t| t as u64),
            unhealthy_since: row.get::<_, Option<i64>>(6)?.map(|t| t as u64),
        },
    ))
}

fn finish(raw: (Vec<u8>, FollowerRow)) -> Result<FollowerRow> {
    let (id, mut row) = raw;
    row.network_id =
        NetworkId::from_slice(&id).map_err(|e| DbError::Corrupt(format!("network_id: {e}")))?;
    Ok(row)
}

/// Register a new follower.
///
/// Fails with [`DbError::Constraint`] if the peer is already a follower.
pub fn insert(
    conn: &Connection,
    network_id: &NetworkId,
    ip_address: &str,
    primary_port: u16,
    now: u64,
) -> Result<()> {
    let result = conn.execute(
        "INSERT INTO followers (network_id, ip_address, primary_port, created_at) \
         VALUES (?1, ?2, ?3, ?4)",
        params![
            network_id.as_bytes().as_slice(),
            ip_address,
            i64::from(primary_port),
            now as i64,
        ],
    );
    match result {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Err(DbError::Constraint(format!(
                "follower {network_id} already exists"
            )))
        }
        Err(e) => Err(DbError::Sqlite(e)),
    }
}

/// Fetch one follower.
pub fn get(conn: &Connection, network_id: &NetworkId) -> Result<FollowerRow> {
    let raw = conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM followers WHERE network_id = ?1"),
            [network_id.as_bytes().as_slice()],
            row_to_follower,
        )
        .optional()?;
    match raw {
        Some(raw) => finish(raw),
        None => Err(DbError::NotFound(format!("follower {network_id}"))),
    }
}

/// List all followers.
pub fn list(conn: &Connection) -> Result<Vec<FollowerRow>> {
    let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM followers"))?;
    let raws = stmt
        .query_map([], row_to_follower)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    raws.into_iter().map(finish).collect()
}

/// Count followers (capacity checks).
pub fn count(conn: &Connection) -> Result<u64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM followers", [], |row| row.get(0))?;
    Ok(count as u64)
}

/// Mark the initial snapshot as fully delivered.
pub fn set_initialized(conn: &Connection, network_id: &NetworkId) -> Result<()> {
    conn.execute(
        "UPDATE followers SET initialized = 1 WHERE network_id = ?1",
        [network_id.as_bytes().as_slice()],
    )?;
    Ok(())
}

/// Record a successful delivery and clear any unhealthy mark.
pub fn record_delivery(conn: &Connection, network_id: &NetworkId, now: u64) -> Result<()> {
    conn.execute(
        "UPDATE followers SET last_notified_at = ?2, unhealthy_since = NULL \
         WHERE network_id = ?1",
        params![network_id.as_bytes().as_slice(), now as i64],
    )?;
    Ok(())
}

/// Mark a follower unhealthy, keeping the earliest mark.
pub fn mark_unhealthy(conn: &Connection, network_id: &NetworkId, now: u64) -> Result<()> {
    conn.execute(
        "UPDATE followers SET unhealthy_since = COALESCE(unhealthy_since, ?2) \
         WHERE network_id = ?1",
        params![network_id.as_bytes().as_slice(), now as i64],
    )?;
    Ok(())
}

/// Followers unhealthy since before `cutoff`, due for removal.
pub fn list_unhealthy_since_before(conn: &Connection, cutoff: u64) -> Result<Vec<FollowerRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM followers \
         WHERE unhealthy_since IS NOT NULL AND unhealthy_since < ?1"
    ))?;
    let raws = stmt
        .query_map([cutoff as i64], row_to_follower)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    raws.into_iter().map(finish).collect()
}

/// Delete a follower row.
pub fn remove(conn: &Connection, network_id: &NetworkId) -> Result<bool> {
    let changed = conn.execute(
        "DELETE FROM followers WHERE network_id = ?1",
        [network_id.as_bytes().as_slice()],
    )?;
    Ok(changed > 0)
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
    fn test_insert_and_get() {
        let conn = test_db();
        insert(&conn, &nid(1), "198.51.100.7", 16987, 1000).expect("insert");

        let row = get(&conn, &nid(1)).expect("get");
        assert!(!row.initialized);
        assert_eq!(row.endpoint(), "198.51.100.7:16987");
        assert_eq!(row.created_at, 1000);
        assert!(row.last_notified_at.is_none());
    }

    #[test]
    fn test_duplicate_insert_is_constraint() {
        let conn = test_db();
        insert(&conn, &nid(1), "a", 1, 1000).expect("insert");
        assert!(matches!(
            insert(&conn, &nid(1), "a", 1, 2000),
            Err(DbError::Constraint(_))
        ));
    }

    #[test]
    fn test_initialization_flag() {
        let conn = test_db();
        insert(&conn, &nid(1), "a", 1, 1000).expect("insert");
        set_initialized(&conn, &nid(1)).expect("set");
        assert!(get(&conn, &nid(1)).expect("get").initialized);
    }

    #[test]
    fn test_delivery_clears_unhealthy() {
        let conn = test_db();
        insert(&conn, &nid(1), "a", 1, 1000).expect("insert");
        mark_unhealthy(&conn, &nid(1), 2000).expect("mark");
        assert_eq!(get(&conn, &nid(1)).expect("get").unhealthy_since, Some(2000));

        record_delivery(&conn, &nid(1), 3000).expect("delivery");
        let row = get(&conn, &nid(1)).expect("get");
        assert_eq!(row.last_notified_at, Some(3000));
        assert!(row.unhealthy_since.is_none());
    }

    #[test]
    fn test_unhealthy_keeps_earliest_mark() {
        let conn = test_db();
        insert(&conn, &nid(1), "a", 1, 1000).expect("insert");
        mark_unhealthy(&conn, &nid(1), 2000).expect("first");
        mark_unhealthy(&conn, &nid(1), 9000).expect("second");
        assert_eq!(get(&conn, &nid(1)).expect("get").unhealthy_since, Some(2000));
    }

    #[test]
    fn test_unhealthy_removal_listing() {
        let conn = test_db();
        insert(&conn, &nid(1), "a", 1, 1000).expect("insert");
        insert(&conn, &nid(2), "b", 2, 1000).expect("insert");
        mark_unhealthy(&conn, &nid(1), 2000).expect("mark");

        let due = list_unhealthy_since_before(&conn, 5000).expect("list");
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].network_id, nid(1));

        assert!(list_unhealthy_since_before(&conn, 1500).expect("list").is_empty());
    }

    #[test]
    fn test_remove() {
        let conn = test_db();
        insert(&conn, &nid(1), "a", 1, 1000).expect("insert");
        assert!(remove(&conn, &nid(1)).expect("remove"));
        assert_eq!(count(&conn).expect("count"), 0);
    }
}
