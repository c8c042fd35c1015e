//! Durable replication action queue.
//!
//! One row per (target, action). Rows for the same target drain in `seq`
//! order, which gives the per-(follower, identity) FIFO guarantee; rows
//! are enqueued inside the same transaction as the profile mutation that
//! caused them, so an action can never exist without its mutation or vice
//! versa.

use rusqlite::{params, Connection};

use homenet_types::{IdentityId, NetworkId};

use crate::{DbError, Result};

/// Kind of a queued replication action.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionKind {
    AddProfile = 1,
    ChangeProfile = 2,
    RemoveProfile = 3,
    RefreshProfile = 4,
    StopHosting = 5,
}

impl ActionKind {
    fn from_i64(value: i64) -> Result<Self> {
        Ok(match value {
            1 => Self::AddProfile,
            2 => Self::ChangeProfile,
            3 => Self::RemoveProfile,
            4 => Self::RefreshProfile,
            5 => Self::StopHosting,
            other => return Err(DbError::Corrupt(format!("action kind {other}"))),
        })
    }
}

/// A queued action row.
#[derive(Clone, Debug)]
pub struct ActionRow {
    pub seq: i64,
    pub target_id: NetworkId,
    pub target_endpoint: String,
    pub kind: ActionKind,
    pub identity_id: Option<IdentityId>,
    /// Encoded `SharedProfileUpdateItem` snapshot taken at enqueue time,
    /// empty for `StopHosting`.
    pub payload: Vec<u8>,
    pub enqueued_at: u64,
    pub attempts: u32,
}

/// Append an action for a target peer. Returns the assigned sequence.
pub fn enqueue(
    conn: &Connection,
    target_id: &NetworkId,
    target_endpoint: &str,
    kind: ActionKind,
    identity_id: Option<&IdentityId>,
    payload: &[u8],
    now: u64,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO neighborhood_actions \
         (target_id, target_endpoint, kind, identity_id, payload, enqueued_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            target_id.as_bytes().as_slice(),
            target_endpoint,
            kind as i64,
            identity_id.map(|id| id.as_bytes().to_vec()),
            payload,
            now as i64,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn row_to_action(row: &rusqlite::Row<'_>) -> rusqlite::Result<(Vec<u8>, Option<Vec<u8>>, i64, ActionRowPartial)>
{
    Ok((
        row.get(1)?,
        row.get(4)?,
        row.get(3)?,
        ActionRowPartial {
            seq: row.get(0)?,
            target_endpoint: row.get(2)?,
            payload: row.get(5)?,
            enqueued_at: row.get::<_, i64>(6)? as u64,
            attempts: row.get::<_, i64>(7)? as u32,
        },
    ))
}

struct ActionRowPartial {
    seq: i64,
    target_endpoint: String,
    payload: Vec<u8>,
    enqueued_at: u64,
    attempts: u32,
}

fn finish(raw: (Vec<u8>, Option<Vec<u8>>, i64, ActionRowPartial)) -> Result<ActionRow> {
    let (target, identity, kind, partial) = raw;
    Ok(ActionRow {
        seq: partial.seq,
        target_id: NetworkId::from_slice(&target)
            .map_err(|e| DbError::Corrupt(format!("target_id: {e}")))?,
        target_endpoint: partial.target_endpoint,
        kind: ActionKind::from_i64(kind)?,
        identity_id: identity
            .map(|id| IdentityId::from_slice(&id))
            .transpose()
            .map_err(|e| DbError::Corrupt(format!("identity_id: {e}")))?,
        payload: partial.payload,
        enqueued_at: partial.enqueued_at,
        attempts: partial.attempts,
    })
}

const COLUMNS: &str =
    "seq, target_id, target_endpoint, kind, identity_id, payload, enqueued_at, attempts";

/// The oldest pending actions for a target, in enqueue order.
pub fn next_batch(conn: &Connection, target_id: &NetworkId, limit: usize) -> Result<Vec<ActionRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM neighborhood_actions \
         WHERE target_id = ?1 ORDER BY seq ASC LIMIT ?2"
    ))?;
    let raws = stmt
        .query_map(
            params![target_id.as_bytes().as_slice(), limit as i64],
            row_to_action,
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    raws.into_iter().map(finish).collect()
}

/// Delete delivered actions by sequence number.
pub fn delete(conn: &Connection, seqs: &[i64]) -> Result<()> {
    let mut stmt = conn.prepare("DELETE FROM neighborhood_actions WHERE seq = ?1")?;
    for seq in seqs {
        stmt.execute([seq])?;
    }
    Ok(())
}

/// Drop every pending action for a target (follower removed).
pub fn delete_for_target(conn: &Connection, target_id: &NetworkId) -> Result<usize> {
    let changed = conn.execute(
        "DELETE FROM neighborhood_actions WHERE target_id = ?1",
        [target_id.as_bytes().as_slice()],
    )?;
    Ok(changed)
}

/// Bump the attempt counter after a failed delivery.
pub fn increment_attempts(conn: &Connection, seq: i64) -> Result<()> {
    conn.execute(
        "UPDATE neighborhood_actions SET attempts = attempts + 1 WHERE seq = ?1",
        [seq],
    )?;
    Ok(())
}

/// Number of pending actions for a target.
pub fn count_for_target(conn: &Connection, target_id: &NetworkId) -> Result<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM neighborhood_actions WHERE target_id = ?1",
        [target_id.as_bytes().as_slice()],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

/// Every target that has pending actions, with the endpoint of its oldest
/// row. The drainer supervisor spawns one drainer per entry.
pub fn pending_targets(conn: &Connection) -> Result<Vec<(NetworkId, String)>> {
    let mut stmt = conn.prepare(
        "SELECT target_id, target_endpoint, MIN(seq) FROM neighborhood_actions \
         GROUP BY target_id",
    )?;
    let raws: Vec<(Vec<u8>, String)> = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    raws.into_iter()
        .map(|(id, endpoint)| {
            let id = NetworkId::from_slice(&id)
                .map_err(|e| DbError::Corrupt(format!("target_id: {e}")))?;
            Ok((id, endpoint))
        })
        .collect()
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

    fn iid(byte: u8) -> IdentityId {
        IdentityId::from_bytes([byte; 20])
    }

    #[test]
    fn test_enqueue_and_drain_order() {
        let conn = test_db();
        let target = nid(1);
        for i in 0..5u8 {
            enqueue(
                &conn,
                &target,
                "198.51.100.7:16987",
                ActionKind::ChangeProfile,
                Some(&iid(9)),
                &[i],
                1000 + u64::from(i),
            )
            .expect("enqueue");
        }

        let batch = next_batch(&conn, &target, 10).expect("batch");
        assert_eq!(batch.len(), 5);
        for window in batch.windows(2) {
            assert!(window[0].seq < window[1].seq);
        }
        assert_eq!(batch[0].payload, vec![0]);
        assert_eq!(batch[4].payload, vec![4]);
    }

    #[test]
    fn test_batch_limit_and_delete() {
        let conn = test_db();
        let target = nid(1);
        for i in 0..4u8 {
            enqueue(
                &conn,
                &target,
                "e",
                ActionKind::AddProfile,
                Some(&iid(i)),
                &[],
                1000,
            )
            .expect("enqueue");
        }

        let first = next_batch(&conn, &target, 2).expect("batch");
        assert_eq!(first.len(), 2);
        delete(&conn, &first.iter().map(|a| a.seq).collect::<Vec<_>>()).expect("delete");

        let rest = next_batch(&conn, &target, 10).expect("batch");
        assert_eq!(rest.len(), 2);
        assert!(rest[0].seq > first[1].seq);
    }

    #[test]
    fn test_per_target_isolation() {
        let conn = test_db();
        enqueue(&conn, &nid(1), "a", ActionKind::AddProfile, None, &[], 1000).expect("enqueue");
        enqueue(&conn, &nid(2), "b", ActionKind::AddProfile, None, &[], 1000).expect("enqueue");

        assert_eq!(next_batch(&conn, &nid(1), 10).expect("batch").len(), 1);
        assert_eq!(count_for_target(&conn, &nid(2)).expect("count"), 1);

        let targets = pending_targets(&conn).expect("targets");
        assert_eq!(targets.len(), 2);
    }

    #[test]
    fn test_delete_for_target() {
        let conn = test_db();
        enqueue(&conn, &nid(1), "a", ActionKind::AddProfile, None, &[], 1000).expect("enqueue");
        enqueue(&conn, &nid(1), "a", ActionKind::RemoveProfile, None, &[], 1001).expect("enqueue");
        assert_eq!(delete_for_target(&conn, &nid(1)).expect("delete"), 2);
        assert_eq!(count_for_target(&conn, &nid(1)).expect("count"), 0);
    }

    #[test]
    fn test_attempts_increment() {
        let conn = test_db();
        let seq = enqueue(&conn, &nid(1), "a", ActionKind::StopHosting, None, &[], 1000)
            .expect("enqueue");
        increment_attempts(&conn, seq).expect("bump");
        increment_attempts(&conn, seq).expect("bump");

        let batch = next_batch(&conn, &nid(1), 1).expect("batch");
        assert_eq!(batch[0].attempts, 2);
        assert_eq!(batch[0].kind, ActionKind::StopHosting);
        assert!(batch[0].identity_id.is_none());
    }
}
