//! Follower registration and removal.
//!
//! Any peer reaching our primary role may ask to become a follower; there
//! is deliberately no authorization beyond the Ed25519 conversation
//! handshake (documented source behavior). The [`authorize_follower`]
//! hook is where a future policy would land.

use rusqlite::Connection;

use homenet_db::queries::{actions, followers, identities};
use homenet_db::DbError;
use homenet_images::ImageStore;
use homenet_types::NetworkId;

use crate::{actions as action_builders, Result, SNAPSHOT_CHUNK};

/// Outcome of a registration attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// Follower registered; the snapshot is in the queue.
    Registered,
    /// The peer is already a follower.
    AlreadyExists,
    /// The follower cap is reached.
    QuotaExceeded,
}

/// Decide whether a peer may become a follower. Currently every
/// authenticated peer is accepted.
pub fn authorize_follower(_peer: &NetworkId) -> bool {
    true
}

/// Register a peer as a follower and enqueue the full snapshot of our
/// active hosted profiles as AddProfile actions, all in one transaction.
///
/// The snapshot rows drain to the peer in chunks of at most
/// [`SNAPSHOT_CHUNK`]; once the queue is empty the drainer sends
/// FinishNeighborhoodInitialization and flips the initialized flag.
pub fn register_follower(
    conn: &mut Connection,
    images: &ImageStore,
    peer: &NetworkId,
    ip_address: &str,
    primary_port: u16,
    max_followers: u64,
    now: u64,
) -> Result<RegisterOutcome> {
    if !authorize_follower(peer) {
        return Ok(RegisterOutcome::QuotaExceeded);
    }

    let tx = conn.transaction().map_err(DbError::Sqlite)?;

    if followers::count(&tx)? >= max_followers {
        return Ok(RegisterOutcome::QuotaExceeded);
    }
    match followers::insert(&tx, peer, ip_address, primary_port, now) {
        Ok(()) => {}
        Err(DbError::Constraint(_)) => return Ok(RegisterOutcome::AlreadyExists),
        Err(e) => return Err(e.into()),
    }

    let endpoint = format!("{ip_address}:{primary_port}");
    let mut offset = 0u64;
    let mut total = 0usize;
    loop {
        let page = identities::list_hosted_active(&tx, offset, SNAPSHOT_CHUNK as u64)?;
        if page.is_empty() {
            break;
        }
        offset += page.len() as u64;
        for profile in &page {
            let item = action_builders::add_item(images, profile);
            actions::enqueue(
                &tx,
                peer,
                &endpoint,
                homenet_db::queries::actions::ActionKind::AddProfile,
                Some(&profile.identity_id),
                &prost::Message::encode_to_vec(&item),
                now,
            )?;
            total += 1;
        }
    }

    tx.commit().map_err(DbError::Sqlite)?;
    tracing::info!(peer = %peer, snapshot_rows = total, "follower registered");
    Ok(RegisterOutcome::Registered)
}

/// Enqueue RefreshProfile keep-alives for followers that have not seen a
/// delivery in `interval_secs`. One action per active hosted profile, in
/// the same identity order as a snapshot, so a silent-but-dead follower
/// accumulates failures and ages into removal instead of lingering.
///
/// Followers with pending actions, an unhealthy mark, or an unfinished
/// snapshot are skipped; their queues already probe them.
pub fn enqueue_refresh(conn: &mut Connection, interval_secs: u64, now: u64) -> Result<usize> {
    let cutoff = now.saturating_sub(interval_secs);
    let tx = conn.transaction().map_err(DbError::Sqlite)?;

    let mut enqueued = 0usize;
    for follower in followers::list(&tx)? {
        if !follower.initialized || follower.unhealthy_since.is_some() {
            continue;
        }
        if follower.last_notified_at.unwrap_or(follower.created_at) > cutoff {
            continue;
        }
        if actions::count_for_target(&tx, &follower.network_id)? > 0 {
            continue;
        }

        let endpoint = follower.endpoint();
        let mut offset = 0u64;
        loop {
            let page = identities::list_hosted_active(&tx, offset, SNAPSHOT_CHUNK as u64)?;
            if page.is_empty() {
                break;
            }
            offset += page.len() as u64;
            for profile in &page {
                let item = action_builders::refresh_item(&profile.identity_id);
                actions::enqueue(
                    &tx,
                    &follower.network_id,
                    &endpoint,
                    homenet_db::queries::actions::ActionKind::RefreshProfile,
                    Some(&profile.identity_id),
                    &prost::Message::encode_to_vec(&item),
                    now,
                )?;
                enqueued += 1;
            }
        }
    }

    tx.commit().map_err(DbError::Sqlite)?;
    if enqueued > 0 {
        tracing::info!(rows = enqueued, "follower keep-alive refresh enqueued");
    }
    Ok(enqueued)
}

/// Drop a follower and its pending actions (the peer signalled leave, or
/// it stayed unhealthy past the removal window).
pub fn remove_follower(conn: &mut Connection, peer: &NetworkId) -> Result<bool> {
    let tx = conn.transaction().map_err(DbError::Sqlite)?;
    let existed = followers::remove(&tx, peer)?;
    actions::delete_for_target(&tx, peer)?;
    tx.commit().map_err(DbError::Sqlite)?;
    if existed {
        tracing::info!(peer = %peer, "follower removed");
    }
    Ok(existed)
}
