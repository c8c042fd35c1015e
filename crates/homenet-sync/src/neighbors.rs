//! Neighbor lifecycle: LOC adds and removals.
//!
//! On add we record the neighbor and ask it to take us on as a follower;
//! the neighbor then pushes its profile snapshot to our primary role. On
//! removal we cascade-delete the mirrored profiles and queue a
//! stop-hosting notice so the peer drops us from its follower set.

use std::net::IpAddr;
use std::sync::Arc;

use homenet_db::queries::actions::ActionKind;
use homenet_db::queries::{actions, identities, neighbors};
use homenet_proto::messages::{
    conversation_request, NodeContact, StartNeighborhoodInitializationRequest, Status,
};
use homenet_types::NetworkId;

use crate::client::PeerClient;
use crate::{Result, SyncContext, SyncError};

/// Parse a LOC-provided 4- or 16-byte address.
pub fn parse_ip(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => {
            let arr: [u8; 4] = bytes.try_into().ok()?;
            Some(IpAddr::from(arr))
        }
        16 => {
            let arr: [u8; 16] = bytes.try_into().ok()?;
            Some(IpAddr::from(arr))
        }
        _ => None,
    }
}

/// Handle a neighbor appearing in the LOC neighborhood. Returns `true`
/// if the neighbor was previously unknown.
pub async fn handle_added(ctx: &Arc<SyncContext>, contact: &NodeContact) -> Result<bool> {
    let network_id = NetworkId::from_slice(&contact.network_id)
        .map_err(|e| SyncError::Peer(format!("LOC sent bad network id: {e}")))?;
    let Some(ip) = parse_ip(&contact.ip_address) else {
        return Err(SyncError::Peer("LOC sent bad ip address".into()));
    };
    let port = contact.primary_port as u16;

    let is_new = {
        let conn = ctx.db.lock().await;
        let known = neighbors::get(&conn, &network_id).is_ok();
        if !known && neighbors::count(&conn)? >= ctx.config.max_neighbors {
            tracing::warn!(neighbor = %network_id, "neighbor cap reached, ignoring LOC add");
            return Ok(false);
        }
        neighbors::upsert(
            &conn,
            &network_id,
            &ip.to_string(),
            port,
            contact.distance_bucket,
            ctx.now(),
        )?;
        !known
    };

    if is_new {
        tracing::info!(neighbor = %network_id, %ip, port, "neighbor added");
        let ctx = Arc::clone(ctx);
        let endpoint = format!("{ip}:{port}");
        tokio::spawn(async move {
            if let Err(e) = request_initialization(&ctx, &network_id, &endpoint).await {
                tracing::warn!(
                    neighbor = %network_id,
                    "neighborhood initialization request failed: {e}"
                );
            }
        });
    }
    Ok(is_new)
}

/// Ask a peer to register us as its follower; it will push its snapshot
/// and later its incremental changes to our primary role.
pub async fn request_initialization(
    ctx: &SyncContext,
    target: &NetworkId,
    endpoint: &str,
) -> Result<()> {
    let mut client = PeerClient::connect(endpoint, &ctx.keys, Some(target)).await?;
    let response = client
        .request(
            conversation_request::Kind::StartNeighborhoodInitialization(
                StartNeighborhoodInitializationRequest {
                    primary_port: u32::from(ctx.config.primary_port),
                },
            ),
        )
        .await?;
    match Status::try_from(response.status) {
        Ok(Status::Ok) => {
            tracing::info!(neighbor = %target, "registered as follower of neighbor");
            Ok(())
        }
        // Already their follower: nothing to do.
        Ok(Status::ErrorAlreadyExists) => Ok(()),
        _ => Err(SyncError::Rejected(response.status)),
    }
}

/// Handle a neighbor leaving the neighborhood (LOC removal or staleness).
///
/// Deletes the mirrored profiles and their thumbnail blobs, drops the
/// neighbor row, and queues a stop-hosting notice to the peer.
pub async fn handle_removed(ctx: &Arc<SyncContext>, network_id: &NetworkId) -> Result<()> {
    let thumbnails = {
        let mut conn = ctx.db.lock().await;
        // Mark first: if the cascade is interrupted, the vacuum worker
        // finds the mark and finishes the job.
        if !neighbors::mark_pending_removal(&conn, network_id)? {
            return Ok(());
        }
        let tx = conn
            .transaction()
            .map_err(homenet_db::DbError::Sqlite)?;
        let row = match neighbors::get(&tx, network_id) {
            Ok(row) => row,
            Err(homenet_db::DbError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let thumbnails = identities::delete_neighbor_profiles(&tx, network_id)?;
        actions::enqueue(
            &tx,
            network_id,
            &format!("{}:{}", row.ip_address, row.primary_port),
            ActionKind::StopHosting,
            None,
            &[],
            ctx.now(),
        )?;
        neighbors::remove(&tx, network_id)?;
        tx.commit().map_err(homenet_db::DbError::Sqlite)?;
        thumbnails
    };
    ctx.actions_changed.notify_one();

    for handle in thumbnails {
        if let Err(e) = ctx.images.remove(&handle).await {
            tracing::warn!(%handle, "thumbnail blob removal failed: {e}");
        }
    }
    tracing::info!(neighbor = %network_id, "neighbor removed");
    Ok(())
}
