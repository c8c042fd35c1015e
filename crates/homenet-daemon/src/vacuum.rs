//! Hourly maintenance worker.
//!
//! Purges hosted identities expired past the retention window, collects
//! orphan image blobs, finishes interrupted neighbor removals, drops
//! neighbors the location service has stopped refreshing, and removes
//! followers that stayed unhealthy for a day.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use homenet_db::queries::{followers, identities, neighbors};
use homenet_sync::{SyncContext, REFRESH_INTERVAL_SECS, UNHEALTHY_REMOVAL_SECS};

/// Interval between maintenance passes.
pub const VACUUM_INTERVAL: Duration = Duration::from_secs(3600);

/// Spawn the vacuum worker.
pub fn spawn(ctx: Arc<SyncContext>, hosting_retention_days: u64) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut shutdown = ctx.shutdown.subscribe();
        let mut tick = tokio::time::interval(VACUUM_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tick.tick() => {
                    if let Err(e) = pass(&ctx, hosting_retention_days).await {
                        tracing::error!("vacuum pass failed: {e}");
                    }
                }
            }
        }
    })
}

/// One full maintenance pass.
pub async fn pass(ctx: &Arc<SyncContext>, hosting_retention_days: u64) -> homenet_sync::Result<()> {
    let now = ctx.now();
    let retention_secs = hosting_retention_days * 24 * 3600;

    // Expired hosted identities past retention.
    let purged = {
        let conn = ctx.db.lock().await;
        identities::purge_expired(&conn, now, retention_secs)?
    };
    for (identity, handles) in &purged {
        tracing::info!(identity = %identity, "expired hosting purged");
        for handle in handles {
            if let Err(e) = ctx.images.remove(handle).await {
                tracing::warn!(%handle, "purged blob removal failed: {e}");
            }
        }
    }

    // Neighbors whose removal was interrupted, then stale ones.
    let leftover: Vec<_> = {
        let conn = ctx.db.lock().await;
        neighbors::list_pending_removal(&conn)?
    };
    for neighbor in leftover {
        homenet_sync::neighbors::handle_removed(ctx, &neighbor.network_id).await?;
    }
    let stale_cutoff = now.saturating_sub(ctx.config.neighbor_expiration_secs);
    let stale: Vec<_> = {
        let conn = ctx.db.lock().await;
        neighbors::list_stale(&conn, stale_cutoff)?
    };
    for neighbor in stale {
        tracing::info!(neighbor = %neighbor.network_id, "stale neighbor removed");
        homenet_sync::neighbors::handle_removed(ctx, &neighbor.network_id).await?;
    }

    // Followers unhealthy past the removal window.
    let unhealthy_cutoff = now.saturating_sub(UNHEALTHY_REMOVAL_SECS);
    let due: Vec<_> = {
        let conn = ctx.db.lock().await;
        followers::list_unhealthy_since_before(&conn, unhealthy_cutoff)?
    };
    for follower in due {
        tracing::info!(follower = %follower.network_id, "unhealthy follower removed");
        let mut conn = ctx.db.lock().await;
        homenet_sync::followers::remove_follower(&mut conn, &follower.network_id)?;
    }

    // Keep-alive refreshes for followers we have not pushed to lately;
    // a dead follower then fails its way into the removal path above.
    let refreshed = {
        let mut conn = ctx.db.lock().await;
        homenet_sync::followers::enqueue_refresh(&mut conn, REFRESH_INTERVAL_SECS, now)?
    };
    if refreshed > 0 {
        ctx.actions_changed.notify_one();
    }

    // Orphan image blobs last, once the row set is final.
    let live: HashSet<_> = {
        let conn = ctx.db.lock().await;
        identities::all_image_handles(&conn)?.into_iter().collect()
    };
    let removed = ctx.images.gc_orphans(&live).await?;
    tracing::debug!(
        purged = purged.len(),
        orphan_blobs = removed,
        "vacuum pass complete"
    );
    Ok(())
}
