//! Per-follower action-queue drainers.
//!
//! A supervisor watches the queue and keeps one drainer task alive per
//! target with pending rows (or an undelivered initialization). Each
//! drainer pulls its rows in sequence order, ships them over an
//! authenticated conversation, and deletes them on success — at-least-once
//! delivery with per-(follower, identity) FIFO ordering. Failures back off
//! exponentially; after five consecutive failures the follower is marked
//! unhealthy and the vacuum worker removes it a day later.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use prost::Message as _;
use tokio::task::JoinHandle;

use homenet_db::queries::actions::{ActionKind, ActionRow};
use homenet_db::queries::{actions, followers};
use homenet_proto::messages::{
    conversation_request, NeighborhoodSharedProfileUpdateRequest, SharedProfileUpdateItem, Status,
    FinishNeighborhoodInitializationRequest, StopNeighborhoodUpdatesRequest,
};
use homenet_types::NetworkId;

use crate::client::PeerClient;
use crate::{
    Result, SyncContext, SyncError, BACKOFF_BASE, BACKOFF_CAP, SNAPSHOT_CHUNK,
    UNHEALTHY_AFTER_FAILURES,
};

/// Spawn the drainer supervisor.
pub fn spawn(ctx: Arc<SyncContext>) -> JoinHandle<()> {
    tokio::spawn(async move {
        run_supervisor(ctx).await;
    })
}

async fn run_supervisor(ctx: Arc<SyncContext>) {
    let mut shutdown = ctx.shutdown.subscribe();
    let mut tick = tokio::time::interval(Duration::from_secs(5));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut drainers: HashMap<NetworkId, JoinHandle<()>> = HashMap::new();

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = ctx.actions_changed.notified() => {}
            _ = tick.tick() => {}
        }

        drainers.retain(|_, handle| !handle.is_finished());

        let targets = match collect_targets(&ctx).await {
            Ok(targets) => targets,
            Err(e) => {
                tracing::error!("drainer supervisor query failed: {e}");
                continue;
            }
        };

        for (target, endpoint) in targets {
            if !drainers.contains_key(&target) {
                let ctx = Arc::clone(&ctx);
                drainers.insert(
                    target,
                    tokio::spawn(async move {
                        drain_target(ctx, target, endpoint).await;
                    }),
                );
            }
        }
    }

    // Drainers finish their current action and stop on the same signal.
    for (_, handle) in drainers {
        let _ = handle.await;
    }
}

/// Targets needing a drainer: queues with pending rows, plus followers
/// whose initialization has not completed yet.
async fn collect_targets(ctx: &SyncContext) -> Result<Vec<(NetworkId, String)>> {
    let conn = ctx.db.lock().await;
    let mut targets = actions::pending_targets(&conn)?;
    for follower in followers::list(&conn)? {
        if !follower.initialized
            && !targets.iter().any(|(id, _)| *id == follower.network_id)
        {
            targets.push((follower.network_id, follower.endpoint()));
        }
    }
    Ok(targets)
}

async fn drain_target(ctx: Arc<SyncContext>, target: NetworkId, endpoint: String) {
    let mut shutdown = ctx.shutdown.subscribe();
    let mut failures: u32 = 0;

    loop {
        let batch = {
            let conn = ctx.db.lock().await;
            match actions::next_batch(&conn, &target, SNAPSHOT_CHUNK) {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::error!(target = %target, "drainer queue read failed: {e}");
                    return;
                }
            }
        };

        let batch = match prune_orphans(&ctx, &target, batch).await {
            Ok(batch) => batch,
            Err(e) => {
                tracing::error!(target = %target, "orphan-action prune failed: {e}");
                return;
            }
        };

        if batch.is_empty() {
            if let Err(e) = maybe_finish_initialization(&ctx, &target, &endpoint).await {
                tracing::warn!(target = %target, "initialization finish failed: {e}");
                failures += 1;
                if !backoff(&mut shutdown, failures).await {
                    return;
                }
                continue;
            }
            return;
        }

        let endpoint = batch[0].target_endpoint.clone();
        match deliver_batch(&ctx, &target, &endpoint, &batch).await {
            Ok(()) => {
                failures = 0;
                let seqs: Vec<i64> = batch.iter().map(|a| a.seq).collect();
                let conn = ctx.db.lock().await;
                if let Err(e) = actions::delete(&conn, &seqs) {
                    tracing::error!(target = %target, "delivered-action delete failed: {e}");
                    return;
                }
                let _ = followers::record_delivery(&conn, &target, ctx.now());
            }
            Err(e) => {
                failures += 1;
                tracing::warn!(
                    target = %target,
                    failures,
                    "replication delivery failed: {e}"
                );
                {
                    let conn = ctx.db.lock().await;
                    // The whole batch failed as a unit; every row's attempt
                    // count moves together so give-up checks see the truth.
                    for action in &batch {
                        let _ = actions::increment_attempts(&conn, action.seq);
                    }
                    if failures >= UNHEALTHY_AFTER_FAILURES {
                        let _ = followers::mark_unhealthy(&conn, &target, ctx.now());
                        // Stop-hosting notices are best effort; give up on
                        // an unreachable ex-neighbor after the same number
                        // of attempts that marks a follower unhealthy.
                        let give_up: Vec<i64> = batch
                            .iter()
                            .filter(|a| {
                                a.kind == ActionKind::StopHosting
                                    && a.attempts + 1 >= UNHEALTHY_AFTER_FAILURES
                            })
                            .map(|a| a.seq)
                            .collect();
                        if !give_up.is_empty() {
                            let _ = actions::delete(&conn, &give_up);
                        }
                    }
                }
                if !backoff(&mut shutdown, failures).await {
                    return;
                }
            }
        }

        if shutdown.try_recv().is_ok() {
            return;
        }
    }
}

/// Actions whose target follower no longer exists are dequeued without
/// delivery; only stop-hosting notices survive, since their target is an
/// ex-neighbor by design.
async fn prune_orphans(
    ctx: &SyncContext,
    target: &NetworkId,
    batch: Vec<ActionRow>,
) -> Result<Vec<ActionRow>> {
    let conn = ctx.db.lock().await;
    if followers::get(&conn, target).is_ok() {
        return Ok(batch);
    }
    let (keep, orphans): (Vec<ActionRow>, Vec<ActionRow>) = batch
        .into_iter()
        .partition(|a| a.kind == ActionKind::StopHosting);
    if !orphans.is_empty() {
        let seqs: Vec<i64> = orphans.iter().map(|a| a.seq).collect();
        actions::delete(&conn, &seqs)?;
        tracing::debug!(target = %target, dropped = seqs.len(), "orphan actions dequeued");
    }
    Ok(keep)
}

/// Sleep out the backoff for the given failure count. Returns `false`
/// when shutdown interrupted the sleep.
async fn backoff(shutdown: &mut tokio::sync::broadcast::Receiver<()>, failures: u32) -> bool {
    tokio::select! {
        _ = shutdown.recv() => false,
        _ = tokio::time::sleep(backoff_delay(failures)) => true,
    }
}

/// Exponential backoff: 10 s, 20 s, 40 s, ... capped at one hour.
pub fn backoff_delay(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(16);
    let delay = BACKOFF_BASE.saturating_mul(1u32 << exp);
    delay.min(BACKOFF_CAP)
}

/// One contiguous run of queue rows that ships as a single request.
#[derive(Debug, PartialEq)]
pub enum Segment {
    /// Profile updates batched into one shared-profile-update request.
    Updates(Vec<usize>),
    /// A stop-hosting row, sent alone.
    StopHosting(usize),
}

/// Split a batch into wire segments, preserving order.
pub fn segment_batch(batch: &[ActionRow]) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut run: Vec<usize> = Vec::new();
    for (index, action) in batch.iter().enumerate() {
        if action.kind == ActionKind::StopHosting {
            if !run.is_empty() {
                segments.push(Segment::Updates(std::mem::take(&mut run)));
            }
            segments.push(Segment::StopHosting(index));
        } else {
            run.push(index);
        }
    }
    if !run.is_empty() {
        segments.push(Segment::Updates(run));
    }
    segments
}

async fn deliver_batch(
    ctx: &SyncContext,
    target: &NetworkId,
    endpoint: &str,
    batch: &[ActionRow],
) -> Result<()> {
    let mut client = PeerClient::connect(endpoint, &ctx.keys, Some(target)).await?;

    for segment in segment_batch(batch) {
        let response = match &segment {
            Segment::Updates(indexes) => {
                let mut items = Vec::with_capacity(indexes.len());
                for &i in indexes {
                    let item = SharedProfileUpdateItem::decode(batch[i].payload.as_slice())
                        .map_err(|e| SyncError::InvalidItem(e.to_string()))?;
                    items.push(item);
                }
                client
                    .request(conversation_request::Kind::NeighborhoodSharedProfileUpdate(
                        NeighborhoodSharedProfileUpdateRequest { items },
                    ))
                    .await?
            }
            Segment::StopHosting(_) => {
                client
                    .request(conversation_request::Kind::StopNeighborhoodUpdates(
                        StopNeighborhoodUpdatesRequest {},
                    ))
                    .await?
            }
        };

        match Status::try_from(response.status) {
            Ok(Status::Ok) => {}
            Ok(Status::ErrorBusy) => return Err(SyncError::Rejected(response.status)),
            // A permanent rejection must not poison the queue; the rows
            // count as consumed.
            Ok(status) => {
                tracing::warn!(
                    target = %target,
                    status = ?status,
                    "peer permanently rejected replication segment"
                );
            }
            Err(_) => return Err(SyncError::Peer("unknown response status".into())),
        }
    }
    Ok(())
}

/// After the queue drains: tell an uninitialized follower its snapshot is
/// complete and flip the flag.
async fn maybe_finish_initialization(
    ctx: &SyncContext,
    target: &NetworkId,
    fallback_endpoint: &str,
) -> Result<()> {
    let follower = {
        let conn = ctx.db.lock().await;
        match followers::get(&conn, target) {
            Ok(follower) => follower,
            Err(homenet_db::DbError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        }
    };
    if follower.initialized {
        return Ok(());
    }

    let endpoint = if follower.ip_address.is_empty() {
        fallback_endpoint.to_string()
    } else {
        follower.endpoint()
    };
    let mut client = PeerClient::connect(&endpoint, &ctx.keys, Some(target)).await?;
    let response = client
        .request(conversation_request::Kind::FinishNeighborhoodInitialization(
            FinishNeighborhoodInitializationRequest {},
        ))
        .await?;
    if response.status != Status::Ok as i32 {
        return Err(SyncError::Rejected(response.status));
    }

    let conn = ctx.db.lock().await;
    followers::set_initialized(&conn, target)?;
    tracing::info!(target = %target, "follower initialization complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_delay_growth_and_cap() {
        assert_eq!(backoff_delay(1), Duration::from_secs(10));
        assert_eq!(backoff_delay(2), Duration::from_secs(20));
        assert_eq!(backoff_delay(3), Duration::from_secs(40));
        assert_eq!(backoff_delay(5), Duration::from_secs(160));
        // Deep failure counts saturate at the one-hour cap.
        assert_eq!(backoff_delay(12), BACKOFF_CAP);
        assert_eq!(backoff_delay(60), BACKOFF_CAP);
    }

    fn row(seq: i64, kind: ActionKind) -> ActionRow {
        ActionRow {
            seq,
            target_id: NetworkId::from_bytes([1u8; 32]),
            target_endpoint: "h:1".to_string(),
            kind,
            identity_id: None,
            payload: Vec::new(),
            enqueued_at: 0,
            attempts: 0,
        }
    }

    #[test]
    fn test_segment_batch_groups_updates() {
        let batch = vec![
            row(1, ActionKind::AddProfile),
            row(2, ActionKind::ChangeProfile),
            row(3, ActionKind::StopHosting),
            row(4, ActionKind::RemoveProfile),
        ];
        let segments = segment_batch(&batch);
        assert_eq!(
            segments,
            vec![
                Segment::Updates(vec![0, 1]),
                Segment::StopHosting(2),
                Segment::Updates(vec![3]),
            ]
        );
    }

    #[test]
    fn test_segment_batch_empty() {
        assert!(segment_batch(&[]).is_empty());
    }

    #[test]
    fn test_segment_batch_preserves_order() {
        let batch = vec![
            row(10, ActionKind::RefreshProfile),
            row(11, ActionKind::AddProfile),
        ];
        match &segment_batch(&batch)[0] {
            Segment::Updates(indexes) => assert_eq!(indexes, &[0, 1]),
            other => assert!(false, "unexpected segment: {other:?}"),
        }
    }
}
