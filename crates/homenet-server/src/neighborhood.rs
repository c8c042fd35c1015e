//! Incoming neighbor traffic on the primary role.
//!
//! Peers authenticate with the ordinary StartConversation handshake; the
//! peer's public key doubles as its network id. From here a peer can
//! register as our follower (and receive our snapshot through the action
//! queue), push shared-profile batches for profiles we mirror from it,
//! and end the relationship in either direction.

use homenet_db::queries::{followers, identities, neighbors};
use homenet_proto::messages::{
    conversation_response, response, ConversationResponse,
    FinishNeighborhoodInitializationResponse, NeighborhoodSharedProfileUpdateRequest,
    NeighborhoodSharedProfileUpdateResponse, Response,
    StartNeighborhoodInitializationRequest, StartNeighborhoodInitializationResponse, Status,
    StopNeighborhoodUpdatesResponse,
};

use crate::conversation::{Conversation, Reply};
use crate::Result;
use homenet_sync::followers::RegisterOutcome;
use homenet_sync::SyncError;

fn conv_ok(kind: conversation_response::Kind) -> Reply {
    Reply::ok(Response::ok(response::Kind::Conversation(
        ConversationResponse { kind: Some(kind) },
    )))
}

impl Conversation {
    pub(crate) async fn handle_start_neighborhood_initialization(
        &mut self,
        req: &StartNeighborhoodInitializationRequest,
    ) -> Result<Reply> {
        let Some(peer) = self.peer_network_id() else {
            return Ok(Reply::error(Status::ErrorBadConversationStatus));
        };
        let Ok(port) = u16::try_from(req.primary_port) else {
            return Ok(Reply::ok(Response::invalid_value("primaryPort")));
        };
        if port == 0 {
            return Ok(Reply::ok(Response::invalid_value("primaryPort")));
        }

        let outcome = {
            let mut conn = self.ctx.db.lock().await;
            homenet_sync::followers::register_follower(
                &mut conn,
                &self.ctx.images,
                &peer,
                &self.peer_addr.ip().to_string(),
                port,
                self.ctx.limits.max_followers,
                self.ctx.now(),
            )?
        };

        match outcome {
            RegisterOutcome::Registered => {
                self.ctx.actions_changed.notify_one();
                Ok(conv_ok(
                    conversation_response::Kind::StartNeighborhoodInitialization(
                        StartNeighborhoodInitializationResponse {},
                    ),
                ))
            }
            RegisterOutcome::AlreadyExists => Ok(Reply::error(Status::ErrorAlreadyExists)),
            RegisterOutcome::QuotaExceeded => Ok(Reply::error(Status::ErrorQuotaExceeded)),
        }
    }

    pub(crate) async fn handle_finish_neighborhood_initialization(&mut self) -> Result<Reply> {
        let Some(peer) = self.peer_network_id() else {
            return Ok(Reply::error(Status::ErrorBadConversationStatus));
        };
        let known = {
            let conn = self.ctx.db.lock().await;
            neighbors::get(&conn, &peer).is_ok()
        };
        if !known {
            return Ok(Reply::error(Status::ErrorNotFound));
        }
        tracing::info!(neighbor = %peer, "neighbor snapshot complete");
        Ok(conv_ok(
            conversation_response::Kind::FinishNeighborhoodInitialization(
                FinishNeighborhoodInitializationResponse {},
            ),
        ))
    }

    pub(crate) async fn handle_shared_profile_update(
        &mut self,
        req: NeighborhoodSharedProfileUpdateRequest,
    ) -> Result<Reply> {
        let Some(peer) = self.peer_network_id() else {
            return Ok(Reply::error(Status::ErrorBadConversationStatus));
        };
        if req.items.len() > homenet_sync::SNAPSHOT_CHUNK {
            return Ok(Reply::ok(Response::invalid_value("items")));
        }
        let known = {
            let conn = self.ctx.db.lock().await;
            neighbors::get(&conn, &peer).is_ok()
        };
        if !known {
            return Ok(Reply::error(Status::ErrorNotFound));
        }

        let applied = {
            let mut conn = self.ctx.db.lock().await;
            homenet_sync::apply::apply_batch(
                &mut conn,
                &self.ctx.images,
                &peer,
                &req.items,
                self.ctx.now(),
            )
        };
        match applied {
            Ok(counts) => {
                tracing::debug!(
                    neighbor = %peer,
                    added = counts.added,
                    changed = counts.changed,
                    removed = counts.removed,
                    "neighbor batch applied"
                );
                self.invalidate_search_cache();
                Ok(conv_ok(
                    conversation_response::Kind::NeighborhoodSharedProfileUpdate(
                        NeighborhoodSharedProfileUpdateResponse {},
                    ),
                ))
            }
            Err(SyncError::InvalidItem(reason)) => {
                tracing::warn!(neighbor = %peer, %reason, "invalid shared-profile item");
                Ok(Reply::ok(Response::invalid_value("items")))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub(crate) async fn handle_stop_neighborhood_updates(&mut self) -> Result<Reply> {
        let Some(peer) = self.peer_network_id() else {
            return Ok(Reply::error(Status::ErrorBadConversationStatus));
        };

        let mut handled = false;
        {
            let mut conn = self.ctx.db.lock().await;
            if followers::get(&conn, &peer).is_ok() {
                homenet_sync::followers::remove_follower(&mut conn, &peer)?;
                handled = true;
            }
        }

        // The peer may also (or instead) be a neighbor telling us it
        // stopped hosting; drop its mirrored profiles without echoing a
        // stop-hosting notice back.
        let thumbnails = {
            let mut conn = self.ctx.db.lock().await;
            if neighbors::get(&conn, &peer).is_ok() {
                let tx = conn
                    .transaction()
                    .map_err(homenet_db::DbError::Sqlite)?;
                let thumbnails = identities::delete_neighbor_profiles(&tx, &peer)?;
                neighbors::remove(&tx, &peer)?;
                tx.commit().map_err(homenet_db::DbError::Sqlite)?;
                handled = true;
                thumbnails
            } else {
                Vec::new()
            }
        };
        for handle in thumbnails {
            if let Err(e) = self.ctx.images.remove(&handle).await {
                tracing::warn!(%handle, "thumbnail blob removal failed: {e}");
            }
        }

        if !handled {
            return Ok(Reply::error(Status::ErrorNotFound));
        }
        self.invalidate_search_cache();
        tracing::info!(peer = %peer, "neighborhood relationship stopped");
        Ok(conv_ok(conversation_response::Kind::StopNeighborhoodUpdates(
            StopNeighborhoodUpdatesResponse {},
        )))
    }
}
