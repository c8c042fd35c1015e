//! Location-service (LOC) client loop.
//!
//! One long-lived TCP connection to the configured LOC endpoint. On
//! connect the server registers its Profile service (port + SHA-256
//! service tag), reads the neighborhood ordered by distance, and then
//! consumes streamed change notifications. Any failure tears the session
//! down and a fresh one starts after ten seconds, forever, until
//! shutdown. A clean shutdown deregisters the service.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use homenet_crypto::service_tag;
use homenet_proto::frame::{read_frame, write_frame, FrameOutcome};
use homenet_proto::messages::{
    envelope, local_service_request, local_service_response, neighbourhood_change, request,
    DeregisterServiceRequest, Envelope, GetNeighbourNodesRequest, LocalServiceRequest,
    LocalServiceResponse, NeighbourhoodChangedNotificationRequest, RegisterServiceRequest,
    Response, ServiceType, Status,
};
use homenet_types::NetworkId;

use crate::{neighbors, Result, SyncContext, SyncError, LOC_RECONNECT_DELAY};

/// Spawn the LOC client task.
pub fn spawn(ctx: Arc<SyncContext>) -> JoinHandle<()> {
    tokio::spawn(async move {
        run(ctx).await;
    })
}

async fn run(ctx: Arc<SyncContext>) {
    let mut shutdown = ctx.shutdown.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            result = session(&ctx) => {
                match result {
                    Ok(()) => tracing::info!("LOC session ended"),
                    Err(e) => tracing::warn!("LOC session failed: {e}"),
                }
            }
        }
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = tokio::time::sleep(LOC_RECONNECT_DELAY) => {}
        }
    }
    deregister(&ctx).await;
}

struct LocSession {
    stream: TcpStream,
    next_id: u32,
}

impl LocSession {
    async fn request(
        &mut self,
        ctx: &Arc<SyncContext>,
        kind: local_service_request::Kind,
    ) -> Result<LocalServiceResponse> {
        self.next_id += 1;
        let id = self.next_id;
        let envelope = Envelope::request(
            id,
            request::Kind::LocalService(LocalServiceRequest { kind: Some(kind) }),
        );
        write_frame(&mut self.stream, &envelope).await?;

        loop {
            match read_frame(&mut self.stream).await? {
                FrameOutcome::Message(env) => match env.body {
                    Some(envelope::Body::Response(resp)) if env.id == id => {
                        if resp.status != Status::Ok as i32 {
                            return Err(SyncError::Rejected(resp.status));
                        }
                        match resp.kind {
                            Some(homenet_proto::messages::response::Kind::LocalService(ls)) => {
                                return Ok(ls)
                            }
                            _ => return Err(SyncError::Peer("LOC answered wrong family".into())),
                        }
                    }
                    Some(envelope::Body::Request(req)) => {
                        // Streamed notifications may interleave with our
                        // own request-response exchanges.
                        handle_loc_request(ctx, &mut self.stream, env.id, req).await?;
                    }
                    _ => continue,
                },
                FrameOutcome::ProtocolViolation(reason) => {
                    return Err(SyncError::Peer(format!("LOC protocol violation: {reason}")))
                }
                FrameOutcome::Eof => return Err(SyncError::Peer("LOC closed connection".into())),
            }
        }
    }
}

async fn session(ctx: &Arc<SyncContext>) -> Result<()> {
    let stream = tokio::time::timeout(
        Duration::from_secs(10),
        TcpStream::connect(ctx.config.loc_endpoint),
    )
    .await
    .map_err(|_| SyncError::Timeout)??;
    tracing::info!(endpoint = %ctx.config.loc_endpoint, "connected to LOC");

    let mut session = LocSession { stream, next_id: 0 };

    session
        .request(
            ctx,
            local_service_request::Kind::RegisterService(RegisterServiceRequest {
                service_type: ServiceType::Profile as i32,
                port: u32::from(ctx.config.primary_port),
                service_data: service_tag(ctx.keys.keypair.verifying_key.as_bytes()).to_vec(),
            }),
        )
        .await?;

    let neighborhood = session
        .request(
            ctx,
            local_service_request::Kind::GetNeighbourNodes(GetNeighbourNodesRequest {
                keep_alive_and_send_updates: true,
            }),
        )
        .await?;
    if let Some(local_service_response::Kind::GetNeighbourNodes(list)) = neighborhood.kind {
        tracing::info!(count = list.nodes.len(), "LOC neighborhood received");
        for contact in &list.nodes {
            if let Err(e) = neighbors::handle_added(ctx, contact).await {
                tracing::warn!("LOC neighborhood entry rejected: {e}");
            }
        }
    }

    // Streaming phase: consume change notifications until the connection
    // breaks or shutdown drops the whole session future.
    loop {
        match read_frame(&mut session.stream).await? {
            FrameOutcome::Message(env) => match env.body {
                Some(envelope::Body::Request(req)) => {
                    handle_loc_request(ctx, &mut session.stream, env.id, req).await?;
                }
                Some(envelope::Body::Response(_)) => continue,
                None => continue,
            },
            FrameOutcome::ProtocolViolation(reason) => {
                return Err(SyncError::Peer(format!("LOC protocol violation: {reason}")))
            }
            FrameOutcome::Eof => return Err(SyncError::Peer("LOC closed connection".into())),
        }
    }
}

async fn handle_loc_request(
    ctx: &Arc<SyncContext>,
    stream: &mut TcpStream,
    envelope_id: u32,
    req: homenet_proto::messages::Request,
) -> Result<()> {
    let Some(request::Kind::LocalService(ls)) = req.kind else {
        tracing::debug!("ignoring non-local-service request from LOC");
        return Ok(());
    };
    let Some(local_service_request::Kind::NeighbourhoodChanged(notification)) = ls.kind else {
        tracing::debug!("ignoring unexpected local-service request from LOC");
        return Ok(());
    };

    apply_changes(ctx, &notification).await;

    let ack = Envelope::response(
        envelope_id,
        Response::ok(homenet_proto::messages::response::Kind::LocalService(
            LocalServiceResponse {
                kind: Some(local_service_response::Kind::NeighbourhoodChanged(
                    homenet_proto::messages::NeighbourhoodChangedNotificationResponse {},
                )),
            },
        )),
    );
    write_frame(stream, &ack).await?;
    Ok(())
}

async fn apply_changes(
    ctx: &Arc<SyncContext>,
    notification: &NeighbourhoodChangedNotificationRequest,
) {
    for change in &notification.changes {
        match &change.change {
            Some(neighbourhood_change::Change::Added(contact)) => {
                if let Err(e) = neighbors::handle_added(ctx, contact).await {
                    tracing::warn!("LOC add rejected: {e}");
                }
            }
            Some(neighbourhood_change::Change::Removed(id_bytes)) => {
                match NetworkId::from_slice(id_bytes) {
                    Ok(id) => {
                        if let Err(e) = neighbors::handle_removed(ctx, &id).await {
                            tracing::warn!(neighbor = %id, "LOC removal failed: {e}");
                        }
                    }
                    Err(e) => tracing::warn!("LOC sent bad removal id: {e}"),
                }
            }
            None => {}
        }
    }
}

/// Best-effort service deregistration on clean shutdown.
async fn deregister(ctx: &Arc<SyncContext>) {
    let attempt = async {
        let stream = TcpStream::connect(ctx.config.loc_endpoint).await?;
        let mut session = LocSession { stream, next_id: 0 };
        session
            .request(
                ctx,
                local_service_request::Kind::DeregisterService(DeregisterServiceRequest {
                    service_type: ServiceType::Profile as i32,
                }),
            )
            .await?;
        Ok::<(), SyncError>(())
    };
    match tokio::time::timeout(Duration::from_secs(5), attempt).await {
        Ok(Ok(())) => tracing::info!("LOC service deregistered"),
        Ok(Err(e)) => tracing::warn!("LOC deregistration failed: {e}"),
        Err(_) => tracing::warn!("LOC deregistration timed out"),
    }
}
