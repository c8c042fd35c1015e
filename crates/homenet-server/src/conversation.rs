//! Per-connection conversation state machine.
//!
//! ```text
//! NEW ──StartConversation──▶ STARTED ──(role-specific auth)──▶ VERIFIED
//!                                          │
//!                                          └──(hosted+CheckIn)──▶ CHECKED_IN
//!                                                                      │
//!                                                                AppServiceCall
//!                                                                      ▼
//!                                                                  RELAYING
//! ```
//!
//! One task per connection: it reads frames, checks per-state and
//! per-role legality, dispatches, and writes responses. A message that is
//! legal somewhere but not here answers `ErrorBadConversationStatus` and
//! the connection stays open; a protocol violation answers with request
//! id `0x0BADC0DE` and closes.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::RngCore;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::mpsc;

use homenet_crypto::VerifyingKey;
use homenet_proto::frame::{read_frame, write_frame, FrameOutcome};
use homenet_proto::messages::{
    conversation_request, conversation_response, envelope, request, response, single_request,
    single_response, ConversationResponse, Envelope, ListRolesResponse, PingResponse, Response,
    RoleInfo, SemVer, SingleResponse, StartConversationRequest, StartConversationResponse, Status,
    CHALLENGE_LEN,
};
use homenet_proto::version::negotiate;
use homenet_types::IdentityId;

use crate::registry::{ConnId, RelayEvent};
use crate::roles::Role;
use crate::{Context, Result};

/// Read timeout before the conversation is started.
pub const UNAUTH_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Read timeout after the conversation is started.
pub const AUTH_READ_TIMEOUT: Duration = Duration::from_secs(600);

/// Idle timeout for a relaying pair.
pub const RELAY_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Hard ceiling on a conversation's lifetime.
pub const MAX_CONVERSATION_LIFETIME: Duration = Duration::from_secs(1800);

/// Conversation states, in order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConversationStatus {
    /// Accepted, nothing received yet.
    New,
    /// StartConversation succeeded; identity key is bound.
    Started,
    /// Hosting registered (TLS client role).
    Verified,
    /// Checked in as a hosted identity.
    CheckedIn,
    /// Paired with another conversation, relaying opaque bytes.
    Relaying,
}

/// What the dispatcher wants done after a response is written.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// A response plus the connection's fate.
pub struct Reply {
    pub response: Response,
    pub flow: Flow,
}

impl Reply {
    /// Keep-open reply.
    pub fn ok(response: Response) -> Self {
        Self {
            response,
            flow: Flow::Continue,
        }
    }

    /// Keep-open error reply.
    pub fn error(status: Status) -> Self {
        Self {
            response: Response::error(status),
            flow: Flow::Continue,
        }
    }

    /// Reply-then-close, used for signature failures.
    pub fn close(response: Response) -> Self {
        Self {
            response,
            flow: Flow::Close,
        }
    }
}

/// A boxed byte stream, plain TCP or TLS.
pub type BoxedStream = Box<dyn Duplex>;

/// Object-safe alias for the byte streams a conversation runs over,
/// plain TCP or TLS alike.
pub trait Duplex: AsyncRead + AsyncWrite + Unpin + Send + Sync {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync> Duplex for T {}

/// One live connection.
pub struct Conversation {
    pub(crate) ctx: Context,
    pub(crate) conn_id: ConnId,
    pub(crate) role: Role,
    pub(crate) peer_addr: SocketAddr,
    pub(crate) status: ConversationStatus,
    pub(crate) version: Option<SemVer>,
    /// The peer's Ed25519 key, bound by StartConversation.
    pub(crate) peer_key: Option<VerifyingKey>,
    /// Identity the peer checked in as.
    pub(crate) identity: Option<IdentityId>,
    /// Challenge we issued in StartConversation, echoed by CheckIn.
    pub(crate) server_challenge: Vec<u8>,
    /// Cache key of this conversation's last search, for paging.
    pub(crate) last_search_key: Option<crate::SearchCacheKey>,
    /// Relay peer while RELAYING.
    pub(crate) relay_peer: Option<ConnId>,
    /// Id source for server-initiated requests (relay deliveries).
    pub(crate) next_notification_id: u32,
    reader: ReadHalf<BoxedStream>,
    writer: WriteHalf<BoxedStream>,
    relay_rx: mpsc::Receiver<RelayEvent>,
}

impl Conversation {
    /// Wrap an accepted (and possibly TLS-terminated) stream.
    pub fn new(ctx: Context, role: Role, stream: BoxedStream, peer_addr: SocketAddr) -> Self {
        let (relay_tx, relay_rx) = mpsc::channel(64);
        let conn_id = ctx.registry.register(relay_tx);
        let (reader, writer) = tokio::io::split(stream);
        Self {
            ctx,
            conn_id,
            role,
            peer_addr,
            status: ConversationStatus::New,
            version: None,
            peer_key: None,
            identity: None,
            server_challenge: Vec::new(),
            last_search_key: None,
            relay_peer: None,
            next_notification_id: 0x4000_0000,
            reader,
            writer,
            relay_rx,
        }
    }

    fn read_timeout(&self) -> Duration {
        match self.status {
            ConversationStatus::New => UNAUTH_READ_TIMEOUT,
            ConversationStatus::Relaying => RELAY_IDLE_TIMEOUT,
            _ => AUTH_READ_TIMEOUT,
        }
    }

    /// Drive the conversation until it ends.
    pub async fn run(mut self) {
        let mut shutdown = self.ctx.shutdown.subscribe();
        let started_at = Instant::now();

        loop {
            if started_at.elapsed() > MAX_CONVERSATION_LIFETIME {
                tracing::debug!(peer = %self.peer_addr, "conversation lifetime ceiling reached");
                break;
            }

            let timeout = self.read_timeout();
            tokio::select! {
                _ = shutdown.recv() => break,
                event = self.relay_rx.recv() => {
                    let Some(event) = event else { break };
                    if self.handle_relay_event(event).await == Flow::Close {
                        break;
                    }
                }
                outcome = tokio::time::timeout(timeout, read_frame(&mut self.reader)) => {
                    match outcome {
                        Err(_) => {
                            if self.status == ConversationStatus::Relaying {
                                // Idle pair: tear down the relay, keep the
                                // conversation.
                                self.teardown_relay();
                                continue;
                            }
                            tracing::debug!(peer = %self.peer_addr, "conversation idle timeout");
                            break;
                        }
                        Ok(Err(e)) => {
                            tracing::debug!(peer = %self.peer_addr, "read failed: {e}");
                            break;
                        }
                        Ok(Ok(FrameOutcome::Eof)) => break,
                        Ok(Ok(FrameOutcome::ProtocolViolation(reason))) => {
                            tracing::warn!(peer = %self.peer_addr, %reason, "protocol violation");
                            let _ = write_frame(&mut self.writer, &Envelope::protocol_violation())
                                .await;
                            break;
                        }
                        Ok(Ok(FrameOutcome::Message(env))) => {
                            match self.handle_envelope(env).await {
                                Ok(Flow::Continue) => {}
                                Ok(Flow::Close) => break,
                                Err(e) => {
                                    // Only write failures surface here; the
                                    // peer is already gone.
                                    tracing::debug!(peer = %self.peer_addr, "write failed: {e}");
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        }

        self.teardown_relay();
        self.ctx.registry.unregister(self.conn_id);
    }

    async fn handle_envelope(&mut self, env: Envelope) -> Result<Flow> {
        let id = env.id;
        match env.body {
            Some(envelope::Body::Response(_)) => {
                if self.status == ConversationStatus::Relaying {
                    // Acknowledgement of a relayed delivery; nothing to do.
                    Ok(Flow::Continue)
                } else {
                    tracing::warn!(peer = %self.peer_addr, "unsolicited response");
                    write_frame(&mut self.writer, &Envelope::protocol_violation()).await?;
                    Ok(Flow::Close)
                }
            }
            Some(envelope::Body::Request(req)) => {
                // Storage or crypto engine failures answer ErrorInternal
                // and close; everything else is already a typed reply.
                let reply = match self.dispatch_request(req).await {
                    Ok(reply) => reply,
                    Err(e) => {
                        tracing::error!(peer = %self.peer_addr, "internal error: {e}");
                        Reply::close(Response::error(Status::ErrorInternal))
                    }
                };
                let flow = reply.flow;
                write_frame(&mut self.writer, &Envelope::response(id, reply.response)).await?;
                Ok(flow)
            }
            // read_frame rejects empty envelopes.
            None => Ok(Flow::Close),
        }
    }

    async fn dispatch_request(
        &mut self,
        req: homenet_proto::messages::Request,
    ) -> Result<Reply> {
        match req.kind {
            Some(request::Kind::Single(single)) => self.dispatch_single(single).await,
            Some(request::Kind::Conversation(conv)) => self.dispatch_conversation(conv).await,
            Some(request::Kind::LocalService(_)) | None => {
                Ok(Reply::error(Status::ErrorBadConversationStatus))
            }
        }
    }

    async fn dispatch_single(
        &mut self,
        single: homenet_proto::messages::SingleRequest,
    ) -> Result<Reply> {
        let single_roles = matches!(self.role, Role::Primary | Role::ClientNonTls);
        if !single_roles || self.status != ConversationStatus::New {
            return Ok(Reply::error(Status::ErrorBadConversationStatus));
        }

        let response = match single.kind {
            Some(single_request::Kind::Ping(ping)) => Response::ok(response::Kind::Single(
                SingleResponse {
                    kind: Some(single_response::Kind::Ping(PingResponse {
                        payload: ping.payload,
                        clock: self.ctx.now(),
                    })),
                },
            )),
            Some(single_request::Kind::ListRoles(_)) => self.list_roles(),
            Some(single_request::Kind::GetIdentityInformation(req)) => {
                self.get_identity_information(&req).await?
            }
            None => Response::error(Status::ErrorBadConversationStatus),
        };
        // Single requests carry one request and one response, then close.
        Ok(Reply::close(response))
    }

    fn list_roles(&self) -> Response {
        let ports = &self.ctx.ports;
        let roles = vec![
            RoleInfo {
                role: homenet_proto::messages::ServerRole::Primary as i32,
                port: u32::from(ports.primary),
                is_tls: false,
            },
            RoleInfo {
                role: homenet_proto::messages::ServerRole::ClientNonTls as i32,
                port: u32::from(ports.client_non_tls),
                is_tls: false,
            },
            RoleInfo {
                role: homenet_proto::messages::ServerRole::ClientTls as i32,
                port: u32::from(ports.client_tls),
                is_tls: true,
            },
            RoleInfo {
                role: homenet_proto::messages::ServerRole::AppServiceTls as i32,
                port: u32::from(ports.app_service_tls),
                is_tls: true,
            },
        ];
        Response::ok(response::Kind::Single(SingleResponse {
            kind: Some(single_response::Kind::ListRoles(ListRolesResponse { roles })),
        }))
    }

    async fn dispatch_conversation(
        &mut self,
        conv: homenet_proto::messages::ConversationRequest,
    ) -> Result<Reply> {
        use conversation_request::Kind;

        let Some(kind) = conv.kind else {
            return Ok(Reply::error(Status::ErrorBadConversationStatus));
        };

        if !self.is_legal(&kind) {
            return Ok(Reply::error(Status::ErrorBadConversationStatus));
        }

        match kind {
            Kind::Start(req) => self.handle_start(req).await,
            Kind::RegisterHosting(_) => self.handle_register_hosting().await,
            Kind::CheckIn(req) => self.handle_check_in(&req).await,
            Kind::UpdateProfile(req) => self.handle_update_profile(req).await,
            Kind::CancelHostingAgreement(_) => self.handle_cancel_hosting().await,
            Kind::ProfileSearch(req) => self.handle_profile_search(&req).await,
            Kind::ProfileSearchPart(req) => self.handle_profile_search_part(&req),
            Kind::AddRelatedIdentity(req) => self.handle_add_related_identity(&req),
            Kind::RemoveRelatedIdentity(req) => self.handle_remove_related_identity(&req),
            Kind::GetIdentityRelationships(req) => self.handle_get_identity_relationships(&req),
            Kind::AppServiceAdd(req) => self.handle_app_service_add(&req),
            Kind::AppServiceCall(req) => self.handle_app_service_call(&req),
            Kind::AppServiceSendMessage(req) => self.handle_app_service_send(req).await,
            Kind::AppServiceReceiveMessage(_) => {
                Ok(Reply::error(Status::ErrorBadConversationStatus))
            }
            Kind::StartNeighborhoodInitialization(req) => {
                self.handle_start_neighborhood_initialization(&req).await
            }
            Kind::FinishNeighborhoodInitialization(_) => {
                self.handle_finish_neighborhood_initialization().await
            }
            Kind::NeighborhoodSharedProfileUpdate(req) => {
                self.handle_shared_profile_update(req).await
            }
            Kind::StopNeighborhoodUpdates(_) => self.handle_stop_neighborhood_updates().await,
        }
    }

    /// Per-role, per-state legality. Anything false answers
    /// `ErrorBadConversationStatus` and keeps the connection open.
    fn is_legal(&self, kind: &conversation_request::Kind) -> bool {
        use conversation_request::Kind;
        use ConversationStatus as S;

        // While relaying, only relay traffic is accepted.
        if self.status == S::Relaying {
            return matches!(kind, Kind::AppServiceSendMessage(_));
        }

        match kind {
            Kind::Start(_) => self.status == S::New,
            Kind::RegisterHosting(_) => {
                self.role == Role::ClientTls && self.status >= S::Started
            }
            Kind::CheckIn(_) => {
                matches!(self.role, Role::ClientTls | Role::AppServiceTls)
                    && matches!(self.status, S::Started | S::Verified)
            }
            Kind::UpdateProfile(_) | Kind::CancelHostingAgreement(_) => {
                self.role == Role::ClientTls && self.status == S::CheckedIn
            }
            Kind::ProfileSearch(_) | Kind::ProfileSearchPart(_) => match self.role {
                Role::ClientTls => matches!(self.status, S::Verified | S::CheckedIn),
                Role::ClientNonTls => self.status == S::Started,
                _ => false,
            },
            Kind::AddRelatedIdentity(_) | Kind::RemoveRelatedIdentity(_) => {
                self.role == Role::ClientTls && self.status == S::CheckedIn
            }
            Kind::GetIdentityRelationships(_) => match self.role {
                Role::ClientTls => matches!(self.status, S::Verified | S::CheckedIn),
                Role::ClientNonTls => self.status == S::Started,
                _ => false,
            },
            Kind::AppServiceAdd(_) | Kind::AppServiceCall(_) => {
                self.role == Role::AppServiceTls && self.status == S::CheckedIn
            }
            Kind::AppServiceSendMessage(_) | Kind::AppServiceReceiveMessage(_) => false,
            Kind::StartNeighborhoodInitialization(_)
            | Kind::FinishNeighborhoodInitialization(_)
            | Kind::NeighborhoodSharedProfileUpdate(_)
            | Kind::StopNeighborhoodUpdates(_) => {
                self.role == Role::Primary && self.status == S::Started
            }
        }
    }

    async fn handle_start(&mut self, req: StartConversationRequest) -> Result<Reply> {
        if req.public_key.len() != 32 {
            return Ok(Reply::ok(Response::invalid_value("publicKey")));
        }
        if req.client_challenge.len() != CHALLENGE_LEN {
            return Ok(Reply::ok(Response::invalid_value("clientChallenge")));
        }
        let peer_key = match VerifyingKey::from_slice(&req.public_key) {
            Ok(key) => key,
            Err(_) => return Ok(Reply::ok(Response::invalid_value("publicKey"))),
        };
        if peer_key
            .verify_slice(&req.signable_bytes(), &req.signature)
            .is_err()
        {
            return Ok(Reply::close(Response::error(Status::ErrorSignature)));
        }

        let Some(version) = negotiate(&req.supported_versions) else {
            // No mutually supported version: a protocol violation per the
            // wire contract.
            return Ok(Reply::close(Response::error(
                Status::ErrorProtocolViolation,
            )));
        };

        let mut server_challenge = vec![0u8; CHALLENGE_LEN];
        rand::thread_rng().fill_bytes(&mut server_challenge);

        let mut start = StartConversationResponse {
            version: Some(version),
            public_key: self.ctx.keys.keypair.verifying_key.to_bytes().to_vec(),
            server_challenge: server_challenge.clone(),
            client_challenge: req.client_challenge,
            signature: Vec::new(),
        };
        start.signature = self
            .ctx
            .keys
            .keypair
            .signing_key
            .sign(&start.signable_bytes())
            .to_bytes()
            .to_vec();

        self.version = Some(version);
        self.peer_key = Some(peer_key);
        self.server_challenge = server_challenge;
        self.status = ConversationStatus::Started;

        tracing::debug!(peer = %self.peer_addr, role = ?self.role, "conversation started");
        Ok(Reply::ok(Response::ok(response::Kind::Conversation(
            ConversationResponse {
                kind: Some(conversation_response::Kind::Start(start)),
            },
        ))))
    }

    async fn handle_relay_event(&mut self, event: RelayEvent) -> Flow {
        match event {
            RelayEvent::Paired { peer } => {
                self.relay_peer = Some(peer);
                self.status = ConversationStatus::Relaying;
                tracing::debug!(peer = %self.peer_addr, "conversation paired for relay");
                Flow::Continue
            }
            RelayEvent::Data(bytes) => {
                if self.deliver_relayed(bytes).await.is_err() {
                    return Flow::Close;
                }
                Flow::Continue
            }
            RelayEvent::PeerClosed => {
                self.relay_peer = None;
                if self.status == ConversationStatus::Relaying {
                    self.status = ConversationStatus::CheckedIn;
                }
                tracing::debug!(peer = %self.peer_addr, "relay peer closed");
                Flow::Continue
            }
        }
    }

    async fn deliver_relayed(&mut self, bytes: Vec<u8>) -> Result<()> {
        self.next_notification_id += 1;
        let envelope = Envelope::request(
            self.next_notification_id,
            request::Kind::Conversation(homenet_proto::messages::ConversationRequest {
                kind: Some(conversation_request::Kind::AppServiceReceiveMessage(
                    homenet_proto::messages::ApplicationServiceReceiveMessageNotificationRequest {
                        message: bytes,
                    },
                )),
            }),
        );
        write_frame(&mut self.writer, &envelope).await?;
        Ok(())
    }

    /// Drop this side of a relay pair and notify the peer.
    pub(crate) fn teardown_relay(&mut self) {
        if self.relay_peer.take().is_some() {
            self.ctx.registry.unpair(self.conn_id);
            if self.status == ConversationStatus::Relaying {
                self.status = ConversationStatus::CheckedIn;
            }
        }
    }

    /// The protocol version pinned for this conversation, if started.
    pub fn negotiated_version(&self) -> Option<SemVer> {
        self.version
    }

    /// The peer's network id, for primary-role neighbor traffic. Only
    /// present after StartConversation.
    pub(crate) fn peer_network_id(&self) -> Option<homenet_types::NetworkId> {
        self.peer_key
            .as_ref()
            .map(|key| homenet_types::NetworkId::from_bytes(key.to_bytes()))
    }
}
