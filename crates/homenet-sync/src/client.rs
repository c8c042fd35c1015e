//! Outbound conversation client for peer profile servers.
//!
//! The drainer and the neighbor-initialization path both talk to a peer's
//! primary role: open a TCP connection, run the signed StartConversation
//! exchange, then issue conversation requests. The peer's network id is
//! its public key, so the handshake doubles as endpoint authentication.

use rand::RngCore;
use tokio::net::TcpStream;

use homenet_crypto::{NodeKeys, VerifyingKey};
use homenet_proto::frame::{read_frame, write_frame, FrameOutcome};
use homenet_proto::messages::{
    conversation_request, conversation_response, envelope, request, response,
    ConversationRequest, Envelope, Response, StartConversationRequest, Status, CHALLENGE_LEN,
};
use homenet_proto::version::SUPPORTED_VERSIONS;
use homenet_types::NetworkId;

use crate::{Result, SyncError, SEND_TIMEOUT};

/// An authenticated conversation with a peer server.
pub struct PeerClient {
    stream: TcpStream,
    peer_key: VerifyingKey,
    next_id: u32,
}

impl PeerClient {
    /// Connect to a peer's primary role and run StartConversation.
    ///
    /// If `expected` is given, the peer must prove possession of exactly
    /// that network id or the connection is dropped.
    pub async fn connect(
        endpoint: &str,
        keys: &NodeKeys,
        expected: Option<&NetworkId>,
    ) -> Result<Self> {
        let stream = tokio::time::timeout(SEND_TIMEOUT, TcpStream::connect(endpoint))
            .await
            .map_err(|_| SyncError::Timeout)??;
        let mut client = Self {
            stream,
            // Replaced below once the peer presents its key.
            peer_key: keys.keypair.verifying_key.clone(),
            next_id: 0,
        };

        let mut challenge = vec![0u8; CHALLENGE_LEN];
        rand::thread_rng().fill_bytes(&mut challenge);

        let mut start = StartConversationRequest {
            supported_versions: SUPPORTED_VERSIONS.to_vec(),
            public_key: keys.keypair.verifying_key.to_bytes().to_vec(),
            client_challenge: challenge.clone(),
            signature: Vec::new(),
        };
        start.signature = keys
            .keypair
            .signing_key
            .sign(&start.signable_bytes())
            .to_bytes()
            .to_vec();

        let response = client
            .request(conversation_request::Kind::Start(start))
            .await?;
        if response.status != Status::Ok as i32 {
            return Err(SyncError::Rejected(response.status));
        }
        let start_response = match response.kind {
            Some(response::Kind::Conversation(conv)) => match conv.kind {
                Some(conversation_response::Kind::Start(s)) => s,
                _ => return Err(SyncError::Peer("start answered with wrong kind".into())),
            },
            _ => return Err(SyncError::Peer("start answered with wrong family".into())),
        };

        let peer_key = VerifyingKey::from_slice(&start_response.public_key)?;
        if start_response.client_challenge != challenge {
            return Err(SyncError::Peer("challenge not echoed".into()));
        }
        peer_key.verify_slice(
            &start_response.signable_bytes(),
            &start_response.signature,
        )?;
        if let Some(expected) = expected {
            if &NetworkId::from_bytes(peer_key.to_bytes()) != expected {
                return Err(SyncError::Peer(format!(
                    "peer identity mismatch: expected {expected}"
                )));
            }
        }
        client.peer_key = peer_key;
        Ok(client)
    }

    /// The peer's verified public key.
    pub fn peer_network_id(&self) -> NetworkId {
        NetworkId::from_bytes(self.peer_key.to_bytes())
    }

    /// Send one conversation request and wait for its response, bounded
    /// by [`SEND_TIMEOUT`].
    pub async fn request(&mut self, kind: conversation_request::Kind) -> Result<Response> {
        self.next_id += 1;
        let id = self.next_id;
        let envelope = Envelope::request(
            id,
            request::Kind::Conversation(ConversationRequest { kind: Some(kind) }),
        );

        tokio::time::timeout(SEND_TIMEOUT, write_frame(&mut self.stream, &envelope))
            .await
            .map_err(|_| SyncError::Timeout)??;

        loop {
            let outcome = tokio::time::timeout(SEND_TIMEOUT, read_frame(&mut self.stream))
                .await
                .map_err(|_| SyncError::Timeout)??;
            match outcome {
                FrameOutcome::Message(env) => match env.body {
                    Some(envelope::Body::Response(resp)) if env.id == id => return Ok(resp),
                    Some(envelope::Body::Response(_)) => continue,
                    Some(envelope::Body::Request(_)) => {
                        // Peers do not issue requests on a drainer
                        // conversation; skip anything unexpected.
                        continue;
                    }
                    None => return Err(SyncError::Peer("empty envelope".into())),
                },
                FrameOutcome::ProtocolViolation(reason) => {
                    return Err(SyncError::Peer(format!("protocol violation: {reason}")))
                }
                FrameOutcome::Eof => return Err(SyncError::Peer("connection closed".into())),
            }
        }
    }
}
