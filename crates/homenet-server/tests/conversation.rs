//! End-to-end conversation tests over real sockets.
//!
//! Each test spawns conversation tasks on a local listener (TLS is
//! terminated above the state machine, so plain TCP exercises the same
//! code paths) and drives them with a minimal wire client.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex, Notify};

use homenet_crypto::{identity_id, sha256, KeyPair, NodeKeys};
use homenet_images::ImageStore;
use homenet_proto::frame::{read_frame, write_frame, FrameOutcome};
use homenet_proto::messages::{
    conversation_request, conversation_response, envelope, request, response, ConversationRequest,
    Envelope, ProfileInformation, ProfileSearchRequest, Response, SemVer,
    StartConversationRequest, Status, UpdateProfileRequest, CHALLENGE_LEN,
    PROTOCOL_VIOLATION_ID, UPDATE_IMAGE, UPDATE_LOCATION, UPDATE_NAME, UPDATE_VERSION,
};
use homenet_search::ResultCache;
use homenet_server::conversation::Conversation;
use homenet_server::registry::Registry;
use homenet_server::roles::Role;
use homenet_server::{Context, RolePorts, ServerContext, ServerLimits};
use homenet_types::{GpsLocation, IdentityId, Profile, ProfileScope, ProfileVersion};

struct Harness {
    ctx: Context,
    _images_dir: tempfile::TempDir,
}

async fn harness() -> Harness {
    let images_dir = tempfile::tempdir().expect("tempdir");
    let images = ImageStore::open(images_dir.path().join("images"))
        .await
        .expect("open image store");
    let conn = homenet_db::open_memory().expect("open db");
    let (shutdown_tx, _) = broadcast::channel(1);

    let ctx = Arc::new(ServerContext {
        db: Arc::new(Mutex::new(conn)),
        images,
        keys: Arc::new(NodeKeys::new(KeyPair::generate())),
        limits: ServerLimits::default(),
        ports: RolePorts {
            primary: 1,
            client_non_tls: 2,
            client_tls: 3,
            app_service_tls: 4,
        },
        search_cache: std::sync::Mutex::new(ResultCache::new()),
        relationships: std::sync::Mutex::new(
            homenet_server::relationships::RelationshipStore::new(),
        ),
        registry: Registry::new(),
        actions_changed: Arc::new(Notify::new()),
        shutdown: shutdown_tx,
    });
    Harness {
        ctx,
        _images_dir: images_dir,
    }
}

/// Listen on an ephemeral port and run every accepted socket as a
/// conversation with the given role.
async fn spawn_role(ctx: &Context, role: Role) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let ctx = Arc::clone(ctx);
    tokio::spawn(async move {
        loop {
            let Ok((stream, peer_addr)) = listener.accept().await else {
                break;
            };
            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move {
                Conversation::new(ctx, role, Box::new(stream), peer_addr)
                    .run()
                    .await;
            });
        }
    });
    addr
}

struct TestClient {
    stream: TcpStream,
    keys: KeyPair,
    next_id: u32,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Self {
        Self {
            stream: TcpStream::connect(addr).await.expect("connect"),
            keys: KeyPair::generate(),
            next_id: 0,
        }
    }

    async fn request(&mut self, kind: conversation_request::Kind) -> Response {
        self.next_id += 1;
        let env = Envelope::request(
            self.next_id,
            request::Kind::Conversation(ConversationRequest { kind: Some(kind) }),
        );
        write_frame(&mut self.stream, &env).await.expect("write");
        self.read_response().await.expect("response expected")
    }

    async fn read_response(&mut self) -> Option<Response> {
        loop {
            match read_frame(&mut self.stream).await.expect("read") {
                FrameOutcome::Message(env) => match env.body {
                    Some(envelope::Body::Response(resp)) => return Some(resp),
                    _ => continue,
                },
                FrameOutcome::Eof => return None,
                FrameOutcome::ProtocolViolation(reason) => {
                    assert!(false, "client saw protocol violation: {reason}");
                }
            }
        }
    }

    /// StartConversation with this client's own key.
    async fn start(&mut self) -> Response {
        let mut start = StartConversationRequest {
            supported_versions: vec![SemVer {
                major: 1,
                minor: 0,
                patch: 0,
            }],
            public_key: self.keys.verifying_key.to_bytes().to_vec(),
            client_challenge: vec![7u8; CHALLENGE_LEN],
            signature: Vec::new(),
        };
        start.signature = self
            .keys
            .signing_key
            .sign(&start.signable_bytes())
            .to_bytes()
            .to_vec();
        self.request(conversation_request::Kind::Start(start)).await
    }

    fn server_challenge(response: &Response) -> Vec<u8> {
        match &response.kind {
            Some(response::Kind::Conversation(conv)) => match &conv.kind {
                Some(conversation_response::Kind::Start(s)) => s.server_challenge.clone(),
                _ => Vec::new(),
            },
            _ => Vec::new(),
        }
    }

    async fn check_in(&mut self, challenge: Vec<u8>) -> Response {
        let mut check_in = homenet_proto::messages::CheckInRequest {
            challenge,
            signature: Vec::new(),
        };
        check_in.signature = self
            .keys
            .signing_key
            .sign(&check_in.signable_bytes())
            .to_bytes()
            .to_vec();
        self.request(conversation_request::Kind::CheckIn(check_in))
            .await
    }

    fn profile_info(&self, name: &str, lat: f64, lon: f64) -> ProfileInformation {
        ProfileInformation {
            version: Some(SemVer {
                major: 1,
                minor: 0,
                patch: 0,
            }),
            public_key: self.keys.verifying_key.to_bytes().to_vec(),
            profile_type: "IoP.Person".to_string(),
            name: name.to_string(),
            latitude_e7: (lat * 1e7).round() as i32,
            longitude_e7: (lon * 1e7).round() as i32,
            extra_data: String::new(),
            profile_image_hash: Vec::new(),
            thumbnail_image_hash: Vec::new(),
        }
    }

    async fn update_profile(&mut self, info: ProfileInformation, set_fields: u32) -> Response {
        let signature = self
            .keys
            .signing_key
            .sign(&info.signable_bytes())
            .to_bytes()
            .to_vec();
        self.request(conversation_request::Kind::UpdateProfile(
            UpdateProfileRequest {
                set_fields,
                profile: Some(info),
                signature,
                profile_image: Vec::new(),
                thumbnail_image: Vec::new(),
            },
        ))
        .await
    }

    /// Full path to a checked-in, initialized profile.
    async fn host_profile(&mut self, name: &str, lat: f64, lon: f64) {
        let start = self.start().await;
        assert_eq!(start.status, Status::Ok as i32);
        let challenge = Self::server_challenge(&start);

        let register = self
            .request(conversation_request::Kind::RegisterHosting(
                homenet_proto::messages::RegisterHostingRequest {},
            ))
            .await;
        assert_eq!(register.status, Status::Ok as i32);

        let check_in = self.check_in(challenge).await;
        assert_eq!(check_in.status, Status::Ok as i32);

        let info = self.profile_info(name, lat, lon);
        let update = self
            .update_profile(info, UPDATE_VERSION | UPDATE_NAME | UPDATE_LOCATION)
            .await;
        assert_eq!(update.status, Status::Ok as i32);
    }
}

fn search_results(response: &Response) -> Vec<ProfileInformation> {
    match &response.kind {
        Some(response::Kind::Conversation(conv)) => match &conv.kind {
            Some(conversation_response::Kind::ProfileSearch(search)) => search
                .profiles
                .iter()
                .filter_map(|p| p.profile.clone())
                .collect(),
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

#[tokio::test]
async fn test_host_and_search() {
    let harness = harness().await;
    let client_tls = spawn_role(&harness.ctx, Role::ClientTls).await;
    let client_non_tls = spawn_role(&harness.ctx, Role::ClientNonTls).await;

    let mut alice = TestClient::connect(client_tls).await;
    alice.host_profile("Alice", 50.08, 14.43).await;

    let mut searcher = TestClient::connect(client_non_tls).await;
    assert_eq!(searcher.start().await.status, Status::Ok as i32);

    let response = searcher
        .request(conversation_request::Kind::ProfileSearch(
            ProfileSearchRequest {
                include_hosted_only: false,
                include_thumbnails: false,
                profile_type: "*Person".to_string(),
                name: "*".to_string(),
                latitude_e7: Some(500_000_000),
                longitude_e7: Some(145_000_000),
                radius_m: 20_000,
                max_response_record_count: 10,
                max_total_record_count: 100,
                extra_data: String::new(),
            },
        ))
        .await;
    assert_eq!(response.status, Status::Ok as i32);

    let results = search_results(&response);
    assert_eq!(results.len(), 1);
    let expected_id = identity_id(alice.keys.verifying_key.as_bytes());
    assert_eq!(identity_id(&results[0].public_key), expected_id);
    assert_eq!(results[0].name, "Alice");
}

#[tokio::test]
async fn test_antimeridian_search() {
    let harness = harness().await;
    let client_non_tls = spawn_role(&harness.ctx, Role::ClientNonTls).await;

    // Two profiles straddling the antimeridian, inserted directly.
    {
        let conn = harness.ctx.db.lock().await;
        for (byte, lon) in [(1u8, 179.9f64), (2u8, -179.9f64)] {
            let profile = Profile {
                identity_id: IdentityId::from_bytes([byte; 20]),
                public_key: vec![byte; 32],
                profile_type: "IoP.Person".to_string(),
                name: "Edge".to_string(),
                version: ProfileVersion::new(1, 0, 0),
                location: GpsLocation::new(0.0, lon).expect("valid location"),
                extra_data: String::new(),
                profile_image: None,
                thumbnail_image: None,
                expires_at: None,
                scope: ProfileScope::Hosted,
            };
            homenet_db::queries::identities::insert(&conn, &profile, 100).expect("insert");
        }
    }

    let mut searcher = TestClient::connect(client_non_tls).await;
    assert_eq!(searcher.start().await.status, Status::Ok as i32);

    let response = searcher
        .request(conversation_request::Kind::ProfileSearch(
            ProfileSearchRequest {
                include_hosted_only: false,
                include_thumbnails: false,
                profile_type: "*".to_string(),
                name: "*".to_string(),
                latitude_e7: Some(0),
                longitude_e7: Some(1_800_000_000),
                radius_m: 50_000,
                max_response_record_count: 10,
                max_total_record_count: 100,
                extra_data: String::new(),
            },
        ))
        .await;
    assert_eq!(response.status, Status::Ok as i32);
    assert_eq!(search_results(&response).len(), 2);
}

#[tokio::test]
async fn test_rectangle_false_positives_do_not_starve_results() {
    let harness = harness().await;
    let client_non_tls = spawn_role(&harness.ctx, Role::ClientNonTls).await;

    // Rows inserted first sit inside the bounding rectangle of a 30 km
    // circle around (0, 0) but outside the circle itself (~39 km); the
    // true matches come after them in storage order. A stage-1 fetch
    // capped at the requested count would pull only false positives.
    {
        let conn = harness.ctx.db.lock().await;
        for (byte, lat, lon) in [
            (1u8, 0.25, 0.25),
            (2u8, 0.25, -0.25),
            (3u8, -0.25, 0.25),
            (4u8, -0.25, -0.25),
        ] {
            let p = Profile {
                identity_id: IdentityId::from_bytes([byte; 20]),
                public_key: vec![byte; 32],
                profile_type: "IoP.Person".to_string(),
                name: "Corner".to_string(),
                version: ProfileVersion::new(1, 0, 0),
                location: GpsLocation::new(lat, lon).expect("valid location"),
                extra_data: String::new(),
                profile_image: None,
                thumbnail_image: None,
                expires_at: None,
                scope: ProfileScope::Hosted,
            };
            homenet_db::queries::identities::insert(&conn, &p, 100).expect("insert");
        }
        for byte in 10u8..13 {
            let p = Profile {
                identity_id: IdentityId::from_bytes([byte; 20]),
                public_key: vec![byte; 32],
                profile_type: "IoP.Person".to_string(),
                name: "Near".to_string(),
                version: ProfileVersion::new(1, 0, 0),
                location: GpsLocation::new(0.0, 0.05).expect("valid location"),
                extra_data: String::new(),
                profile_image: None,
                thumbnail_image: None,
                expires_at: None,
                scope: ProfileScope::Hosted,
            };
            homenet_db::queries::identities::insert(&conn, &p, 100).expect("insert");
        }
    }

    let mut searcher = TestClient::connect(client_non_tls).await;
    assert_eq!(searcher.start().await.status, Status::Ok as i32);

    let response = searcher
        .request(conversation_request::Kind::ProfileSearch(
            ProfileSearchRequest {
                include_hosted_only: false,
                include_thumbnails: false,
                profile_type: "*".to_string(),
                name: "*".to_string(),
                latitude_e7: Some(0),
                longitude_e7: Some(0),
                radius_m: 30_000,
                max_response_record_count: 3,
                max_total_record_count: 3,
                extra_data: String::new(),
            },
        ))
        .await;
    assert_eq!(response.status, Status::Ok as i32);

    let results = search_results(&response);
    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|p| p.name == "Near"));
}

#[tokio::test]
async fn test_check_in_with_wrong_key_closes() {
    let harness = harness().await;
    let client_tls = spawn_role(&harness.ctx, Role::ClientTls).await;

    // Host a profile so the identity exists.
    let mut alice = TestClient::connect(client_tls).await;
    alice.host_profile("Alice", 50.0, 14.0).await;

    // A second conversation for the same identity, but the check-in
    // signature comes from a different key.
    let mut intruder = TestClient::connect(client_tls).await;
    intruder.keys = KeyPair::from_bytes(&alice.keys.signing_key.to_bytes());
    let start = intruder.start().await;
    assert_eq!(start.status, Status::Ok as i32);
    let challenge = TestClient::server_challenge(&start);

    let mut check_in = homenet_proto::messages::CheckInRequest {
        challenge,
        signature: Vec::new(),
    };
    let wrong_keys = KeyPair::generate();
    check_in.signature = wrong_keys
        .signing_key
        .sign(&check_in.signable_bytes())
        .to_bytes()
        .to_vec();

    let response = intruder
        .request(conversation_request::Kind::CheckIn(check_in))
        .await;
    assert_eq!(response.status, Status::ErrorSignature as i32);

    // The server closes the conversation after a signature failure.
    assert!(intruder.read_response().await.is_none());
}

#[tokio::test]
async fn test_illegal_message_keeps_connection_open() {
    let harness = harness().await;
    let client_tls = spawn_role(&harness.ctx, Role::ClientTls).await;

    let mut client = TestClient::connect(client_tls).await;
    assert_eq!(client.start().await.status, Status::Ok as i32);

    // UpdateProfile is illegal before check-in.
    let info = client.profile_info("Alice", 50.0, 14.0);
    let response = client.update_profile(info, UPDATE_VERSION).await;
    assert_eq!(response.status, Status::ErrorBadConversationStatus as i32);

    // The conversation is still usable.
    let register = client
        .request(conversation_request::Kind::RegisterHosting(
            homenet_proto::messages::RegisterHostingRequest {},
        ))
        .await;
    assert_eq!(register.status, Status::Ok as i32);
}

#[tokio::test]
async fn test_protocol_violation_answers_sentinel_id_and_closes() {
    let harness = harness().await;
    let client_tls = spawn_role(&harness.ctx, Role::ClientTls).await;
    let mut stream = TcpStream::connect(client_tls).await.expect("connect");

    // A length prefix beyond the 1 MiB cap.
    let oversize = ((homenet_proto::MAX_MESSAGE_SIZE + 1) as u32).to_be_bytes();
    tokio::io::AsyncWriteExt::write_all(&mut stream, &oversize)
        .await
        .expect("write");

    match read_frame(&mut stream).await.expect("read") {
        FrameOutcome::Message(env) => {
            assert_eq!(env.id, PROTOCOL_VIOLATION_ID);
            match env.body {
                Some(envelope::Body::Response(resp)) => {
                    assert_eq!(resp.status, Status::ErrorProtocolViolation as i32);
                }
                other => assert!(other.is_none(), "expected response body"),
            }
        }
        other => assert!(false, "unexpected outcome: {other:?}"),
    }
    match read_frame(&mut stream).await.expect("read") {
        FrameOutcome::Eof => {}
        other => assert!(false, "expected close, got {other:?}"),
    }
}

#[tokio::test]
async fn test_oversized_image_rejected_and_profile_unchanged() {
    let harness = harness().await;
    let client_tls = spawn_role(&harness.ctx, Role::ClientTls).await;

    let mut alice = TestClient::connect(client_tls).await;
    alice.host_profile("Alice", 50.0, 14.0).await;

    let oversized = vec![0u8; 25 * 1024];
    let mut info = alice.profile_info("Alice", 50.0, 14.0);
    info.version = Some(SemVer {
        major: 1,
        minor: 0,
        patch: 1,
    });
    info.profile_image_hash = sha256(&oversized).to_vec();
    let signature = alice
        .keys
        .signing_key
        .sign(&info.signable_bytes())
        .to_bytes()
        .to_vec();

    let response = alice
        .request(conversation_request::Kind::UpdateProfile(
            UpdateProfileRequest {
                set_fields: UPDATE_VERSION | UPDATE_IMAGE,
                profile: Some(info),
                signature,
                profile_image: oversized,
                thumbnail_image: Vec::new(),
            },
        ))
        .await;
    assert_eq!(response.status, Status::ErrorInvalidValue as i32);

    // The stored profile keeps its previous version and no image.
    let conn = harness.ctx.db.lock().await;
    let id = identity_id(alice.keys.verifying_key.as_bytes());
    let stored = homenet_db::queries::identities::get_hosted(&conn, &id).expect("get");
    assert_eq!(stored.version, ProfileVersion::new(1, 0, 0));
    assert!(stored.profile_image.is_none());
}

#[tokio::test]
async fn test_update_replay_is_noop() {
    let harness = harness().await;
    let client_tls = spawn_role(&harness.ctx, Role::ClientTls).await;

    let mut alice = TestClient::connect(client_tls).await;
    alice.host_profile("Alice", 50.0, 14.0).await;

    // The exact same update again: same version, same contents.
    let info = alice.profile_info("Alice", 50.0, 14.0);
    let response = alice
        .update_profile(info, UPDATE_VERSION | UPDATE_NAME | UPDATE_LOCATION)
        .await;
    assert_eq!(response.status, Status::Ok as i32);
}

#[tokio::test]
async fn test_follower_registration_enqueues_snapshot() {
    let harness = harness().await;
    let primary = spawn_role(&harness.ctx, Role::Primary).await;
    let client_tls = spawn_role(&harness.ctx, Role::ClientTls).await;

    let mut alice = TestClient::connect(client_tls).await;
    alice.host_profile("Alice", 50.0, 14.0).await;

    let mut peer = TestClient::connect(primary).await;
    assert_eq!(peer.start().await.status, Status::Ok as i32);
    let response = peer
        .request(
            conversation_request::Kind::StartNeighborhoodInitialization(
                homenet_proto::messages::StartNeighborhoodInitializationRequest {
                    primary_port: 16987,
                },
            ),
        )
        .await;
    assert_eq!(response.status, Status::Ok as i32);

    // Registering twice is a duplicate.
    let again = peer
        .request(
            conversation_request::Kind::StartNeighborhoodInitialization(
                homenet_proto::messages::StartNeighborhoodInitializationRequest {
                    primary_port: 16987,
                },
            ),
        )
        .await;
    assert_eq!(again.status, Status::ErrorAlreadyExists as i32);

    let conn = harness.ctx.db.lock().await;
    let peer_id = homenet_types::NetworkId::from_bytes(peer.keys.verifying_key.to_bytes());
    let follower =
        homenet_db::queries::followers::get(&conn, &peer_id).expect("follower row");
    assert!(!follower.initialized);
    assert_eq!(
        homenet_db::queries::actions::count_for_target(&conn, &peer_id).expect("count"),
        1
    );
}

#[tokio::test]
async fn test_incoming_shared_profile_update_from_neighbor() {
    let harness = harness().await;
    let primary = spawn_role(&harness.ctx, Role::Primary).await;

    let mut peer = TestClient::connect(primary).await;
    let peer_id = homenet_types::NetworkId::from_bytes(peer.keys.verifying_key.to_bytes());
    {
        let conn = harness.ctx.db.lock().await;
        homenet_db::queries::neighbors::upsert(&conn, &peer_id, "127.0.0.1", 16987, 0, 100)
            .expect("neighbor row");
    }
    assert_eq!(peer.start().await.status, Status::Ok as i32);

    let mirrored = KeyPair::generate();
    let item = homenet_proto::messages::SharedProfileUpdateItem {
        action: Some(
            homenet_proto::messages::shared_profile_update_item::Action::Add(
                homenet_proto::messages::SharedProfileAddItem {
                    profile: Some(ProfileInformation {
                        version: Some(SemVer {
                            major: 1,
                            minor: 0,
                            patch: 0,
                        }),
                        public_key: mirrored.verifying_key.to_bytes().to_vec(),
                        profile_type: "IoP.Person".to_string(),
                        name: "Remote".to_string(),
                        latitude_e7: 100_000_000,
                        longitude_e7: 200_000_000,
                        extra_data: String::new(),
                        profile_image_hash: Vec::new(),
                        thumbnail_image_hash: Vec::new(),
                    }),
                    thumbnail: Vec::new(),
                },
            ),
        ),
    };
    let response = peer
        .request(
            conversation_request::Kind::NeighborhoodSharedProfileUpdate(
                homenet_proto::messages::NeighborhoodSharedProfileUpdateRequest {
                    items: vec![item],
                },
            ),
        )
        .await;
    assert_eq!(response.status, Status::Ok as i32);

    let conn = harness.ctx.db.lock().await;
    let id = identity_id(mirrored.verifying_key.as_bytes());
    let stored =
        homenet_db::queries::identities::get_neighbor(&conn, &id, &peer_id).expect("mirrored row");
    assert_eq!(stored.name, "Remote");
}
