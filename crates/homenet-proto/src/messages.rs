//! All protobuf message structs for the homenet wire protocol.
//!
//! The structs are written by hand with `prost` derives; tags are part of
//! the wire contract and must never be renumbered. Messages that carry an
//! Ed25519 signature sign their own encoding with the signature field
//! cleared; the `signable_bytes` helpers produce exactly those bytes.

use prost::Message as _;

/// Request id used on protocol-violation responses.
pub const PROTOCOL_VIOLATION_ID: u32 = 0x0BAD_C0DE;

/// Challenge length in bytes for conversation handshakes.
pub const CHALLENGE_LEN: usize = 32;

// ---------------------------------------------------------------------------
// UpdateProfile field bitmask
// ---------------------------------------------------------------------------

/// UpdateProfile: the version triple changes.
pub const UPDATE_VERSION: u32 = 0x01;
/// UpdateProfile: the display name changes.
pub const UPDATE_NAME: u32 = 0x02;
/// UpdateProfile: the full-size profile image changes.
pub const UPDATE_IMAGE: u32 = 0x04;
/// UpdateProfile: the thumbnail image changes.
pub const UPDATE_THUMBNAIL: u32 = 0x08;
/// UpdateProfile: the GPS location changes.
pub const UPDATE_LOCATION: u32 = 0x10;
/// UpdateProfile: the extra-data field changes.
pub const UPDATE_EXTRA_DATA: u32 = 0x20;

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Outer message envelope, one per frame.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Envelope {
    /// Caller-chosen id, unique within a conversation. Responses echo the
    /// id of the request they answer.
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(oneof = "envelope::Body", tags = "2, 3")]
    pub body: Option<envelope::Body>,
}

/// Nested types for [`Envelope`].
pub mod envelope {
    /// Request or response discriminator.
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Body {
        #[prost(message, tag = "2")]
        Request(super::Request),
        #[prost(message, tag = "3")]
        Response(super::Response),
    }
}

/// A request envelope body.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Request {
    #[prost(oneof = "request::Kind", tags = "1, 2, 3")]
    pub kind: Option<request::Kind>,
}

/// Nested types for [`Request`].
pub mod request {
    /// Request sub-family discriminator.
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Kind {
        /// One-shot request outside any conversation.
        #[prost(message, tag = "1")]
        Single(super::SingleRequest),
        /// Request within a started conversation.
        #[prost(message, tag = "2")]
        Conversation(super::ConversationRequest),
        /// Location-service (LOC) request.
        #[prost(message, tag = "3")]
        LocalService(super::LocalServiceRequest),
    }
}

/// A response envelope body.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Response {
    /// Outcome of the request.
    #[prost(enumeration = "Status", tag = "1")]
    pub status: i32,
    /// Seconds the caller should wait before retrying; only set with
    /// [`Status::ErrorBusy`].
    #[prost(uint32, tag = "2")]
    pub retry_after_seconds: u32,
    /// Name of the offending field for [`Status::ErrorInvalidValue`].
    #[prost(string, tag = "3")]
    pub details: String,
    #[prost(oneof = "response::Kind", tags = "4, 5, 6")]
    pub kind: Option<response::Kind>,
}

/// Nested types for [`Response`].
pub mod response {
    /// Response sub-family discriminator.
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Kind {
        #[prost(message, tag = "4")]
        Single(super::SingleResponse),
        #[prost(message, tag = "5")]
        Conversation(super::ConversationResponse),
        #[prost(message, tag = "6")]
        LocalService(super::LocalServiceResponse),
    }
}

/// Response status codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, prost::Enumeration)]
#[repr(i32)]
pub enum Status {
    Unknown = 0,
    Ok = 1,
    /// Malformed framing, unknown discriminator, oversize, wrong version.
    ErrorProtocolViolation = 2,
    /// Message is legal on the wire but not in the current state.
    ErrorBadConversationStatus = 3,
    /// Signature verification failed.
    ErrorSignature = 4,
    /// Identity or relationship not found.
    ErrorNotFound = 5,
    /// Duplicate registration.
    ErrorAlreadyExists = 6,
    /// Hosting or follower capacity reached.
    ErrorQuotaExceeded = 7,
    /// Field out of bounds (size, GPS range, version).
    ErrorInvalidValue = 8,
    /// Transient overload; retry after `retry_after_seconds`.
    ErrorBusy = 9,
    /// Hosting agreement or challenge expired.
    ErrorExpired = 10,
    /// Storage or crypto engine failure.
    ErrorInternal = 11,
}

// ---------------------------------------------------------------------------
// Single requests: primary and non-TLS client roles
// ---------------------------------------------------------------------------

/// One-shot request; the connection closes after the response.
#[derive(Clone, PartialEq, prost::Message)]
pub struct SingleRequest {
    #[prost(oneof = "single_request::Kind", tags = "1, 2, 3")]
    pub kind: Option<single_request::Kind>,
}

/// Nested types for [`SingleRequest`].
pub mod single_request {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Kind {
        #[prost(message, tag = "1")]
        Ping(super::PingRequest),
        #[prost(message, tag = "2")]
        ListRoles(super::ListRolesRequest),
        #[prost(message, tag = "3")]
        GetIdentityInformation(super::GetIdentityInformationRequest),
    }
}

/// One-shot response.
#[derive(Clone, PartialEq, prost::Message)]
pub struct SingleResponse {
    #[prost(oneof = "single_response::Kind", tags = "1, 2, 3")]
    pub kind: Option<single_response::Kind>,
}

/// Nested types for [`SingleResponse`].
pub mod single_response {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Kind {
        #[prost(message, tag = "1")]
        Ping(super::PingResponse),
        #[prost(message, tag = "2")]
        ListRoles(super::ListRolesResponse),
        #[prost(message, tag = "3")]
        GetIdentityInformation(super::GetIdentityInformationResponse),
    }
}

/// Liveness probe.
#[derive(Clone, PartialEq, prost::Message)]
pub struct PingRequest {
    /// Opaque payload echoed back unchanged.
    #[prost(bytes, tag = "1")]
    pub payload: Vec<u8>,
}

/// Liveness probe answer.
#[derive(Clone, PartialEq, prost::Message)]
pub struct PingResponse {
    /// The request payload, echoed.
    #[prost(bytes, tag = "1")]
    pub payload: Vec<u8>,
    /// Server Unix time in seconds.
    #[prost(uint64, tag = "2")]
    pub clock: u64,
}

/// Ask the server which roles it exposes on which ports.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ListRolesRequest {}

/// Role advertisement.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ListRolesResponse {
    #[prost(message, repeated, tag = "1")]
    pub roles: Vec<RoleInfo>,
}

/// One advertised role endpoint.
#[derive(Clone, PartialEq, prost::Message)]
pub struct RoleInfo {
    #[prost(enumeration = "ServerRole", tag = "1")]
    pub role: i32,
    #[prost(uint32, tag = "2")]
    pub port: u32,
    #[prost(bool, tag = "3")]
    pub is_tls: bool,
}

/// The four TCP roles a profile server exposes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, prost::Enumeration)]
#[repr(i32)]
pub enum ServerRole {
    Unknown = 0,
    /// Advertises the server, returns role ports, accepts neighbor traffic.
    Primary = 1,
    /// ListRoles and lightweight lookups only.
    ClientNonTls = 2,
    /// Full client conversations.
    ClientTls = 3,
    /// Application-service relay between checked-in clients.
    AppServiceTls = 4,
}

/// Lightweight profile lookup by identity id.
#[derive(Clone, PartialEq, prost::Message)]
pub struct GetIdentityInformationRequest {
    /// 20-byte identity id.
    #[prost(bytes, tag = "1")]
    pub identity_id: Vec<u8>,
    /// Include the thumbnail image bytes in the response.
    #[prost(bool, tag = "2")]
    pub include_thumbnail: bool,
}

/// Profile lookup answer.
#[derive(Clone, PartialEq, prost::Message)]
pub struct GetIdentityInformationResponse {
    /// Whether this server hosts the profile (vs. mirrors it).
    #[prost(bool, tag = "1")]
    pub is_hosted: bool,
    /// Source neighbor network id for mirrored profiles; empty if hosted.
    #[prost(bytes, tag = "2")]
    pub host_node_id: Vec<u8>,
    #[prost(message, optional, tag = "3")]
    pub profile: Option<ProfileInformation>,
    /// Thumbnail bytes if requested and present.
    #[prost(bytes, tag = "4")]
    pub thumbnail: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Conversation requests
// ---------------------------------------------------------------------------

/// Request within a started conversation.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ConversationRequest {
    #[prost(
        oneof = "conversation_request::Kind",
        tags = "1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18"
    )]
    pub kind: Option<conversation_request::Kind>,
}

/// Nested types for [`ConversationRequest`].
pub mod conversation_request {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Kind {
        #[prost(message, tag = "1")]
        Start(super::StartConversationRequest),
        #[prost(message, tag = "2")]
        RegisterHosting(super::RegisterHostingRequest),
        #[prost(message, tag = "3")]
        CheckIn(super::CheckInRequest),
        #[prost(message, tag = "4")]
        UpdateProfile(super::UpdateProfileRequest),
        #[prost(message, tag = "5")]
        CancelHostingAgreement(super::CancelHostingAgreementRequest),
        #[prost(message, tag = "6")]
        ProfileSearch(super::ProfileSearchRequest),
        #[prost(message, tag = "7")]
        ProfileSearchPart(super::ProfileSearchPartRequest),
        #[prost(message, tag = "8")]
        AddRelatedIdentity(super::AddRelatedIdentityRequest),
        #[prost(message, tag = "9")]
        RemoveRelatedIdentity(super::RemoveRelatedIdentityRequest),
        #[prost(message, tag = "10")]
        GetIdentityRelationships(super::GetIdentityRelationshipsRequest),
        #[prost(message, tag = "11")]
        AppServiceAdd(super::ApplicationServiceAddRequest),
        #[prost(message, tag = "12")]
        AppServiceCall(super::ApplicationServiceCallRequest),
        #[prost(message, tag = "13")]
        AppServiceSendMessage(super::ApplicationServiceSendMessageRequest),
        #[prost(message, tag = "14")]
        AppServiceReceiveMessage(super::ApplicationServiceReceiveMessageNotificationRequest),
        #[prost(message, tag = "15")]
        StartNeighborhoodInitialization(super::StartNeighborhoodInitializationRequest),
        #[prost(message, tag = "16")]
        FinishNeighborhoodInitialization(super::FinishNeighborhoodInitializationRequest),
        #[prost(message, tag = "17")]
        NeighborhoodSharedProfileUpdate(super::NeighborhoodSharedProfileUpdateRequest),
        #[prost(message, tag = "18")]
        StopNeighborhoodUpdates(super::StopNeighborhoodUpdatesRequest),
    }
}

/// Response within a conversation.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ConversationResponse {
    #[prost(
        oneof = "conversation_response::Kind",
        tags = "1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18"
    )]
    pub kind: Option<conversation_response::Kind>,
}

/// Nested types for [`ConversationResponse`].
pub mod conversation_response {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Kind {
        #[prost(message, tag = "1")]
        Start(super::StartConversationResponse),
        #[prost(message, tag = "2")]
        RegisterHosting(super::RegisterHostingResponse),
        #[prost(message, tag = "3")]
        CheckIn(super::CheckInResponse),
        #[prost(message, tag = "4")]
        UpdateProfile(super::UpdateProfileResponse),
        #[prost(message, tag = "5")]
        CancelHostingAgreement(super::CancelHostingAgreementResponse),
        #[prost(message, tag = "6")]
        ProfileSearch(super::ProfileSearchResponse),
        #[prost(message, tag = "7")]
        ProfileSearchPart(super::ProfileSearchPartResponse),
        #[prost(message, tag = "8")]
        AddRelatedIdentity(super::AddRelatedIdentityResponse),
        #[prost(message, tag = "9")]
        RemoveRelatedIdentity(super::RemoveRelatedIdentityResponse),
        #[prost(message, tag = "10")]
        GetIdentityRelationships(super::GetIdentityRelationshipsResponse),
        #[prost(message, tag = "11")]
        AppServiceAdd(super::ApplicationServiceAddResponse),
        #[prost(message, tag = "12")]
        AppServiceCall(super::ApplicationServiceCallResponse),
        #[prost(message, tag = "13")]
        AppServiceSendMessage(super::ApplicationServiceSendMessageResponse),
        #[prost(message, tag = "14")]
        AppServiceReceiveMessage(super::ApplicationServiceReceiveMessageNotificationResponse),
        #[prost(message, tag = "15")]
        StartNeighborhoodInitialization(super::StartNeighborhoodInitializationResponse),
        #[prost(message, tag = "16")]
        FinishNeighborhoodInitialization(super::FinishNeighborhoodInitializationResponse),
        #[prost(message, tag = "17")]
        NeighborhoodSharedProfileUpdate(super::NeighborhoodSharedProfileUpdateResponse),
        #[prost(message, tag = "18")]
        StopNeighborhoodUpdates(super::StopNeighborhoodUpdatesResponse),
    }
}

/// A protocol version triple.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Message)]
pub struct SemVer {
    #[prost(uint32, tag = "1")]
    pub major: u32,
    #[prost(uint32, tag = "2")]
    pub minor: u32,
    #[prost(uint32, tag = "3")]
    pub patch: u32,
}

/// Opens a conversation. Always the first conversation message.
///
/// The client proves possession of its key by signing this request with the
/// signature field cleared.
#[derive(Clone, PartialEq, prost::Message)]
pub struct StartConversationRequest {
    /// Protocol versions the client speaks, best first.
    #[prost(message, repeated, tag = "1")]
    pub supported_versions: Vec<SemVer>,
    /// Client's Ed25519 public key.
    #[prost(bytes, tag = "2")]
    pub public_key: Vec<u8>,
    /// 32-byte client challenge the server must echo signed.
    #[prost(bytes, tag = "3")]
    pub client_challenge: Vec<u8>,
    /// Ed25519 over this request with the signature field cleared.
    #[prost(bytes, tag = "4")]
    pub signature: Vec<u8>,
}

/// Answer to [`StartConversationRequest`]; pins the conversation version and
/// carries the server's own signed challenge.
#[derive(Clone, PartialEq, prost::Message)]
pub struct StartConversationResponse {
    /// The version the server picked from the client's list.
    #[prost(message, optional, tag = "1")]
    pub version: Option<SemVer>,
    /// Server's Ed25519 network public key.
    #[prost(bytes, tag = "2")]
    pub public_key: Vec<u8>,
    /// 32-byte server challenge the client must echo in CheckIn.
    #[prost(bytes, tag = "3")]
    pub server_challenge: Vec<u8>,
    /// The client's challenge, echoed so the signature covers it.
    #[prost(bytes, tag = "4")]
    pub client_challenge: Vec<u8>,
    /// Ed25519 over this response with the signature field cleared.
    #[prost(bytes, tag = "5")]
    pub signature: Vec<u8>,
}

/// Ask the server to host the conversation identity's profile.
#[derive(Clone, PartialEq, prost::Message)]
pub struct RegisterHostingRequest {}

/// Hosting agreement established (or already in place).
#[derive(Clone, PartialEq, prost::Message)]
pub struct RegisterHostingResponse {}

/// Authenticate as a hosted identity by echoing the server challenge.
#[derive(Clone, PartialEq, prost::Message)]
pub struct CheckInRequest {
    /// The server challenge from StartConversation.
    #[prost(bytes, tag = "1")]
    pub challenge: Vec<u8>,
    /// Ed25519 over this request with the signature field cleared, made
    /// with the hosted identity's key.
    #[prost(bytes, tag = "2")]
    pub signature: Vec<u8>,
}

/// Check-in accepted.
#[derive(Clone, PartialEq, prost::Message)]
pub struct CheckInResponse {}

/// The full profile as published by its owner. Signed as a unit.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ProfileInformation {
    #[prost(message, optional, tag = "1")]
    pub version: Option<SemVer>,
    #[prost(bytes, tag = "2")]
    pub public_key: Vec<u8>,
    #[prost(string, tag = "3")]
    pub profile_type: String,
    #[prost(string, tag = "4")]
    pub name: String,
    /// Latitude in 1e-7 degrees.
    #[prost(sint32, tag = "5")]
    pub latitude_e7: i32,
    /// Longitude in 1e-7 degrees.
    #[prost(sint32, tag = "6")]
    pub longitude_e7: i32,
    #[prost(string, tag = "7")]
    pub extra_data: String,
    /// SHA-256 of the full-size profile image; empty if none.
    #[prost(bytes, tag = "8")]
    pub profile_image_hash: Vec<u8>,
    /// SHA-256 of the thumbnail image; empty if none.
    #[prost(bytes, tag = "9")]
    pub thumbnail_image_hash: Vec<u8>,
}

/// Change selected fields of the hosted profile.
#[derive(Clone, PartialEq, prost::Message)]
pub struct UpdateProfileRequest {
    /// Bitmask of `UPDATE_*` flags naming the fields that change.
    #[prost(uint32, tag = "1")]
    pub set_fields: u32,
    /// The complete profile after the change.
    #[prost(message, optional, tag = "2")]
    pub profile: Option<ProfileInformation>,
    /// Ed25519 over the encoded `profile` with the identity's key.
    #[prost(bytes, tag = "3")]
    pub signature: Vec<u8>,
    /// New full-size image bytes when `UPDATE_IMAGE` is set.
    #[prost(bytes, tag = "4")]
    pub profile_image: Vec<u8>,
    /// New thumbnail bytes when `UPDATE_THUMBNAIL` is set.
    #[prost(bytes, tag = "5")]
    pub thumbnail_image: Vec<u8>,
}

/// Profile updated.
#[derive(Clone, PartialEq, prost::Message)]
pub struct UpdateProfileResponse {}

/// End the hosting agreement for the checked-in identity.
#[derive(Clone, PartialEq, prost::Message)]
pub struct CancelHostingAgreementRequest {}

/// Hosting agreement ended.
#[derive(Clone, PartialEq, prost::Message)]
pub struct CancelHostingAgreementResponse {}

/// Search profiles by type, name, location and extra data.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ProfileSearchRequest {
    /// Only consider profiles hosted by this server.
    #[prost(bool, tag = "1")]
    pub include_hosted_only: bool,
    /// Include thumbnail bytes in the results.
    #[prost(bool, tag = "2")]
    pub include_thumbnails: bool,
    /// Type wildcard (`abc`, `*abc`, `abc*`, `*abc*`, `*`).
    #[prost(string, tag = "3")]
    pub profile_type: String,
    /// Name wildcard, same forms as `profile_type`.
    #[prost(string, tag = "4")]
    pub name: String,
    /// Search center latitude in 1e-7 degrees; unset means no geo filter.
    #[prost(sint32, optional, tag = "5")]
    pub latitude_e7: Option<i32>,
    /// Search center longitude in 1e-7 degrees.
    #[prost(sint32, optional, tag = "6")]
    pub longitude_e7: Option<i32>,
    /// Search radius in metres around the center.
    #[prost(uint32, tag = "7")]
    pub radius_m: u32,
    /// Maximum records in this response; the rest is paginated.
    #[prost(uint32, tag = "8")]
    pub max_response_record_count: u32,
    /// Maximum total records the server should collect.
    #[prost(uint32, tag = "9")]
    pub max_total_record_count: u32,
    /// Substring filter on extra data; empty means no filter.
    #[prost(string, tag = "10")]
    pub extra_data: String,
}

/// First window of search results.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ProfileSearchResponse {
    /// Total matching records held for paging.
    #[prost(uint32, tag = "1")]
    pub total_record_count: u32,
    /// Cap that was applied to this response.
    #[prost(uint32, tag = "2")]
    pub max_response_record_count: u32,
    #[prost(message, repeated, tag = "3")]
    pub profiles: Vec<ProfileQueryInformation>,
}

/// One search result record.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ProfileQueryInformation {
    #[prost(bool, tag = "1")]
    pub is_hosted: bool,
    /// Source neighbor network id for mirrored profiles; empty if hosted.
    #[prost(bytes, tag = "2")]
    pub host_node_id: Vec<u8>,
    #[prost(message, optional, tag = "3")]
    pub profile: Option<ProfileInformation>,
    /// Thumbnail bytes if requested and present.
    #[prost(bytes, tag = "4")]
    pub thumbnail: Vec<u8>,
}

/// Page through results cached by a preceding search.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ProfileSearchPartRequest {
    /// Zero-based index of the first record wanted.
    #[prost(uint32, tag = "1")]
    pub record_index: u32,
    /// Number of records wanted.
    #[prost(uint32, tag = "2")]
    pub record_count: u32,
}

/// One page of cached search results.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ProfileSearchPartResponse {
    #[prost(uint32, tag = "1")]
    pub record_index: u32,
    #[prost(message, repeated, tag = "2")]
    pub profiles: Vec<ProfileQueryInformation>,
}

/// A signed statement relating two identities.
#[derive(Clone, PartialEq, prost::Message)]
pub struct RelationshipCard {
    /// Issuer-chosen card id, unique per recipient.
    #[prost(bytes, tag = "1")]
    pub card_id: Vec<u8>,
    #[prost(bytes, tag = "2")]
    pub issuer_public_key: Vec<u8>,
    #[prost(bytes, tag = "3")]
    pub recipient_public_key: Vec<u8>,
    /// Application-defined relationship type.
    #[prost(string, tag = "4")]
    pub card_type: String,
    /// Unix seconds from which the card is valid.
    #[prost(uint64, tag = "5")]
    pub valid_from: u64,
    /// Unix seconds until which the card is valid; 0 means no expiry.
    #[prost(uint64, tag = "6")]
    pub valid_to: u64,
    /// Application payload, at most 200 bytes.
    #[prost(bytes, tag = "7")]
    pub payload: Vec<u8>,
    /// Issuer's Ed25519 over this card with the signature field cleared.
    #[prost(bytes, tag = "8")]
    pub issuer_signature: Vec<u8>,
}

/// Attach a relationship card to the checked-in identity.
#[derive(Clone, PartialEq, prost::Message)]
pub struct AddRelatedIdentityRequest {
    #[prost(message, optional, tag = "1")]
    pub card: Option<RelationshipCard>,
}

/// Card attached.
#[derive(Clone, PartialEq, prost::Message)]
pub struct AddRelatedIdentityResponse {}

/// Detach a relationship card by id.
#[derive(Clone, PartialEq, prost::Message)]
pub struct RemoveRelatedIdentityRequest {
    #[prost(bytes, tag = "1")]
    pub card_id: Vec<u8>,
}

/// Card detached.
#[derive(Clone, PartialEq, prost::Message)]
pub struct RemoveRelatedIdentityResponse {}

/// List relationship cards attached to an identity.
#[derive(Clone, PartialEq, prost::Message)]
pub struct GetIdentityRelationshipsRequest {
    /// 20-byte identity id whose cards are wanted.
    #[prost(bytes, tag = "1")]
    pub identity_id: Vec<u8>,
    /// Card type wildcard; `*` matches all.
    #[prost(string, tag = "2")]
    pub card_type: String,
    /// Restrict to cards issued by this key; empty means any issuer.
    #[prost(bytes, tag = "3")]
    pub issuer_public_key: Vec<u8>,
}

/// Relationship card listing.
#[derive(Clone, PartialEq, prost::Message)]
pub struct GetIdentityRelationshipsResponse {
    #[prost(message, repeated, tag = "1")]
    pub cards: Vec<RelationshipCard>,
}

/// Register named application-service channels on this conversation.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ApplicationServiceAddRequest {
    #[prost(string, repeated, tag = "1")]
    pub service_names: Vec<String>,
}

/// Channels registered.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ApplicationServiceAddResponse {}

/// Pair this conversation with a checked-in callee over a named channel.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ApplicationServiceCallRequest {
    /// 20-byte identity id of the callee.
    #[prost(bytes, tag = "1")]
    pub identity_id: Vec<u8>,
    /// Channel name the callee registered.
    #[prost(string, tag = "2")]
    pub service_name: String,
}

/// Call established; both peers are now relaying.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ApplicationServiceCallResponse {}

/// Send opaque bytes to the paired peer.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ApplicationServiceSendMessageRequest {
    #[prost(bytes, tag = "1")]
    pub message: Vec<u8>,
}

/// Bytes accepted for relay.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ApplicationServiceSendMessageResponse {}

/// Server-initiated delivery of relayed bytes from the paired peer.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ApplicationServiceReceiveMessageNotificationRequest {
    #[prost(bytes, tag = "1")]
    pub message: Vec<u8>,
}

/// Client acknowledgement of a relayed delivery.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ApplicationServiceReceiveMessageNotificationResponse {}

// ---------------------------------------------------------------------------
// Neighborhood replication (primary role)
// ---------------------------------------------------------------------------

/// Ask the receiving server to accept the caller as a follower: the
/// receiver will push a snapshot of its hosted profiles and then
/// incremental changes to the caller's primary port.
#[derive(Clone, PartialEq, prost::Message)]
pub struct StartNeighborhoodInitializationRequest {
    /// Primary-role port the caller listens on for replication traffic.
    #[prost(uint32, tag = "1")]
    pub primary_port: u32,
}

/// Follower accepted; the snapshot will follow over the action queue.
#[derive(Clone, PartialEq, prost::Message)]
pub struct StartNeighborhoodInitializationResponse {}

/// Marks the end of the initial snapshot push.
#[derive(Clone, PartialEq, prost::Message)]
pub struct FinishNeighborhoodInitializationRequest {}

/// Snapshot completion acknowledged.
#[derive(Clone, PartialEq, prost::Message)]
pub struct FinishNeighborhoodInitializationResponse {}

/// A batch of profile changes pushed to a follower, at most 1000 items.
#[derive(Clone, PartialEq, prost::Message)]
pub struct NeighborhoodSharedProfileUpdateRequest {
    #[prost(message, repeated, tag = "1")]
    pub items: Vec<SharedProfileUpdateItem>,
}

/// Batch applied.
#[derive(Clone, PartialEq, prost::Message)]
pub struct NeighborhoodSharedProfileUpdateResponse {}

/// One replicated profile change.
#[derive(Clone, PartialEq, prost::Message)]
pub struct SharedProfileUpdateItem {
    #[prost(oneof = "shared_profile_update_item::Action", tags = "1, 2, 3, 4")]
    pub action: Option<shared_profile_update_item::Action>,
}

/// Nested types for [`SharedProfileUpdateItem`].
pub mod shared_profile_update_item {
    /// Replication action discriminator.
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Action {
        #[prost(message, tag = "1")]
        Add(super::SharedProfileAddItem),
        #[prost(message, tag = "2")]
        Change(super::SharedProfileChangeItem),
        #[prost(message, tag = "3")]
        Remove(super::SharedProfileRemoveItem),
        #[prost(message, tag = "4")]
        Refresh(super::SharedProfileRefreshItem),
    }
}

/// A profile newly hosted by the sender.
#[derive(Clone, PartialEq, prost::Message)]
pub struct SharedProfileAddItem {
    #[prost(message, optional, tag = "1")]
    pub profile: Option<ProfileInformation>,
    /// Thumbnail bytes; the follower stores thumbnails only.
    #[prost(bytes, tag = "2")]
    pub thumbnail: Vec<u8>,
}

/// A changed profile hosted by the sender.
#[derive(Clone, PartialEq, prost::Message)]
pub struct SharedProfileChangeItem {
    #[prost(message, optional, tag = "1")]
    pub profile: Option<ProfileInformation>,
    #[prost(bytes, tag = "2")]
    pub thumbnail: Vec<u8>,
}

/// A profile the sender no longer hosts.
#[derive(Clone, PartialEq, prost::Message)]
pub struct SharedProfileRemoveItem {
    #[prost(bytes, tag = "1")]
    pub identity_id: Vec<u8>,
}

/// Keep-alive refresh for a mirrored profile.
#[derive(Clone, PartialEq, prost::Message)]
pub struct SharedProfileRefreshItem {
    #[prost(bytes, tag = "1")]
    pub identity_id: Vec<u8>,
}

/// The sender stops mirroring the receiver's profiles (or vice versa);
/// the receiver must drop the relationship and all mirrored rows.
#[derive(Clone, PartialEq, prost::Message)]
pub struct StopNeighborhoodUpdatesRequest {}

/// Relationship dropped.
#[derive(Clone, PartialEq, prost::Message)]
pub struct StopNeighborhoodUpdatesResponse {}

// ---------------------------------------------------------------------------
// Location service (LOC) messages
// ---------------------------------------------------------------------------

/// Request to the local location service.
#[derive(Clone, PartialEq, prost::Message)]
pub struct LocalServiceRequest {
    #[prost(oneof = "local_service_request::Kind", tags = "1, 2, 3, 4")]
    pub kind: Option<local_service_request::Kind>,
}

/// Nested types for [`LocalServiceRequest`].
pub mod local_service_request {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Kind {
        #[prost(message, tag = "1")]
        RegisterService(super::RegisterServiceRequest),
        #[prost(message, tag = "2")]
        DeregisterService(super::DeregisterServiceRequest),
        #[prost(message, tag = "3")]
        GetNeighbourNodes(super::GetNeighbourNodesRequest),
        /// LOC-initiated streaming change notification.
        #[prost(message, tag = "4")]
        NeighbourhoodChanged(super::NeighbourhoodChangedNotificationRequest),
    }
}

/// Response from the local location service.
#[derive(Clone, PartialEq, prost::Message)]
pub struct LocalServiceResponse {
    #[prost(oneof = "local_service_response::Kind", tags = "1, 2, 3, 4")]
    pub kind: Option<local_service_response::Kind>,
}

/// Nested types for [`LocalServiceResponse`].
pub mod local_service_response {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Kind {
        #[prost(message, tag = "1")]
        RegisterService(super::RegisterServiceResponse),
        #[prost(message, tag = "2")]
        DeregisterService(super::DeregisterServiceResponse),
        #[prost(message, tag = "3")]
        GetNeighbourNodes(super::GetNeighbourNodesResponse),
        #[prost(message, tag = "4")]
        NeighbourhoodChanged(super::NeighbourhoodChangedNotificationResponse),
    }
}

/// Service types a node can register with the location service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, prost::Enumeration)]
#[repr(i32)]
pub enum ServiceType {
    Unknown = 0,
    Profile = 1,
}

/// Register this node's service with the location service.
#[derive(Clone, PartialEq, prost::Message)]
pub struct RegisterServiceRequest {
    #[prost(enumeration = "ServiceType", tag = "1")]
    pub service_type: i32,
    /// Port of the service's primary role.
    #[prost(uint32, tag = "2")]
    pub port: u32,
    /// Service tag: SHA-256 of the node's network public key.
    #[prost(bytes, tag = "3")]
    pub service_data: Vec<u8>,
}

/// Service registered.
#[derive(Clone, PartialEq, prost::Message)]
pub struct RegisterServiceResponse {}

/// Deregister this node's service on clean shutdown.
#[derive(Clone, PartialEq, prost::Message)]
pub struct DeregisterServiceRequest {
    #[prost(enumeration = "ServiceType", tag = "1")]
    pub service_type: i32,
}

/// Service deregistered.
#[derive(Clone, PartialEq, prost::Message)]
pub struct DeregisterServiceResponse {}

/// Ask for the current neighborhood, ordered by distance.
#[derive(Clone, PartialEq, prost::Message)]
pub struct GetNeighbourNodesRequest {
    /// Keep the connection open and stream change notifications.
    #[prost(bool, tag = "1")]
    pub keep_alive_and_send_updates: bool,
}

/// The current neighborhood.
#[derive(Clone, PartialEq, prost::Message)]
pub struct GetNeighbourNodesResponse {
    #[prost(message, repeated, tag = "1")]
    pub nodes: Vec<NodeContact>,
}

/// Contact information for one neighbor profile server.
#[derive(Clone, PartialEq, prost::Message)]
pub struct NodeContact {
    /// 32-byte network id (Ed25519 public key) of the neighbor.
    #[prost(bytes, tag = "1")]
    pub network_id: Vec<u8>,
    /// IPv4 (4 bytes) or IPv6 (16 bytes) address.
    #[prost(bytes, tag = "2")]
    pub ip_address: Vec<u8>,
    /// Primary-role port of the neighbor.
    #[prost(uint32, tag = "3")]
    pub primary_port: u32,
    /// Geographic distance bucket assigned by the location service.
    #[prost(uint32, tag = "4")]
    pub distance_bucket: u32,
}

/// Streamed neighborhood change notification from the location service.
#[derive(Clone, PartialEq, prost::Message)]
pub struct NeighbourhoodChangedNotificationRequest {
    #[prost(message, repeated, tag = "1")]
    pub changes: Vec<NeighbourhoodChange>,
}

/// Notification acknowledged.
#[derive(Clone, PartialEq, prost::Message)]
pub struct NeighbourhoodChangedNotificationResponse {}

/// One neighborhood change.
#[derive(Clone, PartialEq, prost::Message)]
pub struct NeighbourhoodChange {
    #[prost(oneof = "neighbourhood_change::Change", tags = "1, 2")]
    pub change: Option<neighbourhood_change::Change>,
}

/// Nested types for [`NeighbourhoodChange`].
pub mod neighbourhood_change {
    /// Change discriminator.
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Change {
        /// A node entered the neighborhood.
        #[prost(message, tag = "1")]
        Added(super::NodeContact),
        /// Network id of a node that left the neighborhood.
        #[prost(bytes, tag = "2")]
        Removed(Vec<u8>),
    }
}

// ---------------------------------------------------------------------------
// Construction and signing helpers
// ---------------------------------------------------------------------------

impl Envelope {
    /// Build a request envelope.
    pub fn request(id: u32, kind: request::Kind) -> Self {
        Self {
            id,
            body: Some(envelope::Body::Request(Request { kind: Some(kind) })),
        }
    }

    /// Build a response envelope.
    pub fn response(id: u32, response: Response) -> Self {
        Self {
            id,
            body: Some(envelope::Body::Response(response)),
        }
    }

    /// The response sent for a protocol violation, just before close.
    pub fn protocol_violation() -> Self {
        Self::response(
            PROTOCOL_VIOLATION_ID,
            Response::error(Status::ErrorProtocolViolation),
        )
    }
}

impl Response {
    /// A successful response with a payload.
    pub fn ok(kind: response::Kind) -> Self {
        Self {
            status: Status::Ok as i32,
            retry_after_seconds: 0,
            details: String::new(),
            kind: Some(kind),
        }
    }

    /// An error response with no payload.
    pub fn error(status: Status) -> Self {
        Self {
            status: status as i32,
            retry_after_seconds: 0,
            details: String::new(),
            kind: None,
        }
    }

    /// An `ErrorInvalidValue` response naming the offending field.
    pub fn invalid_value(field: impl Into<String>) -> Self {
        Self {
            status: Status::ErrorInvalidValue as i32,
            retry_after_seconds: 0,
            details: field.into(),
            kind: None,
        }
    }

    /// An `ErrorBusy` response with a retry hint.
    pub fn busy(retry_after_seconds: u32) -> Self {
        Self {
            status: Status::ErrorBusy as i32,
            retry_after_seconds,
            details: String::new(),
            kind: None,
        }
    }
}

impl StartConversationRequest {
    /// Bytes covered by the request signature: the encoded request with
    /// the signature field cleared.
    pub fn signable_bytes(&self) -> Vec<u8> {
        let mut unsigned = self.clone();
        unsigned.signature.clear();
        unsigned.encode_to_vec()
    }
}

impl StartConversationResponse {
    /// Bytes covered by the response signature.
    pub fn signable_bytes(&self) -> Vec<u8> {
        let mut unsigned = self.clone();
        unsigned.signature.clear();
        unsigned.encode_to_vec()
    }
}

impl CheckInRequest {
    /// Bytes covered by the check-in signature.
    pub fn signable_bytes(&self) -> Vec<u8> {
        let mut unsigned = self.clone();
        unsigned.signature.clear();
        unsigned.encode_to_vec()
    }
}

impl ProfileInformation {
    /// Bytes covered by the profile signature: the whole encoded profile.
    pub fn signable_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }
}

impl RelationshipCard {
    /// Bytes covered by the issuer signature.
    pub fn signable_bytes(&self) -> Vec<u8> {
        let mut unsigned = self.clone();
        unsigned.issuer_signature.clear();
        unsigned.encode_to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message as _;

    #[test]
    fn test_envelope_roundtrip() {
        let env = Envelope::request(
            7,
            request::Kind::Single(SingleRequest {
                kind: Some(single_request::Kind::Ping(PingRequest {
                    payload: vec![1, 2, 3],
                })),
            }),
        );
        let bytes = env.encode_to_vec();
        let restored = Envelope::decode(bytes.as_slice()).expect("decode");
        assert_eq!(env, restored);
    }

    #[test]
    fn test_response_roundtrip() {
        let env = Envelope::response(
            9,
            Response::ok(response::Kind::Conversation(ConversationResponse {
                kind: Some(conversation_response::Kind::CheckIn(CheckInResponse {})),
            })),
        );
        let bytes = env.encode_to_vec();
        let restored = Envelope::decode(bytes.as_slice()).expect("decode");
        assert_eq!(env, restored);
        match restored.body {
            Some(envelope::Body::Response(r)) => assert_eq!(r.status, Status::Ok as i32),
            other => assert!(other.is_none(), "unexpected body"),
        }
    }

    #[test]
    fn test_protocol_violation_envelope() {
        let env = Envelope::protocol_violation();
        assert_eq!(env.id, PROTOCOL_VIOLATION_ID);
        match env.body {
            Some(envelope::Body::Response(r)) => {
                assert_eq!(r.status, Status::ErrorProtocolViolation as i32);
            }
            _ => assert!(false, "expected response body"),
        }
    }

    #[test]
    fn test_signable_bytes_excludes_signature() {
        let mut req = StartConversationRequest {
            supported_versions: vec![SemVer {
                major: 1,
                minor: 0,
                patch: 0,
            }],
            public_key: vec![5u8; 32],
            client_challenge: vec![6u8; CHALLENGE_LEN],
            signature: Vec::new(),
        };
        let unsigned = req.signable_bytes();
        req.signature = vec![0xFF; 64];
        assert_eq!(req.signable_bytes(), unsigned);
    }

    #[test]
    fn test_profile_signable_covers_all_fields() {
        let mut profile = ProfileInformation {
            version: Some(SemVer {
                major: 1,
                minor: 0,
                patch: 0,
            }),
            public_key: vec![1u8; 32],
            profile_type: "IoP.Person".to_string(),
            name: "Alice".to_string(),
            latitude_e7: 500_800_000,
            longitude_e7: 144_300_000,
            extra_data: String::new(),
            profile_image_hash: Vec::new(),
            thumbnail_image_hash: Vec::new(),
        };
        let before = profile.signable_bytes();
        profile.name = "Bob".to_string();
        assert_ne!(profile.signable_bytes(), before);
    }

    #[test]
    fn test_decode_garbage_fails_cleanly() {
        let garbage = vec![0xFFu8; 64];
        assert!(Envelope::decode(garbage.as_slice()).is_err());
    }

    #[test]
    fn test_shared_update_item_actions() {
        let item = SharedProfileUpdateItem {
            action: Some(shared_profile_update_item::Action::Remove(
                SharedProfileRemoveItem {
                    identity_id: vec![9u8; 20],
                },
            )),
        };
        let bytes = item.encode_to_vec();
        let restored = SharedProfileUpdateItem::decode(bytes.as_slice()).expect("decode");
        assert_eq!(item, restored);
    }
}
