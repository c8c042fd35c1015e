//! # homenet-proto
//!
//! Wire protocol for the homenet profile server.
//!
//! Every message on every role is a length-prefixed protobuf frame:
//!
//! ```text
//! [4-byte big-endian length][Envelope]
//!
//! Envelope {
//!     id:   u32,                     // caller-chosen, unique per conversation
//!     body: oneof { Request, Response }
//! }
//! Request  = oneof { Single, Conversation, LocalService }
//! Response = status + oneof { Single, Conversation, LocalService }
//! ```
//!
//! The codec surfaces exactly three outcomes to the conversation layer:
//! a decoded [`Envelope`](messages::Envelope), a
//! [`ProtocolViolation`](frame::FrameOutcome::ProtocolViolation), or
//! [`Eof`](frame::FrameOutcome::Eof). Frames larger than 1 MiB are protocol
//! violations before any allocation happens.

pub mod convert;
pub mod frame;
pub mod messages;
pub mod version;

pub use frame::{read_frame, write_frame, FrameOutcome, MAX_MESSAGE_SIZE};
pub use messages::{Envelope, Status, PROTOCOL_VIOLATION_ID};

/// Error types for wire-protocol operations.
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    /// Message could not be protobuf-encoded.
    #[error("encode error: {0}")]
    Encode(String),

    /// Outbound message exceeds the frame size cap.
    #[error("message too large: {size} bytes, max {max}")]
    TooLarge {
        /// Encoded size of the offending message.
        size: usize,
        /// The frame size cap.
        max: usize,
    },

    /// I/O error on the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for wire-protocol operations.
pub type Result<T> = std::result::Result<T, ProtoError>;
