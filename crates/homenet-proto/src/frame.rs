//! Length-prefixed framing over async byte streams.
//!
//! ```text
//! [4-byte big-endian length][protobuf Envelope]
//! ```
//!
//! A length prefix above 1 MiB is rejected before the body is read, so a
//! hostile peer cannot force a large allocation with a small frame.

use prost::Message as _;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::messages::Envelope;
use crate::{ProtoError, Result};

/// Maximum encoded message size (1 MiB).
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Outcome of reading one frame.
#[derive(Debug)]
pub enum FrameOutcome {
    /// A well-formed envelope.
    Message(Envelope),
    /// Malformed framing or an undecodable body. The reason is for logs;
    /// the peer only ever sees the protocol-violation response.
    ProtocolViolation(String),
    /// The peer closed the stream at a frame boundary.
    Eof,
}

/// Read one frame from the stream.
///
/// # Errors
///
/// Returns [`ProtoError::Io`] only for transport-level failures. Peer
/// misbehavior is reported in-band as
/// [`FrameOutcome::ProtocolViolation`]; a clean close at a frame boundary
/// is [`FrameOutcome::Eof`].
pub async fn read_frame<R>(reader: &mut R) -> Result<FrameOutcome>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Ok(FrameOutcome::Eof);
        }
        Err(e) => return Err(ProtoError::Io(e)),
    }

    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Ok(FrameOutcome::ProtocolViolation(format!(
            "frame length {len} exceeds {MAX_MESSAGE_SIZE}"
        )));
    }

    let mut body = vec![0u8; len];
    match reader.read_exact(&mut body).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            // A truncated body is a mid-frame close, not a clean EOF.
            return Ok(FrameOutcome::ProtocolViolation(
                "stream closed mid-frame".to_string(),
            ));
        }
        Err(e) => return Err(ProtoError::Io(e)),
    }

    match Envelope::decode(body.as_slice()) {
        Ok(envelope) => {
            if envelope.body.is_none() {
                return Ok(FrameOutcome::ProtocolViolation(
                    "envelope without request or response".to_string(),
                ));
            }
            Ok(FrameOutcome::Message(envelope))
        }
        Err(e) => Ok(FrameOutcome::ProtocolViolation(format!(
            "undecodable envelope: {e}"
        ))),
    }
}

/// Write one frame to the stream and flush it.
///
/// # Errors
///
/// Returns [`ProtoError::TooLarge`] if the encoded envelope exceeds
/// [`MAX_MESSAGE_SIZE`], [`ProtoError::Io`] on transport failure.
pub async fn write_frame<W>(writer: &mut W, envelope: &Envelope) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = envelope.encode_to_vec();
    if body.len() > MAX_MESSAGE_SIZE {
        return Err(ProtoError::TooLarge {
            size: body.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }

    let len = (body.len() as u32).to_be_bytes();
    writer.write_all(&len).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}
