//! Wire frames for the networked consumer.
//!
//! Per task, in order: the server sends a request frame (command tag,
//! fingerprint, length-prefixed payload), the client answers with a reply
//! frame (echoed fingerprint, evaluated flag, length-prefixed payload). All
//! integers travel big-endian; fingerprint fields are widened to eight bytes
//! each. A connection opens with a hello frame declaring the client's
//! mnemonic.

use courtier::{Command, Fingerprint};
use std::io::{self, Read};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Wire length of a fingerprint: four fields, eight bytes each.
pub const FINGERPRINT_WIRE_LEN: usize = 32;

/// Upper bound on payload frames; anything larger is a protocol violation.
pub const MAX_PAYLOAD_LEN: u64 = 64 * 1024 * 1024;

/// Error types for wire traffic.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// The peer closed the connection on a frame boundary.
    #[error("connection closed")]
    Closed,
    #[error("unknown command tag {0:#04x}")]
    UnknownCommand(u8),
    #[error("payload length {0} exceeds the {MAX_PAYLOAD_LEN}-byte limit")]
    OversizedPayload(u64),
    #[error("fingerprint field out of range")]
    FingerprintRange,
    #[error("malformed hello frame")]
    BadHello,
}

/// Server-to-client task dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRequest {
    pub command: Command,
    pub fingerprint: Fingerprint,
    pub payload: Vec<u8>,
}

/// Client-to-server task result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReply {
    /// Must echo the request fingerprint bit-for-bit.
    pub fingerprint: Fingerprint,
    pub evaluated: bool,
    pub payload: Vec<u8>,
}

/// Encodes a fingerprint in network byte order, each field widened to u64.
pub fn encode_fingerprint(fingerprint: Fingerprint) -> [u8; FINGERPRINT_WIRE_LEN] {
    let mut bytes = [0u8; FINGERPRINT_WIRE_LEN];
    bytes[0..8].copy_from_slice(&fingerprint.producer.to_be_bytes());
    bytes[8..16].copy_from_slice(&fingerprint.submission.to_be_bytes());
    bytes[16..24].copy_from_slice(&u64::from(fingerprint.generation).to_be_bytes());
    bytes[24..32].copy_from_slice(&u64::from(fingerprint.position).to_be_bytes());
    bytes
}

/// Decodes a wire fingerprint. The widened generation and position fields
/// must fit back into 32 bits.
pub fn decode_fingerprint(bytes: &[u8; FINGERPRINT_WIRE_LEN]) -> Result<Fingerprint, WireError> {
    let field = |range: std::ops::Range<usize>| {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&bytes[range]);
        u64::from_be_bytes(buf)
    };
    let generation =
        u32::try_from(field(16..24)).map_err(|_| WireError::FingerprintRange)?;
    let position = u32::try_from(field(24..32)).map_err(|_| WireError::FingerprintRange)?;
    Ok(Fingerprint {
        producer: field(0..8),
        submission: field(8..16),
        generation,
        position,
    })
}

/// Encodes a hello frame: one length byte plus the mnemonic bytes.
pub fn encode_hello(mnemonic: &str) -> Result<Vec<u8>, WireError> {
    let bytes = mnemonic.as_bytes();
    if bytes.is_empty() || bytes.len() > usize::from(u8::MAX) {
        return Err(WireError::BadHello);
    }
    let mut frame = Vec::with_capacity(1 + bytes.len());
    frame.push(bytes.len() as u8);
    frame.extend_from_slice(bytes);
    Ok(frame)
}

/// Encodes a request frame.
pub fn encode_request(request: &TaskRequest) -> Vec<u8> {
    let mut frame = Vec::with_capacity(1 + FINGERPRINT_WIRE_LEN + 8 + request.payload.len());
    frame.push(request.command.to_u8());
    frame.extend_from_slice(&encode_fingerprint(request.fingerprint));
    frame.extend_from_slice(&(request.payload.len() as u64).to_be_bytes());
    frame.extend_from_slice(&request.payload);
    frame
}

/// Encodes a reply frame.
pub fn encode_reply(reply: &TaskReply) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FINGERPRINT_WIRE_LEN + 1 + 8 + reply.payload.len());
    frame.extend_from_slice(&encode_fingerprint(reply.fingerprint));
    frame.push(u8::from(reply.evaluated));
    frame.extend_from_slice(&(reply.payload.len() as u64).to_be_bytes());
    frame.extend_from_slice(&reply.payload);
    frame
}

fn eof_to_closed(e: io::Error) -> WireError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        WireError::Closed
    } else {
        WireError::Io(e)
    }
}

fn checked_len(len: u64) -> Result<usize, WireError> {
    if len > MAX_PAYLOAD_LEN {
        return Err(WireError::OversizedPayload(len));
    }
    Ok(len as usize)
}

/// Reads a request frame from a blocking stream. A clean close on the frame
/// boundary is reported as [`WireError::Closed`].
pub fn read_request<R: Read>(reader: &mut R) -> Result<TaskRequest, WireError> {
    let mut tag = [0u8; 1];
    reader.read_exact(&mut tag).map_err(eof_to_closed)?;
    let command = Command::from_u8(tag[0]).ok_or(WireError::UnknownCommand(tag[0]))?;

    let mut fingerprint = [0u8; FINGERPRINT_WIRE_LEN];
    reader.read_exact(&mut fingerprint)?;
    let fingerprint = decode_fingerprint(&fingerprint)?;

    let mut len = [0u8; 8];
    reader.read_exact(&mut len)?;
    let len = checked_len(u64::from_be_bytes(len))?;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(TaskRequest {
        command,
        fingerprint,
        payload,
    })
}

/// Reads a reply frame from a blocking stream.
pub fn read_reply<R: Read>(reader: &mut R) -> Result<TaskReply, WireError> {
    let mut fingerprint = [0u8; FINGERPRINT_WIRE_LEN];
    reader.read_exact(&mut fingerprint).map_err(eof_to_closed)?;
    let fingerprint = decode_fingerprint(&fingerprint)?;

    let mut flag = [0u8; 1];
    reader.read_exact(&mut flag)?;

    let mut len = [0u8; 8];
    reader.read_exact(&mut len)?;
    let len = checked_len(u64::from_be_bytes(len))?;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(TaskReply {
        fingerprint,
        evaluated: flag[0] != 0,
        payload,
    })
}

/// Reads the hello frame a freshly connected client must send.
pub async fn read_hello_async<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String, WireError> {
    let len = reader.read_u8().await.map_err(eof_to_closed)?;
    if len == 0 {
        return Err(WireError::BadHello);
    }
    let mut bytes = vec![0u8; usize::from(len)];
    reader.read_exact(&mut bytes).await?;
    String::from_utf8(bytes).map_err(|_| WireError::BadHello)
}

/// Reads a reply frame from an async stream.
pub async fn read_reply_async<R: AsyncRead + Unpin>(reader: &mut R) -> Result<TaskReply, WireError> {
    let mut fingerprint = [0u8; FINGERPRINT_WIRE_LEN];
    let first = reader.read_u8().await.map_err(eof_to_closed)?;
    fingerprint[0] = first;
    reader.read_exact(&mut fingerprint[1..]).await?;
    let fingerprint = decode_fingerprint(&fingerprint)?;

    let evaluated = reader.read_u8().await? != 0;
    let len = checked_len(reader.read_u64().await?)?;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(TaskReply {
        fingerprint,
        evaluated,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn fingerprint() -> Fingerprint {
        Fingerprint {
            producer: 1,
            submission: 2,
            generation: 3,
            position: 4,
        }
    }

    #[test]
    fn request_frame_layout_is_fixed() {
        let request = TaskRequest {
            command: Command::Evaluate,
            fingerprint: fingerprint(),
            payload: b"abc".to_vec(),
        };
        let frame = encode_request(&request);
        assert_eq!(frame.len(), 1 + 32 + 8 + 3);
        assert_eq!(frame[0], 0);
        assert_eq!(&frame[1..9], &1u64.to_be_bytes());
        assert_eq!(&frame[9..17], &2u64.to_be_bytes());
        assert_eq!(&frame[17..25], &3u64.to_be_bytes());
        assert_eq!(&frame[25..33], &4u64.to_be_bytes());
        assert_eq!(&frame[33..41], &3u64.to_be_bytes());
        assert_eq!(&frame[41..], b"abc");

        let back = read_request(&mut Cursor::new(frame)).unwrap();
        assert_eq!(back, request);
    }

    #[test]
    fn reply_frame_round_trips() {
        let reply = TaskReply {
            fingerprint: fingerprint(),
            evaluated: true,
            payload: vec![9, 8, 7],
        };
        let frame = encode_reply(&reply);
        assert_eq!(frame[32], 1);
        let back = read_reply(&mut Cursor::new(frame)).unwrap();
        assert_eq!(back, reply);
    }

    #[test]
    fn fingerprint_survives_the_wire_bit_for_bit() {
        let original = fingerprint();
        let encoded = encode_fingerprint(original);
        assert_eq!(decode_fingerprint(&encoded).unwrap(), original);
    }

    #[test]
    fn clean_close_is_distinguished_from_io_errors() {
        let err = read_request(&mut Cursor::new(Vec::new())).unwrap_err();
        assert!(matches!(err, WireError::Closed));
        // a truncated frame mid-way is an i/o error, not a clean close
        let err = read_request(&mut Cursor::new(vec![0u8; 10])).unwrap_err();
        assert!(matches!(err, WireError::Io(_)));
    }

    #[test]
    fn unknown_command_tags_are_rejected()  {
        let mut frame = vec![0xffu8];
        frame.extend_from_slice(&[0u8; 48]);
        let err = read_request(&mut Cursor::new(frame)).unwrap_err();
        assert!(matches!(err, WireError::UnknownCommand(0xff)));
    }

    #[test]
    fn oversized_payloads_are_rejected() {
        let mut frame = vec![0u8];
        frame.extend_from_slice(&encode_fingerprint(fingerprint()));
        frame.extend_from_slice(&u64::MAX.to_be_bytes());
        let err = read_request(&mut Cursor::new(frame)).unwrap_err();
        assert!(matches!(err, WireError::OversizedPayload(_)));
    }

    #[test]
    fn hello_frames_validate_their_length() {
        assert!(encode_hello("nc").is_ok());
        assert!(encode_hello("").is_err());
        assert!(encode_hello(&"x".repeat(300)).is_err());
    }
}
