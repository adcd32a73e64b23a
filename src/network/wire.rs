//! Peer protocol framing.
//!
//! Frame format:
//! - 4 bytes: network magic
//! - 12 bytes: ASCII command, NUL padded
//! - 4 bytes: payload length (u32 little-endian)
//! - 4 bytes: checksum, first 4 bytes of double-SHA256(payload)
//! - N bytes: bincode payload
//!
//! Decoding resynchronizes on the magic value. A frame that fails its checksum
//! or declares an oversized payload is dropped without closing the connection;
//! only an unbounded unparsed backlog is an error.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::constants::protocol::{COMMAND_SIZE, FRAME_HEADER_SIZE, MAX_BUFFERED_BYTES, MAX_PAYLOAD_SIZE};
use crate::network::message::NetworkMessage;
use crate::types::double_sha256;

#[derive(Error, Debug)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unparsed backlog of {buffered} bytes exceeds {limit}")]
    BufferOverflow { buffered: usize, limit: usize },

    #[error("Payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Failed to encode payload: {0}")]
    Encode(#[from] bincode::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    BadChecksum,
    Oversized(usize),
    BadCommand,
    Malformed(String),
}

/// One decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Message(NetworkMessage),
    /// Integrity failure; the frame was discarded
    Dropped { command: String, reason: DropReason },
    /// Well-formed frame with no registered builder
    Unsupported { command: String },
}

#[derive(Debug, Clone)]
pub struct WireCodec {
    magic: [u8; 4],
    max_payload: usize,
    max_buffered: usize,
}

impl WireCodec {
    pub fn new(magic: [u8; 4]) -> Self {
        Self {
            magic,
            max_payload: MAX_PAYLOAD_SIZE,
            max_buffered: MAX_BUFFERED_BYTES,
        }
    }

    pub fn with_limits(magic: [u8; 4], max_payload: usize, max_buffered: usize) -> Self {
        Self {
            magic,
            max_payload,
            max_buffered,
        }
    }

    pub fn magic(&self) -> [u8; 4] {
        self.magic
    }

    /// Serialize a message into a complete frame (for broadcasting one encoding to many peers).
    pub fn encode_frame(&self, message: &NetworkMessage) -> Result<Vec<u8>, WireError> {
        let mut buf = BytesMut::new();
        self.write_frame(message, &mut buf)?;
        Ok(buf.to_vec())
    }

    fn write_frame(&self, message: &NetworkMessage, dst: &mut BytesMut) -> Result<(), WireError> {
        let payload = message.encode_payload()?;
        if payload.len() > self.max_payload {
            return Err(WireError::PayloadTooLarge {
                size: payload.len(),
                max: self.max_payload,
            });
        }

        let mut command = [0u8; COMMAND_SIZE];
        let name = message.command().as_bytes();
        command[..name.len()].copy_from_slice(name);

        dst.reserve(FRAME_HEADER_SIZE + payload.len());
        dst.put_slice(&self.magic);
        dst.put_slice(&command);
        dst.put_u32_le(payload.len() as u32);
        dst.put_slice(&double_sha256(&payload)[..4]);
        dst.put_slice(&payload);
        Ok(())
    }

    /// Discard everything before the next magic. Returns false when no magic
    /// is buffered yet (a partial magic at the tail is kept).
    fn seek_magic(&self, src: &mut BytesMut) -> bool {
        if let Some(pos) = src.windows(4).position(|w| w == self.magic) {
            src.advance(pos);
            return true;
        }
        let keep = src.len().min(3);
        let discard = src.len() - keep;
        src.advance(discard);
        false
    }
}

fn parse_command(raw: &[u8]) -> Option<String> {
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    // Padding must be all NUL
    if raw[end..].iter().any(|b| *b != 0) {
        return None;
    }
    let name = &raw[..end];
    if name.is_empty() || !name.iter().all(|b| b.is_ascii_graphic()) {
        return None;
    }
    Some(String::from_utf8_lossy(name).into_owned())
}

impl Decoder for WireCodec {
    type Item = Decoded;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Decoded>, WireError> {
        if src.len() > self.max_buffered {
            return Err(WireError::BufferOverflow {
                buffered: src.len(),
                limit: self.max_buffered,
            });
        }

        if !self.seek_magic(src) || src.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let command_bytes = &src[4..4 + COMMAND_SIZE];
        let command = parse_command(command_bytes);
        let length = u32::from_le_bytes([src[16], src[17], src[18], src[19]]) as usize;
        let checksum = [src[20], src[21], src[22], src[23]];

        let Some(command) = command else {
            // Not a real frame header; skip this magic and rescan
            src.advance(4);
            return Ok(Some(Decoded::Dropped {
                command: String::new(),
                reason: DropReason::BadCommand,
            }));
        };

        if length > self.max_payload {
            src.advance(4);
            return Ok(Some(Decoded::Dropped {
                command,
                reason: DropReason::Oversized(length),
            }));
        }

        if src.len() < FRAME_HEADER_SIZE + length {
            src.reserve(FRAME_HEADER_SIZE + length - src.len());
            return Ok(None);
        }

        src.advance(FRAME_HEADER_SIZE);
        let payload = src.split_to(length);

        if double_sha256(&payload)[..4] != checksum {
            return Ok(Some(Decoded::Dropped {
                command,
                reason: DropReason::BadChecksum,
            }));
        }

        match NetworkMessage::from_payload(&command, &payload) {
            Ok(Some(message)) => Ok(Some(Decoded::Message(message))),
            Ok(None) => Ok(Some(Decoded::Unsupported { command })),
            Err(e) => Ok(Some(Decoded::Dropped {
                command,
                reason: DropReason::Malformed(e.to_string()),
            })),
        }
    }
}

impl Encoder<NetworkMessage> for WireCodec {
    type Error = WireError;

    fn encode(&mut self, message: NetworkMessage, dst: &mut BytesMut) -> Result<(), WireError> {
        self.write_frame(&message, dst)
    }
}
