//! Length-delimited framing for control channel messages
//!
//! Every frame starts with a fixed 9-byte header followed by the payload:
//!
//! ```text
//! +----------------------+--------------+----------------+------------------+
//! | correlation_id (u32) | type (u8)    | length (u32)   | payload (length) |
//! +----------------------+--------------+----------------+------------------+
//! ```
//!
//! All integers are big endian. Request bodies and response bodies are never
//! framed whole; they travel as a sequence of chunk frames.

use crate::messages::{
    ControlMessage, CorrelationId, ErrorPayload, Handshake, OpenedPayload, RequestHead,
    ResponseHead,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use std::fmt;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Open = 1,
    Opened = 2,
    RequestHead = 3,
    RequestChunk = 4,
    RequestEnd = 5,
    ResponseHead = 6,
    ResponseChunk = 7,
    ResponseEnd = 8,
    Error = 9,
    Cancel = 10,
    WindowUpdate = 11,
    Ping = 12,
    Pong = 13,
}

impl TryFrom<u8> for FrameType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            1 => Ok(FrameType::Open),
            2 => Ok(FrameType::Opened),
            3 => Ok(FrameType::RequestHead),
            4 => Ok(FrameType::RequestChunk),
            5 => Ok(FrameType::RequestEnd),
            6 => Ok(FrameType::ResponseHead),
            7 => Ok(FrameType::ResponseChunk),
            8 => Ok(FrameType::ResponseEnd),
            9 => Ok(FrameType::Error),
            10 => Ok(FrameType::Cancel),
            11 => Ok(FrameType::WindowUpdate),
            12 => Ok(FrameType::Ping),
            13 => Ok(FrameType::Pong),
            other => Err(other),
        }
    }
}

impl FrameType {
    pub fn of(message: &ControlMessage) -> Self {
        match message {
            ControlMessage::Open(_) => FrameType::Open,
            ControlMessage::Opened { .. } => FrameType::Opened,
            ControlMessage::RequestHead { .. } => FrameType::RequestHead,
            ControlMessage::RequestChunk { .. } => FrameType::RequestChunk,
            ControlMessage::RequestEnd { .. } => FrameType::RequestEnd,
            ControlMessage::ResponseHead { .. } => FrameType::ResponseHead,
            ControlMessage::ResponseChunk { .. } => FrameType::ResponseChunk,
            ControlMessage::ResponseEnd { .. } => FrameType::ResponseEnd,
            ControlMessage::Error { .. } => FrameType::Error,
            ControlMessage::Cancel { .. } => FrameType::Cancel,
            ControlMessage::WindowUpdate { .. } => FrameType::WindowUpdate,
            ControlMessage::Ping { .. } => FrameType::Ping,
            ControlMessage::Pong { .. } => FrameType::Pong,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            FrameType::Open => "Open",
            FrameType::Opened => "Opened",
            FrameType::RequestHead => "RequestHead",
            FrameType::RequestChunk => "RequestChunk",
            FrameType::RequestEnd => "RequestEnd",
            FrameType::ResponseHead => "ResponseHead",
            FrameType::ResponseChunk => "ResponseChunk",
            FrameType::ResponseEnd => "ResponseEnd",
            FrameType::Error => "Error",
            FrameType::Cancel => "Cancel",
            FrameType::WindowUpdate => "WindowUpdate",
            FrameType::Ping => "Ping",
            FrameType::Pong => "Pong",
        }
    }

    /// Frames that belong to a single request and must carry a non-zero correlation ID
    fn is_request_scoped(self) -> bool {
        !matches!(
            self,
            FrameType::Open
                | FrameType::Opened
                | FrameType::Ping
                | FrameType::Pong
                | FrameType::Error
        )
    }

    /// Frames that belong to the connection and must carry correlation ID 0
    fn is_connection_scoped(self) -> bool {
        matches!(
            self,
            FrameType::Open | FrameType::Opened | FrameType::Ping | FrameType::Pong
        )
    }
}

/// Raw frame header, kept around for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub correlation_id: CorrelationId,
    pub frame_type: u8,
    pub length: u32,
}

impl FrameHeader {
    /// Header size: correlation_id (4) + frame_type (1) + length (4) = 9 bytes
    pub const SIZE: usize = 9;

    fn peek(mut buf: &[u8]) -> Self {
        let correlation_id = buf.get_u32();
        let frame_type = buf.get_u8();
        let length = buf.get_u32();
        Self {
            correlation_id,
            frame_type,
            length,
        }
    }
}

impl fmt::Display for FrameHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[type=0x{:02x} correlation_id={} length={}]",
            self.frame_type, self.correlation_id, self.length
        )
    }
}

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid frame type {header}")]
    InvalidFrameType { header: FrameHeader },

    #[error("Frame too large {header}: maximum is {max} bytes")]
    FrameTooLarge { header: FrameHeader, max: u32 },

    #[error("Invalid correlation ID for {kind} frame {header}")]
    InvalidCorrelationId {
        header: FrameHeader,
        kind: &'static str,
    },

    #[error("Malformed {kind} payload {header}: {reason}")]
    MalformedPayload {
        header: FrameHeader,
        kind: &'static str,
        reason: String,
    },

    #[error("Outgoing {kind} payload of {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge {
        kind: &'static str,
        size: usize,
        max: u32,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

impl CodecError {
    /// Header of the offending inbound frame, if the error came from decoding
    pub fn header(&self) -> Option<FrameHeader> {
        match self {
            CodecError::InvalidFrameType { header }
            | CodecError::FrameTooLarge { header, .. }
            | CodecError::InvalidCorrelationId { header, .. }
            | CodecError::MalformedPayload { header, .. } => Some(*header),
            _ => None,
        }
    }
}

/// Control channel codec
///
/// Stateless apart from the configured size limit; partial frames stay in the
/// caller's read buffer until enough bytes have arrived.
#[derive(Debug, Clone)]
pub struct ControlCodec {
    max_frame_size: u32,
}

impl ControlCodec {
    pub fn new() -> Self {
        Self::with_max_frame_size(crate::DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(max_frame_size: u32) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size
    }
}

impl Default for ControlCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn deserialize<T: serde::de::DeserializeOwned>(
    header: FrameHeader,
    frame_type: FrameType,
    payload: &[u8],
) -> Result<T, CodecError> {
    bincode::deserialize(payload).map_err(|e| CodecError::MalformedPayload {
        header,
        kind: frame_type.name(),
        reason: e.to_string(),
    })
}

fn expect_len(
    header: FrameHeader,
    frame_type: FrameType,
    payload: &Bytes,
    expected: usize,
) -> Result<(), CodecError> {
    if payload.len() != expected {
        return Err(CodecError::MalformedPayload {
            header,
            kind: frame_type.name(),
            reason: format!("expected {} bytes, got {}", expected, payload.len()),
        });
    }
    Ok(())
}

fn decode_payload(
    header: FrameHeader,
    frame_type: FrameType,
    mut payload: Bytes,
) -> Result<ControlMessage, CodecError> {
    let correlation_id = header.correlation_id;

    let message = match frame_type {
        FrameType::Open => ControlMessage::Open(deserialize::<Handshake>(
            header, frame_type, &payload,
        )?),
        FrameType::Opened => {
            let opened: OpenedPayload = deserialize(header, frame_type, &payload)?;
            ControlMessage::Opened {
                client_id: opened.client_id,
                public_url: opened.public_url,
            }
        }
        FrameType::RequestHead => ControlMessage::RequestHead {
            correlation_id,
            head: deserialize::<RequestHead>(header, frame_type, &payload)?,
        },
        FrameType::RequestChunk => ControlMessage::RequestChunk {
            correlation_id,
            data: payload,
        },
        FrameType::RequestEnd => {
            expect_len(header, frame_type, &payload, 0)?;
            ControlMessage::RequestEnd { correlation_id }
        }
        FrameType::ResponseHead => ControlMessage::ResponseHead {
            correlation_id,
            head: deserialize::<ResponseHead>(header, frame_type, &payload)?,
        },
        FrameType::ResponseChunk => ControlMessage::ResponseChunk {
            correlation_id,
            data: payload,
        },
        FrameType::ResponseEnd => {
            expect_len(header, frame_type, &payload, 0)?;
            ControlMessage::ResponseEnd { correlation_id }
        }
        FrameType::Error => {
            let error: ErrorPayload = deserialize(header, frame_type, &payload)?;
            ControlMessage::Error {
                correlation_id,
                message: error.message,
            }
        }
        FrameType::Cancel => {
            expect_len(header, frame_type, &payload, 0)?;
            ControlMessage::Cancel { correlation_id }
        }
        FrameType::WindowUpdate => {
            expect_len(header, frame_type, &payload, 4)?;
            let increment = payload.get_u32();
            if increment == 0 {
                return Err(CodecError::MalformedPayload {
                    header,
                    kind: frame_type.name(),
                    reason: "zero window increment".to_string(),
                });
            }
            ControlMessage::WindowUpdate {
                correlation_id,
                increment,
            }
        }
        FrameType::Ping => {
            expect_len(header, frame_type, &payload, 8)?;
            ControlMessage::Ping {
                timestamp: payload.get_u64(),
            }
        }
        FrameType::Pong => {
            expect_len(header, frame_type, &payload, 8)?;
            ControlMessage::Pong {
                timestamp: payload.get_u64(),
            }
        }
    };

    Ok(message)
}

impl Decoder for ControlCodec {
    type Item = ControlMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need the full header before anything can be validated
        if src.len() < FrameHeader::SIZE {
            src.reserve(FrameHeader::SIZE - src.len());
            return Ok(None);
        }

        let header = FrameHeader::peek(&src[..FrameHeader::SIZE]);

        let frame_type = FrameType::try_from(header.frame_type)
            .map_err(|_| CodecError::InvalidFrameType { header })?;

        if header.length > self.max_frame_size {
            return Err(CodecError::FrameTooLarge {
                header,
                max: self.max_frame_size,
            });
        }

        let invalid_correlation = if frame_type.is_request_scoped() {
            header.correlation_id == crate::CONNECTION_CORRELATION_ID
        } else {
            frame_type.is_connection_scoped()
                && header.correlation_id != crate::CONNECTION_CORRELATION_ID
        };
        if invalid_correlation {
            return Err(CodecError::InvalidCorrelationId {
                header,
                kind: frame_type.name(),
            });
        }

        let frame_len = FrameHeader::SIZE + header.length as usize;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(FrameHeader::SIZE);
        let payload = src.split_to(header.length as usize).freeze();

        decode_payload(header, frame_type, payload).map(Some)
    }
}

fn serialize<T: Serialize>(value: &T) -> Result<Bytes, CodecError> {
    Ok(Bytes::from(bincode::serialize(value)?))
}

impl Encoder<ControlMessage> for ControlCodec {
    type Error = CodecError;

    fn encode(&mut self, item: ControlMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let frame_type = FrameType::of(&item);
        let correlation_id = item.correlation_id();

        let payload = match item {
            ControlMessage::Open(handshake) => serialize(&handshake)?,
            ControlMessage::Opened {
                client_id,
                public_url,
            } => serialize(&OpenedPayload {
                client_id,
                public_url,
            })?,
            ControlMessage::RequestHead { head, .. } => serialize(&head)?,
            ControlMessage::ResponseHead { head, .. } => serialize(&head)?,
            ControlMessage::RequestChunk { data, .. } | ControlMessage::ResponseChunk { data, .. } => {
                data
            }
            ControlMessage::RequestEnd { .. }
            | ControlMessage::ResponseEnd { .. }
            | ControlMessage::Cancel { .. } => Bytes::new(),
            ControlMessage::Error { message, .. } => serialize(&ErrorPayload { message })?,
            ControlMessage::WindowUpdate { increment, .. } => {
                Bytes::copy_from_slice(&increment.to_be_bytes())
            }
            ControlMessage::Ping { timestamp } | ControlMessage::Pong { timestamp } => {
                Bytes::copy_from_slice(&timestamp.to_be_bytes())
            }
        };

        if payload.len() > self.max_frame_size as usize {
            return Err(CodecError::PayloadTooLarge {
                kind: frame_type.name(),
                size: payload.len(),
                max: self.max_frame_size,
            });
        }

        dst.reserve(FrameHeader::SIZE + payload.len());
        dst.put_u32(correlation_id);
        dst.put_u8(frame_type as u8);
        dst.put_u32(payload.len() as u32);
        dst.put(payload);

        Ok(())
    }
}
