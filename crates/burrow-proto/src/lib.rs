//! Control channel protocol definitions
//!
//! This crate defines the messages exchanged between the relay and a tunnel
//! client over a control connection, and the length-delimited codec that
//! turns them into bytes and back.

pub mod codec;
pub mod messages;

pub use codec::{CodecError, ControlCodec, FrameHeader, FrameType};
pub use messages::*;

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Default maximum frame payload size (1MB)
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 1024 * 1024;

/// Correlation ID used by connection-scoped frames (Open, Opened, Ping, Pong)
pub const CONNECTION_CORRELATION_ID: u32 = 0;
