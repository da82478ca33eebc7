//! Protocol message types

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Identifier tying a request's frames to its response's frames on one control connection
pub type CorrelationId = u32;

/// Main control channel message enum
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    // Handshake (correlation ID 0)
    /// First frame sent by a client; carries the shared secret and an optional id to resume
    Open(Handshake),
    /// Relay acknowledgement of a successful handshake
    Opened {
        client_id: String,
        public_url: String,
    },

    // Relay -> client
    RequestHead {
        correlation_id: CorrelationId,
        head: RequestHead,
    },
    RequestChunk {
        correlation_id: CorrelationId,
        data: Bytes,
    },
    RequestEnd {
        correlation_id: CorrelationId,
    },

    // Client -> relay
    ResponseHead {
        correlation_id: CorrelationId,
        head: ResponseHead,
    },
    ResponseChunk {
        correlation_id: CorrelationId,
        data: Bytes,
    },
    ResponseEnd {
        correlation_id: CorrelationId,
    },

    // Either direction
    /// Terminal failure of one request, or of the whole connection when the correlation ID is 0
    Error {
        correlation_id: CorrelationId,
        message: String,
    },
    /// Best-effort notice that the sender abandoned a request
    Cancel {
        correlation_id: CorrelationId,
    },
    /// Grants the peer `increment` more bytes of body payload for a request
    WindowUpdate {
        correlation_id: CorrelationId,
        increment: u32,
    },
    Ping {
        timestamp: u64,
    },
    Pong {
        timestamp: u64,
    },
}

impl ControlMessage {
    /// Correlation ID carried in the frame header
    pub fn correlation_id(&self) -> CorrelationId {
        match self {
            ControlMessage::Open(_)
            | ControlMessage::Opened { .. }
            | ControlMessage::Ping { .. }
            | ControlMessage::Pong { .. } => crate::CONNECTION_CORRELATION_ID,
            ControlMessage::RequestHead { correlation_id, .. }
            | ControlMessage::RequestChunk { correlation_id, .. }
            | ControlMessage::RequestEnd { correlation_id }
            | ControlMessage::ResponseHead { correlation_id, .. }
            | ControlMessage::ResponseChunk { correlation_id, .. }
            | ControlMessage::ResponseEnd { correlation_id }
            | ControlMessage::Error { correlation_id, .. }
            | ControlMessage::Cancel { correlation_id }
            | ControlMessage::WindowUpdate { correlation_id, .. } => *correlation_id,
        }
    }

    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        crate::FrameType::of(self).name()
    }
}

/// Handshake payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Handshake {
    pub protocol_version: u32,
    pub secret: String,
    /// Client id to resume; the relay generates one when absent
    pub client_id: Option<String>,
}

impl Handshake {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            protocol_version: crate::PROTOCOL_VERSION,
            secret: secret.into(),
            client_id: None,
        }
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }
}

/// HTTP request metadata forwarded to the client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    /// Path as seen by the local service (routing prefix removed)
    pub path: String,
    pub query: Option<String>,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// Path and query joined back into a request target
    pub fn uri(&self) -> String {
        match &self.query {
            Some(query) => format!("{}?{}", self.path, query),
            None => self.path.clone(),
        }
    }
}

/// HTTP response metadata returned by the client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub(crate) struct OpenedPayload {
    pub client_id: String,
    pub public_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub(crate) struct ErrorPayload {
    pub message: String,
}
