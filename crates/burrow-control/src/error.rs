//! Control plane errors

use burrow_proto::CodecError;
use thiserror::Error;

/// Terminal error for one control connection
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Authentication failed")]
    Auth,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Heartbeat timeout: no pong within {0:?}")]
    HeartbeatTimeout(std::time::Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection closed by relay")]
    Evicted,
}

impl From<CodecError> for ControlError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Io(e) => ControlError::Io(e),
            other => ControlError::Protocol(other.to_string()),
        }
    }
}

/// Failure of a single tunneled request
///
/// Cloneable so one failure can be fanned out to every pending request of a
/// connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("Tunnel client '{0}' is not connected")]
    UpstreamUnavailable(String),

    #[error("Request timed out")]
    RequestTimeout,

    #[error("Tunnel connection closed")]
    ConnectionClosed,

    #[error("Tunnel client error: {0}")]
    Upstream(String),

    #[error("Tunnel client exceeded its flow-control window")]
    FlowControl,

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Failed to read request body: {0}")]
    RequestBody(String),

    #[error("No request ids available on this connection")]
    RequestIdsExhausted,
}

impl RelayError {
    /// HTTP status the public ingress answers with for this failure
    pub fn status_code(&self) -> u16 {
        match self {
            RelayError::RequestTimeout => 504,
            RelayError::RequestBody(_) => 400,
            RelayError::RequestIdsExhausted => 503,
            RelayError::UpstreamUnavailable(_)
            | RelayError::ConnectionClosed
            | RelayError::Upstream(_)
            | RelayError::FlowControl
            | RelayError::Protocol(_) => 502,
        }
    }
}
