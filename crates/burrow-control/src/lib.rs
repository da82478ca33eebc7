//! Control plane for the relay
//!
//! Owns everything that happens on a control connection: the handshake, the
//! registry of connected clients, request multiplexing over a single
//! connection, heartbeats and idle eviction.

pub mod connection;
pub mod error;
pub mod events;
pub mod handler;
pub mod multiplexer;
pub mod outbound;
pub mod registry;
pub mod supervisor;

pub use connection::TunnelClient;
pub use error::{ControlError, RelayError};
pub use events::{ChannelEvents, NoopEvents, RelayEvent, RelayEvents};
pub use handler::{ControlConfig, ControlHandler};
pub use multiplexer::{MultiplexerConfig, RequestMultiplexer, ResponseBody, TunnelResponse};
pub use outbound::{OutboundQueue, OutboundReceiver};
pub use registry::ClientRegistry;
pub use supervisor::LifecycleSupervisor;
