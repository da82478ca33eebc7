//! Burrow relay library
//!
//! Re-exports the relay crates and provides [`RelayBuilder`], which runs a
//! complete relay: a control listener for tunnel clients, the public HTTP
//! ingress and the idle-client supervisor.
//!
//! # Quick Start
//!
//! ```ignore
//! use burrow_lib::{ChannelEvents, RelayBuilder, RelayEvent};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (events, mut rx) = ChannelEvents::new();
//! let relay = RelayBuilder::new("my-secret", "https://relay.example.com")
//!     .events(Arc::new(events))
//!     .build()?
//!     .start()
//!     .await?;
//!
//! while let Some(event) = rx.recv().await {
//!     if let RelayEvent::ClientConnected { client_id } = event {
//!         println!("client {} connected", client_id);
//!     }
//! }
//! relay.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod relay;
pub mod relay_config;

pub use relay::{Relay, RelayBuilder, RelayBuilderError, RunningRelay};
pub use relay_config::{ConfigError, RelayConfig};

pub use burrow_auth::{generate_client_id, validate_client_id, ClientIdError, SharedSecret};
pub use burrow_control::{
    ChannelEvents, ClientRegistry, ControlConfig, ControlError, ControlHandler, LifecycleSupervisor,
    NoopEvents, RelayError, RelayEvent, RelayEvents, TunnelClient,
};
pub use burrow_proto::{
    CodecError, ControlCodec, ControlMessage, Handshake, RequestHead, ResponseHead, PROTOCOL_VERSION,
};
pub use burrow_router::{PublicRouter, RouteError, RoutingMode};
pub use burrow_server_http::{HttpServer, HttpServerConfig, HttpServerError, PublicIngress};
