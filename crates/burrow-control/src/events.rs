//! Relay lifecycle notifications

use tokio::sync::mpsc;
use tracing::debug;

/// Observer for relay lifecycle events
///
/// Called synchronously from relay tasks, so implementations must not block.
pub trait RelayEvents: Send + Sync {
    /// Public ingress is listening on `port`
    fn on_ready(&self, _port: u16) {}

    /// A client completed its handshake and is routable
    fn on_client_connect(&self, _client_id: &str) {}

    /// A client's control connection is gone; fired once per connection
    fn on_client_disconnect(&self, _client_id: &str) {}
}

/// Ignores every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEvents;

impl RelayEvents for NoopEvents {}

/// Event forwarded by [`ChannelEvents`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    Ready { port: u16 },
    ClientConnected { client_id: String },
    ClientDisconnected { client_id: String },
}

/// Forwards events into an unbounded tokio channel
#[derive(Debug, Clone)]
pub struct ChannelEvents {
    tx: mpsc::UnboundedSender<RelayEvent>,
}

impl ChannelEvents {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RelayEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, event: RelayEvent) {
        if self.tx.send(event).is_err() {
            debug!("Relay event receiver dropped");
        }
    }
}

impl RelayEvents for ChannelEvents {
    fn on_ready(&self, port: u16) {
        self.forward(RelayEvent::Ready { port });
    }

    fn on_client_connect(&self, client_id: &str) {
        self.forward(RelayEvent::ClientConnected {
            client_id: client_id.to_string(),
        });
    }

    fn on_client_disconnect(&self, client_id: &str) {
        self.forward(RelayEvent::ClientDisconnected {
            client_id: client_id.to_string(),
        });
    }
}
