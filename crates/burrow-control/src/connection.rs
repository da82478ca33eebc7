//! Connected tunnel clients

use crate::error::RelayError;
use crate::multiplexer::RequestMultiplexer;
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

/// A client with a live control connection
///
/// Stored in the registry; the public ingress only ever borrows it.
#[derive(Debug)]
pub struct TunnelClient {
    id: String,
    /// Unique per control connection, unlike `id` which survives reconnects
    connection_id: Uuid,
    peer_addr: SocketAddr,
    connected_at: DateTime<Utc>,
    started: Instant,
    /// Milliseconds after `started` at which the last frame arrived
    last_activity_ms: AtomicU64,
    multiplexer: Arc<RequestMultiplexer>,
    shutdown: CancellationToken,
    disconnected: AtomicBool,
}

impl TunnelClient {
    pub fn new(
        id: impl Into<String>,
        peer_addr: SocketAddr,
        multiplexer: Arc<RequestMultiplexer>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            id: id.into(),
            connection_id: Uuid::new_v4(),
            peer_addr,
            connected_at: Utc::now(),
            started: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            multiplexer,
            shutdown,
            disconnected: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn multiplexer(&self) -> &Arc<RequestMultiplexer> {
        &self.multiplexer
    }

    /// Token cancelled when the connection must shut down
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Record inbound activity
    pub fn touch(&self) {
        let elapsed = self.started.elapsed().as_millis() as u64;
        self.last_activity_ms.store(elapsed, Ordering::Relaxed);
    }

    /// Time since the last inbound frame (or the handshake)
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last)
    }

    /// Fail in-flight requests and stop the connection's tasks
    pub fn evict(&self, reason: &str) {
        info!(
            "Evicting client {} (connection {}): {}",
            self.id, self.connection_id, reason
        );
        self.multiplexer.fail_all(RelayError::ConnectionClosed);
        self.shutdown.cancel();
    }

    /// Returns true only for the first caller, so disconnects are reported once
    pub fn mark_disconnected(&self) -> bool {
        !self.disconnected.swap(true, Ordering::SeqCst)
    }
}
