//! Idle client eviction

use crate::registry::ClientRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Periodically evicts clients that have gone quiet
///
/// Backstop for the per-connection heartbeat: a client whose connection is
/// wedged without the handler noticing is removed from the registry, its
/// requests fail and its handler is told to shut down.
pub struct LifecycleSupervisor {
    registry: Arc<ClientRegistry>,
    idle_timeout: Duration,
    sweep_interval: Duration,
}

impl LifecycleSupervisor {
    pub fn new(registry: Arc<ClientRegistry>, idle_timeout: Duration, sweep_interval: Duration) -> Self {
        Self {
            registry,
            idle_timeout,
            sweep_interval,
        }
    }

    /// Evict idle clients once, returning how many were evicted
    pub fn sweep(&self) -> usize {
        let mut evicted = 0;

        for client in self.registry.idle_clients(self.idle_timeout) {
            // Skip clients that reconnected or left since the scan
            if self.registry.unregister(client.id(), &client) {
                client.evict(&format!("idle for {:?}", client.idle_for()));
                evicted += 1;
            }
        }

        if evicted > 0 {
            info!("Evicted {} idle clients", evicted);
        }
        evicted
    }

    /// Sweep every `sweep_interval` until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick fires immediately
        interval.tick().await;

        debug!(
            "Supervisor started (idle timeout {:?}, sweep every {:?})",
            self.idle_timeout, self.sweep_interval
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.sweep();
                }
            }
        }

        debug!("Supervisor stopped");
    }
}
