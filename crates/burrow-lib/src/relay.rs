//! High-level relay builder
//!
//! Wires the control listener, public ingress and lifecycle supervisor
//! around one shared client registry.
//!
//! ```ignore
//! use burrow_lib::RelayBuilder;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let relay = RelayBuilder::new("my-secret", "https://relay.example.com")
//!         .port(8080)
//!         .control_port(4040)
//!         .build()?;
//!     relay.run().await?;
//!     Ok(())
//! }
//! ```

use crate::relay_config::{ConfigError, RelayConfig};
use burrow_auth::SharedSecret;
use burrow_control::{ClientRegistry, ControlHandler, LifecycleSupervisor, NoopEvents, RelayEvents};
use burrow_router::{PublicRouter, RoutingMode};
use burrow_server_http::{HttpServer, HttpServerConfig, HttpServerError};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Relay builder errors
#[derive(Error, Debug)]
pub enum RelayBuilderError {
    #[error("Configuration error: {0}")]
    ConfigError(#[from] ConfigError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Server error: {0}")]
    ServerError(#[from] HttpServerError),

    #[error("Failed to bind control listener to {address}: {reason}")]
    BindError { address: SocketAddr, reason: String },
}

/// Builds a [`Relay`] from a [`RelayConfig`]
pub struct RelayBuilder {
    config: RelayConfig,
    events: Arc<dyn RelayEvents>,
}

impl RelayBuilder {
    pub fn new(secret: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self::from_config(RelayConfig::new(secret, base_url))
    }

    pub fn from_config(config: RelayConfig) -> Self {
        Self {
            config,
            events: Arc::new(NoopEvents),
        }
    }

    /// Public ingress port (0 for an ephemeral port)
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Control listener port (0 for an ephemeral port)
    pub fn control_port(mut self, port: u16) -> Self {
        self.config.control_port = port;
        self
    }

    pub fn bind_host(mut self, host: IpAddr) -> Self {
        self.config.bind_host = host;
        self
    }

    pub fn mode(mut self, mode: RoutingMode) -> Self {
        self.config.mode = mode;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn heartbeat(mut self, interval: Duration, timeout: Duration) -> Self {
        self.config.heartbeat_interval_ms = interval.as_millis() as u64;
        self.config.heartbeat_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn idle_timeout(mut self, idle_timeout: Duration, sweep_interval: Duration) -> Self {
        self.config.idle_timeout_ms = idle_timeout.as_millis() as u64;
        self.config.sweep_interval_ms = sweep_interval.as_millis() as u64;
        self
    }

    /// Observer for ready, connect and disconnect notifications
    pub fn events(mut self, events: Arc<dyn RelayEvents>) -> Self {
        self.events = events;
        self
    }

    /// Validate the configuration and assemble the relay
    pub fn build(self) -> Result<Relay, RelayBuilderError> {
        let base_url = self.config.validate()?;
        let router = Arc::new(
            PublicRouter::new(self.config.mode, &base_url)
                .map_err(|e| ConfigError::InvalidBaseUrl {
                    url: self.config.base_url.clone(),
                    reason: e.to_string(),
                })?,
        );

        Ok(Relay {
            config: self.config,
            router,
            registry: Arc::new(ClientRegistry::new()),
            events: self.events,
        })
    }
}

/// A configured relay, ready to bind its listeners
pub struct Relay {
    config: RelayConfig,
    router: Arc<PublicRouter>,
    registry: Arc<ClientRegistry>,
    events: Arc<dyn RelayEvents>,
}

impl Relay {
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Registry of connected clients
    pub fn registry(&self) -> Arc<ClientRegistry> {
        self.registry.clone()
    }

    /// Bind both listeners and start serving in the background
    pub async fn start(self) -> Result<RunningRelay, RelayBuilderError> {
        let shutdown = CancellationToken::new();

        let control_addr = self.config.control_addr();
        let control_listener = TcpListener::bind(control_addr)
            .await
            .map_err(|e| RelayBuilderError::BindError {
                address: control_addr,
                reason: e.to_string(),
            })?;

        let http_server = HttpServer::new(
            HttpServerConfig {
                bind_addr: self.config.public_addr(),
                request_timeout: self.config.request_timeout(),
            },
            self.registry.clone(),
            self.router.clone(),
        );
        let public_listener = http_server.bind().await?;

        let control_addr = control_listener.local_addr()?;
        let public_addr = public_listener.local_addr()?;

        let handler = Arc::new(
            ControlHandler::new(
                self.registry.clone(),
                self.router.clone(),
                SharedSecret::new(&self.config.secret),
            )
            .with_events(self.events.clone())
            .with_config(self.config.control_config())
            .with_shutdown(shutdown.clone()),
        );

        let mut tasks = JoinSet::new();

        tasks.spawn(run_control_listener(control_listener, handler, shutdown.clone()));

        {
            let shutdown = shutdown.clone();
            tasks.spawn(async move {
                if let Err(e) = http_server.serve(public_listener, shutdown).await {
                    error!("HTTP ingress error: {}", e);
                }
            });
        }

        let supervisor = LifecycleSupervisor::new(
            self.registry.clone(),
            self.config.idle_timeout(),
            self.config.sweep_interval(),
        );
        tasks.spawn(supervisor.run(shutdown.clone()));

        info!(
            "Relay ready: public ingress on {}, control on {}, {} routing under {}",
            public_addr, control_addr, self.config.mode, self.config.base_url
        );
        self.events.on_ready(public_addr.port());

        Ok(RunningRelay {
            public_addr,
            control_addr,
            registry: self.registry,
            shutdown,
            tasks,
        })
    }

    /// Start the relay and serve until the process exits
    pub async fn run(self) -> Result<(), RelayBuilderError> {
        self.start().await?.wait().await;
        Ok(())
    }
}

/// Handle to a relay whose listeners are bound and serving
pub struct RunningRelay {
    public_addr: SocketAddr,
    control_addr: SocketAddr,
    registry: Arc<ClientRegistry>,
    shutdown: CancellationToken,
    tasks: JoinSet<()>,
}

impl RunningRelay {
    pub fn public_addr(&self) -> SocketAddr {
        self.public_addr
    }

    pub fn control_addr(&self) -> SocketAddr {
        self.control_addr
    }

    pub fn registry(&self) -> Arc<ClientRegistry> {
        self.registry.clone()
    }

    /// Token that stops the whole relay when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Wait until every relay task has exited
    pub async fn wait(mut self) {
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                error!("Relay task failed: {}", e);
            }
        }
    }

    /// Close both listeners and every control connection
    pub async fn shutdown(self) {
        info!("Shutting down relay");
        self.shutdown.cancel();
        self.wait().await;
    }
}

async fn run_control_listener(
    listener: TcpListener,
    handler: Arc<ControlHandler>,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((socket, peer_addr)) => {
                if let Err(e) = socket.set_nodelay(true) {
                    debug!("Failed to set TCP_NODELAY for {}: {}", peer_addr, e);
                }

                let handler = handler.clone();
                tokio::spawn(async move {
                    if let Err(e) = handler.handle_connection(socket, peer_addr).await {
                        warn!("Control connection from {} ended: {}", peer_addr, e);
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept control connection: {}", e);
            }
        }
    }

    debug!("Control listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_rejects_invalid_config() {
        let result = RelayBuilder::new("", "http://relay.test").build();
        assert!(matches!(
            result,
            Err(RelayBuilderError::ConfigError(ConfigError::EmptySecret))
        ));

        let result = RelayBuilder::new("secret", "relay.test").build();
        assert!(matches!(
            result,
            Err(RelayBuilderError::ConfigError(ConfigError::InvalidBaseUrl { .. }))
        ));
    }

    #[test]
    fn test_builder_settings() {
        let relay = RelayBuilder::new("secret", "http://relay.test")
            .port(0)
            .control_port(0)
            .mode(RoutingMode::Subdomain)
            .request_timeout(Duration::from_millis(250))
            .build()
            .unwrap();

        let config = relay.config();
        assert_eq!(config.port, 0);
        assert_eq!(config.control_port, 0);
        assert_eq!(config.mode, RoutingMode::Subdomain);
        assert_eq!(config.request_timeout_ms, 250);
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let relay = RelayBuilder::new("secret", "http://relay.test")
            .bind_host("127.0.0.1".parse().unwrap())
            .port(0)
            .control_port(0)
            .build()
            .unwrap();

        let running = relay.start().await.unwrap();
        assert_ne!(running.public_addr().port(), 0);
        assert_ne!(running.control_addr().port(), 0);
        assert!(running.registry().is_empty());

        running.shutdown().await;
    }

    #[tokio::test]
    async fn test_control_port_in_use() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let relay = RelayBuilder::new("secret", "http://relay.test")
            .bind_host("127.0.0.1".parse().unwrap())
            .port(0)
            .control_port(port)
            .build()
            .unwrap();

        assert!(matches!(
            relay.start().await,
            Err(RelayBuilderError::BindError { .. })
        ));
    }
}
