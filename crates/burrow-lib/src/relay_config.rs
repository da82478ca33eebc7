//! Relay configuration
//!
//! Everything needed to run a relay, deserialisable from any serde format.
//! Only `secret` and `base_url` are required; everything else has a default.

use burrow_control::ControlConfig;
use burrow_router::RoutingMode;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Configuration validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Secret must not be empty")]
    EmptySecret,

    #[error("Invalid base URL '{url}': {reason}")]
    InvalidBaseUrl { url: String, reason: String },

    #[error("chunk_size ({chunk_size}) must not exceed {limit_name} ({limit})")]
    ChunkTooLarge {
        chunk_size: usize,
        limit_name: &'static str,
        limit: u64,
    },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

fn default_port() -> u16 {
    8080
}

fn default_control_port() -> u16 {
    4040
}

fn default_bind_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_heartbeat_interval_ms() -> u64 {
    10_000
}

fn default_heartbeat_timeout_ms() -> u64 {
    5_000
}

fn default_idle_timeout_ms() -> u64 {
    90_000
}

fn default_sweep_interval_ms() -> u64 {
    15_000
}

fn default_max_frame_size() -> u32 {
    burrow_proto::DEFAULT_MAX_FRAME_SIZE
}

fn default_chunk_size() -> usize {
    burrow_control::multiplexer::DEFAULT_CHUNK_SIZE
}

fn default_window_size() -> u32 {
    burrow_control::multiplexer::DEFAULT_WINDOW_SIZE
}

/// Relay settings
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelayConfig {
    /// Public ingress port (0 picks an ephemeral port)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Control listener port (0 picks an ephemeral port)
    #[serde(default = "default_control_port")]
    pub control_port: u16,

    /// Listen address for both listeners
    #[serde(default = "default_bind_host")]
    pub bind_host: IpAddr,

    /// Shared secret clients must present in their handshake
    pub secret: String,

    /// Public base URL clients are handed their addresses under
    pub base_url: String,

    #[serde(default)]
    pub mode: RoutingMode,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,

    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: u32,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    #[serde(default = "default_window_size")]
    pub window_size: u32,
}

// Hand-written so the secret never reaches logs
impl fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayConfig")
            .field("port", &self.port)
            .field("control_port", &self.control_port)
            .field("bind_host", &self.bind_host)
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("mode", &self.mode)
            .field("request_timeout_ms", &self.request_timeout_ms)
            .field("handshake_timeout_ms", &self.handshake_timeout_ms)
            .field("heartbeat_interval_ms", &self.heartbeat_interval_ms)
            .field("heartbeat_timeout_ms", &self.heartbeat_timeout_ms)
            .field("idle_timeout_ms", &self.idle_timeout_ms)
            .field("sweep_interval_ms", &self.sweep_interval_ms)
            .field("max_frame_size", &self.max_frame_size)
            .field("chunk_size", &self.chunk_size)
            .field("window_size", &self.window_size)
            .finish()
    }
}

impl RelayConfig {
    /// Config with the required fields set and defaults everywhere else
    pub fn new(secret: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            port: default_port(),
            control_port: default_control_port(),
            bind_host: default_bind_host(),
            secret: secret.into(),
            base_url: base_url.into(),
            mode: RoutingMode::default(),
            request_timeout_ms: default_request_timeout_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            max_frame_size: default_max_frame_size(),
            chunk_size: default_chunk_size(),
            window_size: default_window_size(),
        }
    }

    /// Check the config and return the parsed base URL
    pub fn validate(&self) -> Result<Url, ConfigError> {
        if self.secret.is_empty() {
            return Err(ConfigError::EmptySecret);
        }

        let base_url = self.parse_base_url()?;

        let timeouts = [
            ("request_timeout_ms", self.request_timeout_ms),
            ("handshake_timeout_ms", self.handshake_timeout_ms),
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("heartbeat_timeout_ms", self.heartbeat_timeout_ms),
            ("idle_timeout_ms", self.idle_timeout_ms),
            ("sweep_interval_ms", self.sweep_interval_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }

        if self.chunk_size == 0 {
            return Err(ConfigError::Zero("chunk_size"));
        }
        if self.chunk_size as u64 > u64::from(self.window_size) {
            return Err(ConfigError::ChunkTooLarge {
                chunk_size: self.chunk_size,
                limit_name: "window_size",
                limit: u64::from(self.window_size),
            });
        }
        if self.chunk_size as u64 > u64::from(self.max_frame_size) {
            return Err(ConfigError::ChunkTooLarge {
                chunk_size: self.chunk_size,
                limit_name: "max_frame_size",
                limit: u64::from(self.max_frame_size),
            });
        }

        Ok(base_url)
    }

    fn parse_base_url(&self) -> Result<Url, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidBaseUrl {
            url: self.base_url.clone(),
            reason,
        };

        let url = Url::parse(&self.base_url).map_err(|e| invalid(e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid(format!("unsupported scheme '{}'", url.scheme())));
        }
        if url.host_str().map_or(true, str::is_empty) {
            return Err(invalid("missing host".to_string()));
        }
        Ok(url)
    }

    pub fn public_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_host, self.port)
    }

    pub fn control_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_host, self.control_port)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Settings for each control connection
    pub fn control_config(&self) -> ControlConfig {
        ControlConfig {
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            heartbeat_timeout: Duration::from_millis(self.heartbeat_timeout_ms),
            max_frame_size: self.max_frame_size,
            chunk_size: self.chunk_size,
            window_size: self.window_size,
            ..ControlConfig::default()
        }
    }
}
