//! Client id extraction from public HTTP requests

use crate::{RoutingMode, TUNNEL_PATH_SEGMENT};
use burrow_auth::{validate_client_id, ClientIdError};
use thiserror::Error;
use tracing::trace;
use url::Url;

/// Routing errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("Invalid base URL: {0}")]
    InvalidBaseUrl(String),

    #[error("Host header not found")]
    HostHeaderNotFound,

    #[error("Host '{0}' is not a tunnel host")]
    NotTunnelHost(String),

    #[error("Path '{0}' is not a tunnel path")]
    NotTunnelPath(String),

    #[error("Missing client id")]
    MissingClientId,

    #[error("Invalid client id: {0}")]
    InvalidClientId(#[from] ClientIdError),
}

/// Result of routing a public request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRoute {
    pub client_id: String,
    /// Path to forward to the client's local service
    pub path: String,
    pub query: Option<String>,
}

/// Router for the public ingress
#[derive(Debug, Clone)]
pub struct PublicRouter {
    mode: RoutingMode,
    scheme: String,
    /// Lowercased host of the base URL, without port
    base_host: String,
    port: Option<u16>,
    /// Base URL path without trailing slash ("" for the root)
    base_path: String,
}

impl PublicRouter {
    pub fn new(mode: RoutingMode, base_url: &Url) -> Result<Self, RouteError> {
        match base_url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(RouteError::InvalidBaseUrl(format!(
                    "unsupported scheme '{}'",
                    other
                )))
            }
        }

        let base_host = base_url
            .host_str()
            .ok_or_else(|| RouteError::InvalidBaseUrl(format!("'{}' has no host", base_url)))?
            .to_ascii_lowercase();

        Ok(Self {
            mode,
            scheme: base_url.scheme().to_string(),
            base_host,
            port: base_url.port(),
            base_path: base_url.path().trim_end_matches('/').to_string(),
        })
    }

    pub fn mode(&self) -> RoutingMode {
        self.mode
    }

    /// Public URL at which the client with `client_id` is reachable
    pub fn public_url(&self, client_id: &str) -> String {
        let port = self.port.map(|p| format!(":{}", p)).unwrap_or_default();

        match self.mode {
            RoutingMode::Subpath => format!(
                "{}://{}{}{}/{}/{}",
                self.scheme, self.base_host, port, self.base_path, TUNNEL_PATH_SEGMENT, client_id
            ),
            RoutingMode::Subdomain => format!(
                "{}://{}.{}{}{}",
                self.scheme, client_id, self.base_host, port, self.base_path
            ),
        }
    }

    /// Extract the client id and the forwarded path from a public request
    pub fn resolve(
        &self,
        host: Option<&str>,
        path: &str,
        query: Option<&str>,
    ) -> Result<ResolvedRoute, RouteError> {
        trace!("Resolving route for host={:?} path={}", host, path);

        let (client_id, path) = match self.mode {
            RoutingMode::Subpath => self.resolve_subpath(path)?,
            RoutingMode::Subdomain => {
                let host = host.ok_or(RouteError::HostHeaderNotFound)?;
                (self.resolve_subdomain(host)?, path.to_string())
            }
        };

        validate_client_id(&client_id)?;

        Ok(ResolvedRoute {
            client_id,
            path,
            query: query.map(str::to_string),
        })
    }

    fn resolve_subpath(&self, path: &str) -> Result<(String, String), RouteError> {
        let rest = path
            .strip_prefix(self.base_path.as_str())
            .and_then(|p| p.strip_prefix('/'))
            .and_then(|p| p.strip_prefix(TUNNEL_PATH_SEGMENT))
            .ok_or_else(|| RouteError::NotTunnelPath(path.to_string()))?;

        let rest = match rest {
            "" => return Err(RouteError::MissingClientId),
            r => r
                .strip_prefix('/')
                .ok_or_else(|| RouteError::NotTunnelPath(path.to_string()))?,
        };

        let (client_id, forwarded) = match rest.split_once('/') {
            Some((id, tail)) => (id, format!("/{}", tail)),
            None => (rest, "/".to_string()),
        };

        if client_id.is_empty() {
            return Err(RouteError::MissingClientId);
        }

        Ok((client_id.to_string(), forwarded))
    }

    fn resolve_subdomain(&self, host: &str) -> Result<String, RouteError> {
        let normalized = normalize_host(host).to_ascii_lowercase();

        let label = normalized
            .strip_suffix(self.base_host.as_str())
            .and_then(|h| h.strip_suffix('.'))
            .ok_or_else(|| RouteError::NotTunnelHost(host.to_string()))?;

        if label.is_empty() {
            return Err(RouteError::MissingClientId);
        }

        // Only the leftmost label names the client
        if label.contains('.') {
            return Err(RouteError::NotTunnelHost(host.to_string()));
        }

        Ok(label.to_string())
    }
}

/// Remove the port from a host header value (e.g. "example.com:8080" -> "example.com")
fn normalize_host(host: &str) -> &str {
    match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}
