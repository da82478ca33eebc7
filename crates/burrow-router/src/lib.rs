//! Public request routing
//!
//! Maps an incoming public HTTP request onto the id of the tunnel client that
//! should serve it, either from a `/tunnel/{id}/...` path prefix or from the
//! leftmost label of the `Host` header.

pub mod http;

pub use http::{PublicRouter, ResolvedRoute, RouteError};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Path segment that introduces the client id in subpath mode
pub const TUNNEL_PATH_SEGMENT: &str = "tunnel";

/// How public requests are mapped to clients
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingMode {
    /// `{base_url}/tunnel/{id}/{rest}`
    #[default]
    Subpath,
    /// `{id}.{base_host}/{path}`
    Subdomain,
}

impl fmt::Display for RoutingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutingMode::Subpath => write!(f, "subpath"),
            RoutingMode::Subdomain => write!(f, "subdomain"),
        }
    }
}

impl FromStr for RoutingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "subpath" => Ok(RoutingMode::Subpath),
            "subdomain" => Ok(RoutingMode::Subdomain),
            other => Err(format!(
                "unknown routing mode '{}', expected 'subpath' or 'subdomain'",
                other
            )),
        }
    }
}
