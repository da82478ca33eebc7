//! HTTP ingress server implementation

use burrow_control::{ClientRegistry, RelayError, TunnelResponse};
use burrow_proto::RequestHead;
use burrow_router::PublicRouter;
use bytes::Bytes;
use futures::StreamExt;
use http::header::{HeaderName, HeaderValue, CONNECTION, HOST};
use http::{HeaderMap, Request, Response, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Body, Frame};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Body type of every response the ingress produces
pub type IngressBody = UnsyncBoxBody<Bytes, RelayError>;

/// HTTP server errors
#[derive(Debug, Error)]
pub enum HttpServerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },
}

/// HTTP server configuration
#[derive(Debug, Clone)]
pub struct HttpServerConfig {
    pub bind_addr: SocketAddr,
    /// Deadline for a whole tunneled exchange, response body included
    pub request_timeout: Duration,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Headers that describe a single connection and are never forwarded
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "transfer-encoding",
    "upgrade",
    "te",
    "trailer",
];

fn is_hop_by_hop(name: &str, connection_tokens: &[String]) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name)
        || name.starts_with("proxy-")
        || connection_tokens.iter().any(|token| token == name)
}

/// Header names listed in `Connection`, which are hop-by-hop as well
fn connection_tokens(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect()
}

/// End-to-end request headers, in order, as strings
fn forwarded_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    let tokens = connection_tokens(headers);
    headers
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name.as_str(), &tokens))
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

fn error_response(status: StatusCode, message: impl fmt::Display) -> Response<IngressBody> {
    let body = Full::new(Bytes::from(format!("{}\n", message)))
        .map_err(|never: Infallible| match never {})
        .boxed_unsync();

    let mut response = Response::new(body);
    *response.status_mut() = status;
    response.headers_mut().insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

fn relay_error_response(error: &RelayError) -> Response<IngressBody> {
    let status = StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::BAD_GATEWAY);
    error_response(status, error)
}

/// Turn a tunneled response into a hyper response with a streaming body
fn into_http_response(response: TunnelResponse) -> Response<IngressBody> {
    let TunnelResponse { head, body } = response;

    let status = match StatusCode::from_u16(head.status) {
        Ok(status) => status,
        Err(_) => {
            warn!("Tunnel client sent invalid status {}", head.status);
            return error_response(StatusCode::BAD_GATEWAY, "Invalid response from tunnel client");
        }
    };

    let mut headers = HeaderMap::new();
    for (name, value) in &head.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => warn!("Dropping invalid response header {:?}", name),
        }
    }

    let tokens = connection_tokens(&headers);
    let hop_by_hop: Vec<HeaderName> = headers
        .keys()
        .filter(|name| is_hop_by_hop(name.as_str(), &tokens))
        .cloned()
        .collect();
    for name in hop_by_hop {
        headers.remove(name);
    }

    let body = StreamBody::new(body.map(|chunk| chunk.map(Frame::data))).boxed_unsync();

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// Routes public requests onto tunnel clients
pub struct PublicIngress {
    registry: Arc<ClientRegistry>,
    router: Arc<PublicRouter>,
    request_timeout: Duration,
}

impl PublicIngress {
    pub fn new(registry: Arc<ClientRegistry>, router: Arc<PublicRouter>, request_timeout: Duration) -> Self {
        Self {
            registry,
            router,
            request_timeout,
        }
    }

    /// Forward one public request and produce the response for the caller
    pub async fn handle<B>(&self, req: Request<B>) -> Response<IngressBody>
    where
        B: Body<Data = Bytes> + Send + Unpin + 'static,
        B::Error: fmt::Display + Send + 'static,
    {
        let host = req
            .headers()
            .get(HOST)
            .and_then(|value| value.to_str().ok())
            .or_else(|| req.uri().host())
            .map(str::to_string);

        let route = match self
            .router
            .resolve(host.as_deref(), req.uri().path(), req.uri().query())
        {
            Ok(route) => route,
            Err(e) => {
                debug!("Rejecting {} {}: {}", req.method(), req.uri(), e);
                return error_response(StatusCode::BAD_REQUEST, e);
            }
        };

        let client = match self.registry.lookup(&route.client_id) {
            Some(client) => client,
            None => {
                debug!("No tunnel client registered as {}", route.client_id);
                return relay_error_response(&RelayError::UpstreamUnavailable(route.client_id));
            }
        };

        let head = RequestHead {
            method: req.method().to_string(),
            path: route.path,
            query: route.query,
            headers: forwarded_headers(req.headers()),
        };

        debug!(
            "Forwarding {} {} to client {}",
            head.method,
            head.uri(),
            client.id()
        );

        let body = req.into_body().into_data_stream();
        let deadline = tokio::time::Instant::now() + self.request_timeout;

        match client.multiplexer().send(head, body, deadline).await {
            Ok(response) => into_http_response(response),
            Err(e) => {
                debug!("Request to client {} failed: {}", client.id(), e);
                relay_error_response(&e)
            }
        }
    }
}

/// Public HTTP server
pub struct HttpServer {
    config: HttpServerConfig,
    ingress: Arc<PublicIngress>,
}

impl HttpServer {
    pub fn new(config: HttpServerConfig, registry: Arc<ClientRegistry>, router: Arc<PublicRouter>) -> Self {
        let ingress = Arc::new(PublicIngress::new(registry, router, config.request_timeout));
        Self { config, ingress }
    }

    /// Bind the listener without accepting yet
    pub async fn bind(&self) -> Result<TcpListener, HttpServerError> {
        TcpListener::bind(self.config.bind_addr).await.map_err(|e| {
            let port = self.config.bind_addr.port();
            let address = self.config.bind_addr.ip().to_string();
            let reason = e.to_string();
            HttpServerError::BindError {
                address,
                port,
                reason,
            }
        })
    }

    /// Bind and serve until the process exits
    pub async fn start(&self) -> Result<(), HttpServerError> {
        let listener = self.bind().await?;
        self.serve(listener, CancellationToken::new()).await
    }

    /// Accept connections on `listener` until `shutdown` is cancelled
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<(), HttpServerError> {
        let local_addr = listener.local_addr()?;
        info!("HTTP ingress listening on {}", local_addr);

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((socket, peer_addr)) => {
                    debug!("Accepted HTTP connection from {}", peer_addr);
                    let ingress = self.ingress.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        Self::serve_connection(socket, peer_addr, ingress, shutdown).await;
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }

        info!("HTTP ingress on {} stopped", local_addr);
        Ok(())
    }

    async fn serve_connection(
        socket: tokio::net::TcpStream,
        peer_addr: SocketAddr,
        ingress: Arc<PublicIngress>,
        shutdown: CancellationToken,
    ) {
        let service = service_fn(move |req| {
            let ingress = ingress.clone();
            async move { Ok::<_, Infallible>(ingress.handle(req).await) }
        });

        let connection = http1::Builder::new().serve_connection(TokioIo::new(socket), service);
        tokio::pin!(connection);

        tokio::select! {
            result = connection.as_mut() => {
                if let Err(e) = result {
                    debug!("HTTP connection from {} ended with error: {}", peer_addr, e);
                }
            }
            _ = shutdown.cancelled() => {
                debug!("Closing HTTP connection from {} on shutdown", peer_addr);
            }
        }
    }
}
