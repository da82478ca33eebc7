//! Control connection handler
//!
//! Drives one control connection from handshake to teardown: authenticates
//! the client, registers it, pumps inbound frames into its multiplexer and
//! keeps the connection alive with heartbeats.

use crate::connection::TunnelClient;
use crate::error::{ControlError, RelayError};
use crate::events::{NoopEvents, RelayEvents};
use crate::multiplexer::{MultiplexerConfig, RequestMultiplexer};
use crate::outbound::{run_writer, OutboundQueue};
use crate::registry::ClientRegistry;
use burrow_auth::{generate_client_id, validate_client_id, SharedSecret};
use burrow_proto::{CodecError, ControlCodec, ControlMessage, Handshake, PROTOCOL_VERSION};
use burrow_router::PublicRouter;
use futures::future::{Fuse, FusedFuture};
use futures::{FutureExt, SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Control connection settings
#[derive(Debug, Clone)]
pub struct ControlConfig {
    pub handshake_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub max_frame_size: u32,
    pub chunk_size: usize,
    pub window_size: u32,
    /// Request frames buffered per connection before body pumps wait
    pub outbound_queue_capacity: usize,
}

impl Default for ControlConfig {
    fn default() -> Self {
        let multiplexer = MultiplexerConfig::default();
        Self {
            handshake_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(5),
            max_frame_size: burrow_proto::DEFAULT_MAX_FRAME_SIZE,
            chunk_size: multiplexer.chunk_size,
            window_size: multiplexer.window_size,
            outbound_queue_capacity: 64,
        }
    }
}

impl ControlConfig {
    fn multiplexer_config(&self) -> MultiplexerConfig {
        MultiplexerConfig {
            chunk_size: self.chunk_size,
            window_size: self.window_size,
        }
    }
}

/// Handles control connections from tunnel clients
pub struct ControlHandler {
    registry: Arc<ClientRegistry>,
    router: Arc<PublicRouter>,
    secret: SharedSecret,
    events: Arc<dyn RelayEvents>,
    config: ControlConfig,
    shutdown: CancellationToken,
}

impl ControlHandler {
    pub fn new(registry: Arc<ClientRegistry>, router: Arc<PublicRouter>, secret: SharedSecret) -> Self {
        Self {
            registry,
            router,
            secret,
            events: Arc::new(NoopEvents),
            config: ControlConfig::default(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn RelayEvents>) -> Self {
        self.events = events;
        self
    }

    pub fn with_config(mut self, config: ControlConfig) -> Self {
        self.config = config;
        self
    }

    /// Relay-wide shutdown; cancelling it closes every control connection
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Handle one control connection until it closes
    pub async fn handle_connection<S>(&self, stream: S, peer_addr: SocketAddr) -> Result<(), ControlError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        debug!("New control connection from {}", peer_addr);

        let codec = ControlCodec::with_max_frame_size(self.config.max_frame_size);
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = FramedRead::new(read_half, codec.clone());
        let mut writer = FramedWrite::new(write_half, codec);

        let handshake = self.read_handshake(&mut reader, peer_addr).await?;

        if !self.secret.verify(&handshake.secret) {
            // No protocol exchange on a bad secret
            warn!("Authentication failed for control connection from {}", peer_addr);
            return Err(ControlError::Auth);
        }

        if handshake.protocol_version != PROTOCOL_VERSION {
            let reason = format!(
                "unsupported protocol version {} (expected {})",
                handshake.protocol_version, PROTOCOL_VERSION
            );
            warn!("Rejecting client from {}: {}", peer_addr, reason);
            reject(&mut writer, &reason).await;
            return Err(ControlError::Handshake(reason));
        }

        let client_id = match handshake.client_id {
            Some(id) => {
                if let Err(e) = validate_client_id(&id) {
                    let reason = format!("invalid client id '{}': {}", id, e);
                    warn!("Rejecting client from {}: {}", peer_addr, reason);
                    reject(&mut writer, &reason).await;
                    return Err(ControlError::Handshake(reason));
                }
                id
            }
            None => self.generate_unused_id(),
        };

        let (outbound, outbound_rx) = OutboundQueue::channel(self.config.outbound_queue_capacity);
        let multiplexer = Arc::new(RequestMultiplexer::new(
            client_id.clone(),
            outbound.clone(),
            self.config.multiplexer_config(),
        ));
        let client = Arc::new(TunnelClient::new(
            client_id.clone(),
            peer_addr,
            multiplexer,
            self.shutdown.child_token(),
        ));

        // Registered before Opened goes out, so a request sent right after the
        // client learns its URL finds it. Frames queued meanwhile wait for the writer.
        if let Some(previous) = self.registry.register(client_id.clone(), client.clone()) {
            info!(
                "Client {} reconnected from {}, replacing connection {} from {}",
                client_id,
                peer_addr,
                previous.connection_id(),
                previous.peer_addr()
            );
            previous.evict("replaced by a new connection");
            if previous.mark_disconnected() {
                self.events.on_client_disconnect(&client_id);
            }
        }

        let public_url = self.router.public_url(&client_id);
        if let Err(e) = writer
            .send(ControlMessage::Opened {
                client_id: client_id.clone(),
                public_url: public_url.clone(),
            })
            .await
        {
            error!("Failed to send Opened to client {}: {}", client_id, e);
            client.mark_disconnected();
            self.teardown(&client);
            return Err(e.into());
        }

        info!(
            "Client {} connected from {} ({}) at {}",
            client_id,
            peer_addr,
            client.connection_id(),
            public_url
        );
        self.events.on_client_connect(&client_id);

        let mut writer_task =
            tokio::spawn(run_writer(writer, outbound_rx, client.shutdown_token())).fuse();

        let result = self
            .run_session(&client, &mut reader, &outbound, &mut writer_task)
            .await;

        self.teardown(&client);
        if !writer_task.is_terminated() {
            match writer_task.await {
                Ok(Err(e)) => debug!("Writer for client {} stopped: {}", client_id, e),
                Err(e) => error!("Writer task for client {} failed: {}", client_id, e),
                Ok(Ok(())) => {}
            }
        }

        if client.mark_disconnected() {
            self.events.on_client_disconnect(&client_id);
        }

        match &result {
            Ok(()) => info!("Client {} disconnected", client_id),
            Err(e) => info!("Client {} disconnected: {}", client_id, e),
        }

        result
    }

    async fn read_handshake<R>(
        &self,
        reader: &mut FramedRead<R, ControlCodec>,
        peer_addr: SocketAddr,
    ) -> Result<Handshake, ControlError>
    where
        R: AsyncRead + Unpin,
    {
        let first = tokio::time::timeout(self.config.handshake_timeout, reader.next())
            .await
            .map_err(|_| {
                warn!("Handshake from {} timed out", peer_addr);
                ControlError::Handshake(format!(
                    "no Open frame within {:?}",
                    self.config.handshake_timeout
                ))
            })?;

        match first {
            Some(Ok(ControlMessage::Open(handshake))) => Ok(handshake),
            Some(Ok(other)) => {
                warn!(
                    "Expected Open from {}, got {} frame",
                    peer_addr,
                    other.kind()
                );
                Err(ControlError::Protocol(format!(
                    "expected Open, got {}",
                    other.kind()
                )))
            }
            Some(Err(e)) => {
                warn!("Invalid handshake frame from {}: {}", peer_addr, e);
                Err(e.into())
            }
            None => Err(ControlError::Handshake(
                "connection closed before handshake".to_string(),
            )),
        }
    }

    fn generate_unused_id(&self) -> String {
        loop {
            let id = generate_client_id();
            if self.registry.lookup(&id).is_none() {
                return id;
            }
        }
    }

    /// Read loop with heartbeat, until the connection ends
    async fn run_session<R>(
        &self,
        client: &TunnelClient,
        reader: &mut FramedRead<R, ControlCodec>,
        outbound: &OutboundQueue,
        writer: &mut Fuse<JoinHandle<Result<(), CodecError>>>,
    ) -> Result<(), ControlError>
    where
        R: AsyncRead + Unpin,
    {
        let shutdown = client.shutdown_token();
        let heartbeat_interval = self.config.heartbeat_interval;
        let heartbeat_timeout = self.config.heartbeat_timeout;

        let mut interval = tokio::time::interval_at(
            tokio::time::Instant::now() + heartbeat_interval,
            heartbeat_interval,
        );
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut waiting_for_pong = false;
        let mut pong_deadline = tokio::time::Instant::now();

        loop {
            tokio::select! {
                joined = &mut *writer => {
                    return Err(writer_exit(client.id(), joined));
                }

                _ = shutdown.cancelled() => {
                    return Err(ControlError::Evicted);
                }

                _ = interval.tick(), if !waiting_for_pong => {
                    let timestamp = chrono::Utc::now().timestamp_millis() as u64;
                    debug!("Sending ping to client {}", client.id());
                    outbound.send_control(ControlMessage::Ping { timestamp });

                    waiting_for_pong = true;
                    pong_deadline = tokio::time::Instant::now() + heartbeat_timeout;
                }

                _ = tokio::time::sleep_until(pong_deadline), if waiting_for_pong => {
                    warn!(
                        "Pong timeout for client {} (no response in {:?}), assuming disconnected",
                        client.id(),
                        heartbeat_timeout
                    );
                    return Err(ControlError::HeartbeatTimeout(heartbeat_timeout));
                }

                frame = reader.next() => {
                    match frame {
                        None => {
                            debug!("Control connection closed by client {}", client.id());
                            return Ok(());
                        }
                        Some(Err(e)) => {
                            warn!("Protocol error from client {}: {}", client.id(), e);
                            return Err(e.into());
                        }
                        Some(Ok(message)) => {
                            client.touch();
                            if let ControlMessage::Pong { .. } = message {
                                debug!("Received pong from client {}", client.id());
                                waiting_for_pong = false;
                                continue;
                            }
                            handle_message(client, message, outbound)?;
                        }
                    }
                }
            }
        }
    }

    /// Unregister the client (if it is still the registered connection) and
    /// fail everything in flight
    fn teardown(&self, client: &Arc<TunnelClient>) {
        self.registry.unregister(client.id(), client);
        client.multiplexer().fail_all(RelayError::ConnectionClosed);
        client.shutdown_token().cancel();
    }
}

/// Why the session ends when its writer task stops first
fn writer_exit(client_id: &str, joined: Result<Result<(), CodecError>, JoinError>) -> ControlError {
    match joined {
        Ok(Err(e)) => {
            warn!("Failed to write to client {}: {}", client_id, e);
            e.into()
        }
        Ok(Ok(())) => ControlError::Evicted,
        Err(e) => {
            error!("Writer task for client {} failed: {}", client_id, e);
            ControlError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
        }
    }
}

fn handle_message(
    client: &TunnelClient,
    message: ControlMessage,
    outbound: &OutboundQueue,
) -> Result<(), ControlError> {
    match message {
        ControlMessage::Ping { timestamp } => {
            outbound.send_pong(timestamp);
            Ok(())
        }
        ControlMessage::Error {
            correlation_id: burrow_proto::CONNECTION_CORRELATION_ID,
            message,
        } => Err(ControlError::Protocol(format!(
            "client reported error: {}",
            message
        ))),
        message @ (ControlMessage::ResponseHead { .. }
        | ControlMessage::ResponseChunk { .. }
        | ControlMessage::ResponseEnd { .. }
        | ControlMessage::Error { .. }
        | ControlMessage::Cancel { .. }
        | ControlMessage::WindowUpdate { .. }) => {
            client.multiplexer().dispatch(message);
            Ok(())
        }
        other => {
            warn!(
                "Unexpected {} frame from client {}",
                other.kind(),
                client.id()
            );
            Err(ControlError::Protocol(format!(
                "unexpected {} frame from client",
                other.kind()
            )))
        }
    }
}

/// Tell the client why the handshake failed, then close
async fn reject<W>(writer: &mut FramedWrite<W, ControlCodec>, reason: &str)
where
    W: AsyncWrite + Unpin,
{
    let message = ControlMessage::Error {
        correlation_id: burrow_proto::CONNECTION_CORRELATION_ID,
        message: reason.to_string(),
    };
    if let Err(e) = writer.send(message).await {
        debug!("Failed to send handshake rejection: {}", e);
    }
    let _ = writer.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ChannelEvents, RelayEvent};
    use burrow_proto::{RequestHead, ResponseHead};
    use burrow_router::RoutingMode;
    use bytes::Bytes;
    use futures::stream;
    use std::convert::Infallible;
    use std::io;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::task::{Context, Poll};
    use tokio::io::{DuplexStream, ReadBuf};
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;

    type ClientSide = (
        FramedRead<tokio::io::ReadHalf<DuplexStream>, ControlCodec>,
        FramedWrite<tokio::io::WriteHalf<DuplexStream>, ControlCodec>,
    );

    struct Harness {
        handler: Arc<ControlHandler>,
        registry: Arc<ClientRegistry>,
        events: mpsc::UnboundedReceiver<RelayEvent>,
    }

    fn harness(config: ControlConfig) -> Harness {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();

        let registry = Arc::new(ClientRegistry::new());
        let base = url::Url::parse("http://relay.test:8080").unwrap();
        let router = Arc::new(PublicRouter::new(RoutingMode::Subpath, &base).unwrap());
        let (events, rx) = ChannelEvents::new();

        let handler = ControlHandler::new(registry.clone(), router, SharedSecret::from("s3cret"))
            .with_events(Arc::new(events))
            .with_config(config);

        Harness {
            handler: Arc::new(handler),
            registry,
            events: rx,
        }
    }

    fn connect(handler: &Arc<ControlHandler>) -> (ClientSide, JoinHandle<Result<(), ControlError>>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let handler = handler.clone();
        let task = tokio::spawn(async move {
            handler
                .handle_connection(server, "127.0.0.1:40000".parse().unwrap())
                .await
        });

        let (read_half, write_half) = tokio::io::split(client);
        (
            (
                FramedRead::new(read_half, ControlCodec::new()),
                FramedWrite::new(write_half, ControlCodec::new()),
            ),
            task,
        )
    }

    /// Relay end of a duplex whose writes fail once `broken` is set
    struct BreakableStream {
        inner: DuplexStream,
        broken: Arc<AtomicBool>,
    }

    impl AsyncRead for BreakableStream {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for BreakableStream {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            if self.broken.load(Ordering::SeqCst) {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "peer went away",
                )));
            }
            Pin::new(&mut self.inner).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }

    async fn open(client: &mut ClientSide, handshake: Handshake) -> ControlMessage {
        client.1.send(ControlMessage::Open(handshake)).await.unwrap();
        client.0.next().await.unwrap().unwrap()
    }

    fn opened_id(message: ControlMessage) -> String {
        match message {
            ControlMessage::Opened { client_id, .. } => client_id,
            other => panic!("Expected Opened, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handshake_assigns_id() {
        let mut h = harness(ControlConfig::default());
        let (mut client, task) = connect(&h.handler);

        let reply = open(&mut client, Handshake::new("s3cret")).await;
        let (client_id, public_url) = match reply {
            ControlMessage::Opened {
                client_id,
                public_url,
            } => (client_id, public_url),
            other => panic!("Expected Opened, got {:?}", other),
        };

        assert_eq!(client_id.len(), burrow_auth::CLIENT_ID_LENGTH);
        assert_eq!(public_url, format!("http://relay.test:8080/tunnel/{}", client_id));
        assert!(h.registry.lookup(&client_id).is_some());
        assert_eq!(
            h.events.recv().await,
            Some(RelayEvent::ClientConnected {
                client_id: client_id.clone()
            })
        );

        drop(client);
        assert!(task.await.unwrap().is_ok());
        assert!(h.registry.lookup(&client_id).is_none());
        assert_eq!(
            h.events.recv().await,
            Some(RelayEvent::ClientDisconnected { client_id })
        );
    }

    #[tokio::test]
    async fn test_handshake_with_requested_id() {
        let h = harness(ControlConfig::default());
        let (mut client, _task) = connect(&h.handler);

        let reply = open(&mut client, Handshake::new("s3cret").with_client_id("myapp")).await;
        assert_eq!(opened_id(reply), "myapp");
        assert!(h.registry.lookup("myapp").is_some());
    }

    #[tokio::test]
    async fn test_bad_secret_closes_silently() {
        let h = harness(ControlConfig::default());
        let (mut client, task) = connect(&h.handler);

        client
            .1
            .send(ControlMessage::Open(Handshake::new("wrong")))
            .await
            .unwrap();

        // No reply, just EOF
        assert!(client.0.next().await.is_none());
        assert!(matches!(task.await.unwrap(), Err(ControlError::Auth)));
        assert!(h.registry.is_empty());
    }

    #[tokio::test]
    async fn test_protocol_version_mismatch() {
        let h = harness(ControlConfig::default());
        let (mut client, task) = connect(&h.handler);

        let mut handshake = Handshake::new("s3cret");
        handshake.protocol_version = PROTOCOL_VERSION + 1;
        let reply = open(&mut client, handshake).await;

        assert!(matches!(
            reply,
            ControlMessage::Error {
                correlation_id: 0,
                ..
            }
        ));
        assert!(matches!(
            task.await.unwrap(),
            Err(ControlError::Handshake(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_requested_id() {
        let h = harness(ControlConfig::default());
        let (mut client, task) = connect(&h.handler);

        let reply = open(&mut client, Handshake::new("s3cret").with_client_id("Not Valid")).await;

        match reply {
            ControlMessage::Error { message, .. } => assert!(message.contains("invalid client id")),
            other => panic!("Expected Error, got {:?}", other),
        }
        assert!(task.await.unwrap().is_err());
        assert!(h.registry.is_empty());
    }

    #[tokio::test]
    async fn test_first_frame_must_be_open() {
        let h = harness(ControlConfig::default());
        let (mut client, task) = connect(&h.handler);

        client
            .1
            .send(ControlMessage::Ping { timestamp: 1 })
            .await
            .unwrap();

        assert!(matches!(
            task.await.unwrap(),
            Err(ControlError::Protocol(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout() {
        let h = harness(ControlConfig::default());
        let (_client, task) = connect(&h.handler);

        assert!(matches!(
            task.await.unwrap(),
            Err(ControlError::Handshake(_))
        ));
    }

    #[tokio::test]
    async fn test_request_roundtrip_over_connection() {
        let h = harness(ControlConfig::default());
        let (mut client, _task) = connect(&h.handler);
        let client_id = opened_id(open(&mut client, Handshake::new("s3cret")).await);

        let tunnel = h.registry.lookup(&client_id).unwrap();
        let multiplexer = tunnel.multiplexer().clone();
        let request = tokio::spawn(async move {
            let head = RequestHead {
                method: "GET".to_string(),
                path: "/hello".to_string(),
                query: None,
                headers: vec![],
            };
            let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
            let response = multiplexer
                .send(head, stream::empty::<Result<Bytes, Infallible>>(), deadline)
                .await
                .unwrap();
            let mut body = Vec::new();
            let mut stream = response.body;
            while let Some(chunk) = stream.next().await {
                body.extend_from_slice(&chunk.unwrap());
            }
            (response.head.status, body)
        });

        // Play the tunnel client
        let correlation_id = match client.0.next().await.unwrap().unwrap() {
            ControlMessage::RequestHead {
                correlation_id,
                head,
            } => {
                assert_eq!(head.path, "/hello");
                correlation_id
            }
            other => panic!("Expected RequestHead, got {:?}", other),
        };
        assert_eq!(
            client.0.next().await.unwrap().unwrap(),
            ControlMessage::RequestEnd { correlation_id }
        );

        client
            .1
            .send(ControlMessage::ResponseHead {
                correlation_id,
                head: ResponseHead {
                    status: 200,
                    headers: vec![],
                },
            })
            .await
            .unwrap();
        client
            .1
            .send(ControlMessage::ResponseChunk {
                correlation_id,
                data: Bytes::from_static(b"world"),
            })
            .await
            .unwrap();
        client
            .1
            .send(ControlMessage::ResponseEnd { correlation_id })
            .await
            .unwrap();

        let (status, body) = request.await.unwrap();
        assert_eq!(status, 200);
        assert_eq!(body, b"world");
    }

    #[tokio::test]
    async fn test_client_ping_gets_pong() {
        let h = harness(ControlConfig::default());
        let (mut client, _task) = connect(&h.handler);
        open(&mut client, Handshake::new("s3cret")).await;

        client
            .1
            .send(ControlMessage::Ping { timestamp: 1234 })
            .await
            .unwrap();
        assert_eq!(
            client.0.next().await.unwrap().unwrap(),
            ControlMessage::Pong { timestamp: 1234 }
        );
    }

    #[tokio::test]
    async fn test_write_failure_ends_session_with_io_error() {
        let h = harness(ControlConfig::default());
        let (client, server) = tokio::io::duplex(64 * 1024);
        let broken = Arc::new(AtomicBool::new(false));
        let stream = BreakableStream {
            inner: server,
            broken: broken.clone(),
        };

        let handler = h.handler.clone();
        let task = tokio::spawn(async move {
            handler
                .handle_connection(stream, "127.0.0.1:40000".parse().unwrap())
                .await
        });

        let (read_half, write_half) = tokio::io::split(client);
        let mut client = (
            FramedRead::new(read_half, ControlCodec::new()),
            FramedWrite::new(write_half, ControlCodec::new()),
        );
        let id = opened_id(open(&mut client, Handshake::new("s3cret")).await);

        // The pong for this ping is the first write that fails
        broken.store(true, Ordering::SeqCst);
        client
            .1
            .send(ControlMessage::Ping { timestamp: 7 })
            .await
            .unwrap();

        let result = task.await.unwrap();
        assert!(
            matches!(&result, Err(ControlError::Io(e)) if e.kind() == io::ErrorKind::BrokenPipe),
            "expected a broken pipe, got {:?}",
            result
        );
        assert!(h.registry.lookup(&id).is_none());
    }

    #[tokio::test]
    async fn test_ping_flood_gets_coalesced_pongs() {
        let h = harness(ControlConfig::default());
        let (mut client, task) = connect(&h.handler);
        open(&mut client, Handshake::new("s3cret")).await;

        for timestamp in 0..1000 {
            client
                .1
                .send(ControlMessage::Ping { timestamp })
                .await
                .unwrap();
        }

        // Every pong that was written answers one of our pings, in order
        let mut last = None;
        let mut pongs = 0;
        while let Ok(Some(Ok(frame))) =
            tokio::time::timeout(Duration::from_millis(200), client.0.next()).await
        {
            match frame {
                ControlMessage::Pong { timestamp } => {
                    assert!(timestamp < 1000);
                    assert!(last.map_or(true, |prev| timestamp > prev));
                    last = Some(timestamp);
                    pongs += 1;
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert!(pongs >= 1 && pongs <= 1000);
        assert!(!task.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_timeout() {
        let config = ControlConfig {
            heartbeat_interval: Duration::from_secs(1),
            heartbeat_timeout: Duration::from_millis(500),
            ..ControlConfig::default()
        };
        let mut h = harness(config);
        let (mut client, task) = connect(&h.handler);
        let client_id = opened_id(open(&mut client, Handshake::new("s3cret")).await);

        // Relay pings; this client never answers
        assert!(matches!(
            client.0.next().await.unwrap().unwrap(),
            ControlMessage::Ping { .. }
        ));

        assert!(matches!(
            task.await.unwrap(),
            Err(ControlError::HeartbeatTimeout(_))
        ));
        assert!(h.registry.lookup(&client_id).is_none());

        let _ = h.events.recv().await;
        assert_eq!(
            h.events.recv().await,
            Some(RelayEvent::ClientDisconnected { client_id })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_answered_keeps_connection() {
        let config = ControlConfig {
            heartbeat_interval: Duration::from_secs(1),
            heartbeat_timeout: Duration::from_millis(500),
            ..ControlConfig::default()
        };
        let h = harness(config);
        let (mut client, task) = connect(&h.handler);
        let client_id = opened_id(open(&mut client, Handshake::new("s3cret")).await);

        for _ in 0..3 {
            match client.0.next().await.unwrap().unwrap() {
                ControlMessage::Ping { timestamp } => client
                    .1
                    .send(ControlMessage::Pong { timestamp })
                    .await
                    .unwrap(),
                other => panic!("Expected Ping, got {:?}", other),
            }
        }

        assert!(!task.is_finished());
        assert!(h.registry.lookup(&client_id).is_some());
    }

    #[tokio::test]
    async fn test_relay_only_frame_is_protocol_error() {
        let h = harness(ControlConfig::default());
        let (mut client, task) = connect(&h.handler);
        let client_id = opened_id(open(&mut client, Handshake::new("s3cret")).await);

        client
            .1
            .send(ControlMessage::RequestEnd { correlation_id: 1 })
            .await
            .unwrap();

        assert!(matches!(
            task.await.unwrap(),
            Err(ControlError::Protocol(_))
        ));
        assert!(h.registry.lookup(&client_id).is_none());
    }

    #[tokio::test]
    async fn test_reconnect_replaces_connection() {
        let mut h = harness(ControlConfig::default());

        let (mut first, first_task) = connect(&h.handler);
        opened_id(open(&mut first, Handshake::new("s3cret").with_client_id("myapp")).await);
        let old = h.registry.lookup("myapp").unwrap();

        // Leave a request in flight on the first connection
        let multiplexer = old.multiplexer().clone();
        let in_flight = tokio::spawn(async move {
            let head = RequestHead {
                method: "GET".to_string(),
                path: "/".to_string(),
                query: None,
                headers: vec![],
            };
            let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
            multiplexer
                .send(head, stream::empty::<Result<Bytes, Infallible>>(), deadline)
                .await
        });
        assert!(matches!(
            first.0.next().await.unwrap().unwrap(),
            ControlMessage::RequestHead { .. }
        ));

        let (mut second, _second_task) = connect(&h.handler);
        opened_id(open(&mut second, Handshake::new("s3cret").with_client_id("myapp")).await);

        let current = h.registry.lookup("myapp").unwrap();
        assert!(!Arc::ptr_eq(&old, &current));

        assert_eq!(
            in_flight.await.unwrap().unwrap_err(),
            RelayError::ConnectionClosed
        );
        assert!(matches!(
            first_task.await.unwrap(),
            Err(ControlError::Evicted)
        ));

        // Old connection's teardown must not remove the new registration
        assert!(Arc::ptr_eq(&h.registry.lookup("myapp").unwrap(), &current));

        let mut seen = Vec::new();
        while let Ok(event) = h.events.try_recv() {
            seen.push(event);
        }
        let disconnects = seen
            .iter()
            .filter(|e| matches!(e, RelayEvent::ClientDisconnected { .. }))
            .count();
        assert_eq!(disconnects, 1);
        assert_eq!(
            seen.iter()
                .filter(|e| matches!(e, RelayEvent::ClientConnected { .. }))
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn test_disconnect_fails_in_flight_requests() {
        let h = harness(ControlConfig::default());
        let (mut client, task) = connect(&h.handler);
        let client_id = opened_id(open(&mut client, Handshake::new("s3cret")).await);
        let multiplexer = h.registry.lookup(&client_id).unwrap().multiplexer().clone();

        let mut requests = Vec::new();
        for i in 0..5 {
            let multiplexer = multiplexer.clone();
            requests.push(tokio::spawn(async move {
                let head = RequestHead {
                    method: "GET".to_string(),
                    path: format!("/{}", i),
                    query: None,
                    headers: vec![],
                };
                let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
                multiplexer
                    .send(head, stream::empty::<Result<Bytes, Infallible>>(), deadline)
                    .await
            }));
        }
        let mut heads = 0;
        while heads < 5 {
            if let ControlMessage::RequestHead { .. } = client.0.next().await.unwrap().unwrap() {
                heads += 1;
            }
        }

        drop(client);
        // EOF or a failed write, whichever the relay notices first
        let _ = task.await.unwrap();

        for request in requests {
            assert_eq!(
                request.await.unwrap().unwrap_err(),
                RelayError::ConnectionClosed
            );
        }
    }

    #[tokio::test]
    async fn test_relay_shutdown_closes_connections() {
        let shutdown = CancellationToken::new();
        let registry = Arc::new(ClientRegistry::new());
        let base = url::Url::parse("http://relay.test").unwrap();
        let router = Arc::new(PublicRouter::new(RoutingMode::Subpath, &base).unwrap());
        let handler = Arc::new(
            ControlHandler::new(registry.clone(), router, SharedSecret::from("s3cret"))
                .with_shutdown(shutdown.clone()),
        );

        let (mut client, task) = connect(&handler);
        open(&mut client, Handshake::new("s3cret")).await;
        assert_eq!(registry.len(), 1);

        shutdown.cancel();
        assert!(matches!(task.await.unwrap(), Err(ControlError::Evicted)));
        assert!(registry.is_empty());
        assert!(client.0.next().await.is_none());
    }
}
