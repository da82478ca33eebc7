//! Request multiplexing over a single control connection
//!
//! Every public request tunneled to a client gets a correlation ID that is
//! unique among the connection's open requests. Response frames coming back
//! from the client are routed to the waiting caller by that ID.

use crate::error::RelayError;
use crate::outbound::OutboundQueue;
use burrow_proto::{ControlMessage, CorrelationId, RequestHead, ResponseHead};
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::{Stream, StreamExt};
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Default body chunk size (16KB)
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Default per-request flow-control window (256KB)
pub const DEFAULT_WINDOW_SIZE: u32 = 256 * 1024;

/// Multiplexer tuning
#[derive(Debug, Clone, Copy)]
pub struct MultiplexerConfig {
    /// Largest body payload put in one chunk frame
    pub chunk_size: usize,
    /// Bytes of body data either side may send before receiving more credit
    pub window_size: u32,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            window_size: DEFAULT_WINDOW_SIZE,
        }
    }
}

/// Events delivered to the caller waiting on a request
#[derive(Debug)]
enum ResponseEvent {
    Head(ResponseHead),
    Chunk(Bytes),
    End,
    Failed(RelayError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseState {
    AwaitingHead,
    Streaming,
}

struct PendingRequest {
    /// Distinguishes this request from a later one that reuses the ID
    generation: u64,
    events: mpsc::UnboundedSender<ResponseEvent>,
    state: ResponseState,
    /// Response bytes the client may still send before it needs a window update
    response_window: u64,
    /// Request bytes the relay may still send; topped up by client window updates
    request_credit: Arc<Semaphore>,
}

impl PendingRequest {
    fn fail(&self, error: RelayError) {
        let _ = self.events.send(ResponseEvent::Failed(error));
    }
}

/// What to do with a response frame once the pending entry lock is released
enum Outcome {
    Delivered,
    Complete(u64),
    Violation(u64, RelayError),
}

/// Multiplexes tunneled requests over one client's control connection
pub struct RequestMultiplexer {
    client_id: String,
    outbound: OutboundQueue,
    config: MultiplexerConfig,
    pending: DashMap<CorrelationId, PendingRequest>,
    next_id: AtomicU32,
    next_generation: AtomicU64,
    closed: AtomicBool,
}

impl fmt::Debug for RequestMultiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestMultiplexer")
            .field("client_id", &self.client_id)
            .field("pending", &self.pending.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Response to a tunneled request
///
/// Available as soon as the client sends the response head; the body streams
/// in afterwards.
#[derive(Debug)]
pub struct TunnelResponse {
    pub head: ResponseHead,
    pub body: ResponseBody,
}

impl RequestMultiplexer {
    pub fn new(client_id: impl Into<String>, outbound: OutboundQueue, config: MultiplexerConfig) -> Self {
        Self {
            client_id: client_id.into(),
            outbound,
            config,
            pending: DashMap::new(),
            next_id: AtomicU32::new(1),
            next_generation: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Number of requests awaiting completion
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Send a request through the tunnel and wait for the response head
    ///
    /// `deadline` bounds the whole exchange, including the response body.
    pub async fn send<B, E>(
        self: &Arc<Self>,
        head: RequestHead,
        body: B,
        deadline: Instant,
    ) -> Result<TunnelResponse, RelayError>
    where
        B: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        if self.is_closed() {
            return Err(RelayError::ConnectionClosed);
        }

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let request_credit = Arc::new(Semaphore::new(self.config.window_size as usize));
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);

        let correlation_id = self.register(PendingRequest {
            generation,
            events: events_tx,
            state: ResponseState::AwaitingHead,
            response_window: u64::from(self.config.window_size),
            request_credit: request_credit.clone(),
        })?;

        // From here on the guard removes the entry and cancels the request
        // unless the response completes
        let mut guard = RequestGuard {
            multiplexer: self.clone(),
            correlation_id,
            generation,
            cancel: CancellationToken::new(),
        };

        // A concurrent fail_all may have missed the entry we just inserted
        if self.is_closed() {
            self.remove(correlation_id, generation);
            return Err(RelayError::ConnectionClosed);
        }

        // Fires even if nobody is polling the response
        tokio::spawn(expire_at(
            self.clone(),
            correlation_id,
            generation,
            deadline,
            guard.cancel.clone(),
        ));

        debug!(
            "Tunneling {} {} to client {} as request {}",
            head.method,
            head.uri(),
            self.client_id,
            correlation_id
        );

        let queued = tokio::time::timeout_at(
            deadline,
            self.outbound.send_data(ControlMessage::RequestHead {
                correlation_id,
                head,
            }),
        )
        .await;

        match queued {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return Err(RelayError::ConnectionClosed),
            Err(_) => {
                guard.release();
                return Err(RelayError::RequestTimeout);
            }
        }

        tokio::spawn(pump_request_body(
            self.clone(),
            correlation_id,
            generation,
            body,
            request_credit,
            guard.cancel.clone(),
        ));

        match tokio::time::timeout_at(deadline, events_rx.recv()).await {
            Err(_) => {
                warn!(
                    "Request {} to client {} timed out waiting for response head",
                    correlation_id, self.client_id
                );
                guard.release();
                Err(RelayError::RequestTimeout)
            }
            Ok(None) => Err(RelayError::ConnectionClosed),
            Ok(Some(ResponseEvent::Head(head))) => Ok(TunnelResponse {
                head,
                body: ResponseBody {
                    events: events_rx,
                    unacknowledged: 0,
                    done: false,
                    guard,
                },
            }),
            Ok(Some(ResponseEvent::Failed(error))) => Err(error),
            Ok(Some(event)) => Err(RelayError::Protocol(format!(
                "unexpected {:?} before response head",
                event
            ))),
        }
    }

    /// Allocate a correlation ID and store the pending request under it
    fn register(&self, request: PendingRequest) -> Result<CorrelationId, RelayError> {
        let mut request = Some(request);

        // Monotonic counter that wraps, skipping 0 and IDs still in use
        for _ in 0..u32::MAX {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id == 0 {
                continue;
            }

            if let Entry::Vacant(slot) = self.pending.entry(id) {
                if let Some(request) = request.take() {
                    slot.insert(request);
                }
                trace!("Allocated request {} on client {}", id, self.client_id);
                return Ok(id);
            }
        }

        warn!("Request ids exhausted on client {}", self.client_id);
        Err(RelayError::RequestIdsExhausted)
    }

    /// Remove a pending request if it is still the same generation
    fn remove(&self, correlation_id: CorrelationId, generation: u64) -> bool {
        self.pending
            .remove_if(&correlation_id, |_, p| p.generation == generation)
            .is_some()
    }

    /// Fail one request and tell the client to stop working on it
    ///
    /// Returns false if the request had already finished.
    fn fail_request(&self, correlation_id: CorrelationId, generation: u64, error: RelayError) -> bool {
        match self
            .pending
            .remove_if(&correlation_id, |_, p| p.generation == generation)
        {
            Some((_, request)) => {
                debug!(
                    "Failing request {} on client {}: {}",
                    correlation_id, self.client_id, error
                );
                request.fail(error);
                self.outbound
                    .send_control(ControlMessage::Cancel { correlation_id });
                true
            }
            None => false,
        }
    }

    /// Return response credit to the client for bytes the caller consumed
    fn grant_response_credit(&self, correlation_id: CorrelationId, generation: u64, increment: u32) {
        let granted = match self.pending.get_mut(&correlation_id) {
            Some(mut request) if request.generation == generation => {
                request.response_window += u64::from(increment);
                true
            }
            _ => false,
        };

        if granted {
            trace!(
                "Granting {} bytes of response credit for request {}",
                increment,
                correlation_id
            );
            self.outbound.send_control(ControlMessage::WindowUpdate {
                correlation_id,
                increment,
            });
        }
    }

    /// Apply a response frame from the client to its pending request
    ///
    /// Frames for unknown or already completed requests are dropped.
    pub fn dispatch(&self, message: ControlMessage) {
        let correlation_id = message.correlation_id();
        let kind = message.kind();

        let outcome = match self.pending.get_mut(&correlation_id) {
            None => {
                debug!(
                    "Dropping {} frame for unknown request {} on client {}",
                    kind, correlation_id, self.client_id
                );
                return;
            }
            Some(mut request) => apply(&mut request, message),
        };

        match outcome {
            Outcome::Delivered => {}
            Outcome::Complete(generation) => {
                // Events already queued, including the final one, stay readable
                if self.remove(correlation_id, generation) {
                    trace!(
                        "Request {} on client {} complete",
                        correlation_id,
                        self.client_id
                    );
                }
            }
            Outcome::Violation(generation, error) => {
                warn!(
                    "Client {} violated protocol on request {}: {}",
                    self.client_id, correlation_id, error
                );
                self.fail_request(correlation_id, generation, error);
            }
        }
    }

    /// Resolve every pending request with `error` and refuse new ones
    pub fn fail_all(&self, error: RelayError) {
        self.closed.store(true, Ordering::SeqCst);

        let mut failed = 0;
        self.pending.retain(|_, request| {
            request.fail(error.clone());
            failed += 1;
            false
        });

        if failed > 0 {
            debug!(
                "Failed {} pending requests on client {}: {}",
                failed, self.client_id, error
            );
        }
    }
}

/// Apply one response-direction frame while holding the entry lock
fn apply(request: &mut PendingRequest, message: ControlMessage) -> Outcome {
    let generation = request.generation;
    let violation = |reason: &str| Outcome::Violation(generation, RelayError::Protocol(reason.to_string()));

    match message {
        ControlMessage::ResponseHead { head, .. } => {
            if request.state != ResponseState::AwaitingHead {
                return violation("duplicate response head");
            }
            request.state = ResponseState::Streaming;
            let _ = request.events.send(ResponseEvent::Head(head));
            Outcome::Delivered
        }
        ControlMessage::ResponseChunk { data, .. } => {
            if request.state != ResponseState::Streaming {
                return violation("response chunk before response head");
            }
            let len = data.len() as u64;
            if len > request.response_window {
                return Outcome::Violation(generation, RelayError::FlowControl);
            }
            request.response_window -= len;
            let _ = request.events.send(ResponseEvent::Chunk(data));
            Outcome::Delivered
        }
        ControlMessage::ResponseEnd { .. } => {
            if request.state != ResponseState::Streaming {
                return violation("response end before response head");
            }
            let _ = request.events.send(ResponseEvent::End);
            Outcome::Complete(generation)
        }
        ControlMessage::Error { message, .. } => {
            request.fail(RelayError::Upstream(message));
            Outcome::Complete(generation)
        }
        ControlMessage::Cancel { .. } => {
            request.fail(RelayError::Upstream(
                "request cancelled by client".to_string(),
            ));
            Outcome::Complete(generation)
        }
        ControlMessage::WindowUpdate { increment, .. } => {
            let available = request.request_credit.available_permits();
            if available.saturating_add(increment as usize) > Semaphore::MAX_PERMITS {
                return Outcome::Violation(generation, RelayError::FlowControl);
            }
            request.request_credit.add_permits(increment as usize);
            Outcome::Delivered
        }
        other => violation(&format!("{} is not a response frame", other.kind())),
    }
}

/// Stream the caller's request body to the client as credit allows
async fn pump_request_body<B, E>(
    multiplexer: Arc<RequestMultiplexer>,
    correlation_id: CorrelationId,
    generation: u64,
    body: B,
    credit: Arc<Semaphore>,
    cancel: CancellationToken,
) where
    B: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    let chunk_size = multiplexer.config.chunk_size.max(1);
    let outbound = multiplexer.outbound.clone();
    let mut body = Box::pin(body);

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return,
            next = body.next() => next,
        };

        let mut data = match next {
            None => break,
            Some(Ok(data)) => data,
            Some(Err(e)) => {
                warn!("Failed to read body of request {}: {}", correlation_id, e);
                multiplexer.fail_request(
                    correlation_id,
                    generation,
                    RelayError::RequestBody(e.to_string()),
                );
                return;
            }
        };

        while !data.is_empty() {
            let chunk = data.split_to(chunk_size.min(data.len()));

            tokio::select! {
                _ = cancel.cancelled() => return,
                permit = credit.acquire_many(chunk.len() as u32) => match permit {
                    Ok(permit) => permit.forget(),
                    Err(_) => return,
                },
            }

            let sent = tokio::select! {
                _ = cancel.cancelled() => return,
                sent = outbound.send_data(ControlMessage::RequestChunk {
                    correlation_id,
                    data: chunk,
                }) => sent,
            };
            if sent.is_err() {
                return;
            }
        }
    }

    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = outbound.send_data(ControlMessage::RequestEnd { correlation_id }) => {
            trace!("Request {} body complete", correlation_id);
        }
    }
}

/// Hard cutoff for one request, independent of whether its response is read
///
/// Removes the entry, queues a timeout for whoever holds the response and
/// tells the client to drop the request.
async fn expire_at(
    multiplexer: Arc<RequestMultiplexer>,
    correlation_id: CorrelationId,
    generation: u64,
    deadline: Instant,
    cancel: CancellationToken,
) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep_until(deadline) => {
            if multiplexer.fail_request(correlation_id, generation, RelayError::RequestTimeout) {
                warn!(
                    "Request {} to client {} passed its deadline",
                    correlation_id,
                    multiplexer.client_id()
                );
            }
            cancel.cancel();
        }
    }
}

/// Removes a request that did not complete and tells the client to drop it
struct RequestGuard {
    multiplexer: Arc<RequestMultiplexer>,
    correlation_id: CorrelationId,
    generation: u64,
    /// Stops the request body pump and the deadline timer
    cancel: CancellationToken,
}

impl RequestGuard {
    fn release(&mut self) {
        self.cancel.cancel();
        if self.multiplexer.remove(self.correlation_id, self.generation) {
            debug!(
                "Cancelling request {} on client {}",
                self.correlation_id,
                self.multiplexer.client_id()
            );
            self.multiplexer.outbound.send_control(ControlMessage::Cancel {
                correlation_id: self.correlation_id,
            });
        }
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Streaming response body
///
/// Returns flow-control credit to the client as the body is consumed.
/// Dropping it before the end cancels the request.
pub struct ResponseBody {
    events: mpsc::UnboundedReceiver<ResponseEvent>,
    /// Consumed bytes not yet returned to the client as credit
    unacknowledged: u32,
    done: bool,
    guard: RequestGuard,
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseBody")
            .field("correlation_id", &self.guard.correlation_id)
            .field("done", &self.done)
            .finish()
    }
}

impl ResponseBody {
    pub fn correlation_id(&self) -> CorrelationId {
        self.guard.correlation_id
    }

    fn acknowledge(&mut self, len: usize) {
        let config = self.guard.multiplexer.config;
        self.unacknowledged = self.unacknowledged.saturating_add(len as u32);

        if self.unacknowledged >= (config.window_size / 4).max(1) {
            let increment = std::mem::take(&mut self.unacknowledged);
            self.guard.multiplexer.grant_response_credit(
                self.guard.correlation_id,
                self.guard.generation,
                increment,
            );
        }
    }

    fn finish(&mut self) {
        self.done = true;
        self.guard.release();
    }
}

impl Stream for ResponseBody {
    type Item = Result<Bytes, RelayError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }

        match self.events.poll_recv(cx) {
            Poll::Ready(Some(ResponseEvent::Chunk(data))) => {
                self.acknowledge(data.len());
                Poll::Ready(Some(Ok(data)))
            }
            Poll::Ready(Some(ResponseEvent::End)) => {
                self.finish();
                Poll::Ready(None)
            }
            Poll::Ready(Some(ResponseEvent::Failed(error))) => {
                self.finish();
                Poll::Ready(Some(Err(error)))
            }
            Poll::Ready(Some(ResponseEvent::Head(_))) => {
                self.finish();
                Poll::Ready(Some(Err(RelayError::Protocol(
                    "duplicate response head".to_string(),
                ))))
            }
            Poll::Ready(None) => {
                self.finish();
                Poll::Ready(Some(Err(RelayError::ConnectionClosed)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
