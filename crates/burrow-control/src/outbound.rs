//! Outbound frame queues and the per-connection writer task

use burrow_proto::{CodecError, ControlCodec, ControlMessage};
use futures::SinkExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Sending side of a connection's outbound frames
///
/// Connection control frames (ping, pong, window updates, cancels) go on an
/// unbounded priority queue so they are never stuck behind body data. Request
/// frames go on a bounded queue, which back-pressures body pumps when the
/// socket is slow.
///
/// Pongs answer peer pings, so at most one sits in the queue at a time; a
/// peer that pings without reading cannot grow the control queue.
#[derive(Debug, Clone)]
pub struct OutboundQueue {
    control: mpsc::UnboundedSender<ControlMessage>,
    data: mpsc::Sender<ControlMessage>,
    pong_queued: Arc<AtomicBool>,
}

/// Receiving side, drained by the writer task
#[derive(Debug)]
pub struct OutboundReceiver {
    control: mpsc::UnboundedReceiver<ControlMessage>,
    data: mpsc::Receiver<ControlMessage>,
    pong_queued: Arc<AtomicBool>,
}

impl OutboundQueue {
    pub fn channel(data_capacity: usize) -> (Self, OutboundReceiver) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (data_tx, data_rx) = mpsc::channel(data_capacity.max(1));
        let pong_queued = Arc::new(AtomicBool::new(false));
        (
            Self {
                control: control_tx,
                data: data_tx,
                pong_queued: pong_queued.clone(),
            },
            OutboundReceiver {
                control: control_rx,
                data: data_rx,
                pong_queued,
            },
        )
    }

    /// Queue a control frame; returns false once the writer is gone
    pub fn send_control(&self, message: ControlMessage) -> bool {
        self.control.send(message).is_ok()
    }

    /// Answer a peer ping unless a pong is already waiting to be written
    pub fn send_pong(&self, timestamp: u64) -> bool {
        if self.pong_queued.swap(true, Ordering::AcqRel) {
            trace!("Pong already queued, dropping pong for {}", timestamp);
            return !self.control.is_closed();
        }
        self.send_control(ControlMessage::Pong { timestamp })
    }

    /// Queue a request frame, waiting for queue capacity
    pub async fn send_data(&self, message: ControlMessage) -> Result<(), ControlMessage> {
        self.data.send(message).await.map_err(|e| e.0)
    }

    pub fn is_closed(&self) -> bool {
        self.data.is_closed()
    }
}

impl OutboundReceiver {
    /// Next frame to write, control frames first
    pub async fn recv(&mut self) -> Option<ControlMessage> {
        let message = tokio::select! {
            biased;
            Some(message) = self.control.recv() => Some(message),
            Some(message) = self.data.recv() => Some(message),
            else => None,
        };

        if let Some(ControlMessage::Pong { .. }) = message {
            self.pong_queued.store(false, Ordering::Release);
        }
        message
    }
}

/// Serialises every outbound frame of one connection onto its write half
///
/// Runs until `shutdown` is cancelled, the queues close or a write fails.
/// A write failure is returned to whoever awaits the task.
pub async fn run_writer<W>(
    mut sink: FramedWrite<W, ControlCodec>,
    mut outbound: OutboundReceiver,
    shutdown: CancellationToken,
) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    let result = loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => break Ok(()),
            message = outbound.recv() => match message {
                Some(message) => message,
                None => break Ok(()),
            },
        };

        trace!(
            "Writing {} frame (correlation_id={})",
            message.kind(),
            message.correlation_id()
        );

        let write = tokio::select! {
            _ = shutdown.cancelled() => break Ok(()),
            result = sink.send(message) => result,
        };

        if let Err(e) = write {
            warn!("Failed to write control frame: {}", e);
            break Err(e);
        }
    };

    if let Err(e) = sink.close().await {
        debug!("Failed to close control stream: {}", e);
    }

    result
}
