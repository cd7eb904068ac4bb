//! Per-connection I/O task.
//!
//! Each accepted or dialed socket gets one task driving a
//! `Framed<TcpStream, FrameCodec>`. The task only moves frames: decoded packets
//! go to the reactor as [`ConnEvent::Frame`], queued outbound packets are
//! written in FIFO order as whole frames.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, trace, warn};

use crate::core::codec::FrameCodec;
use crate::core::packet::Packet;
use crate::error::ProtocolError;
use crate::protocol::dispatcher::ConnId;
use crate::utils::metrics::Metrics;

/// Notification from a connection task to the reactor
#[derive(Debug)]
pub enum ConnEvent {
    Frame {
        conn: ConnId,
        packet: Packet,
    },
    /// EOF or a failure; `error` is `None` for a clean close
    Closed {
        conn: ConnId,
        error: Option<ProtocolError>,
    },
}

/// Reactor-side end of a connection
#[derive(Debug)]
pub struct ConnectionHandle {
    id: ConnId,
    peer: SocketAddr,
    outbound: mpsc::UnboundedSender<Packet>,
    task: JoinHandle<()>,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Queue a packet; `false` if the connection task has already finished
    pub fn send(&self, packet: Packet) -> bool {
        self.outbound.send(packet).is_ok()
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Spawn the I/O task for `stream`
pub fn spawn_connection(
    id: ConnId,
    stream: TcpStream,
    peer: SocketAddr,
    events: mpsc::Sender<ConnEvent>,
    max_frame_size: usize,
    metrics: Arc<Metrics>,
) -> ConnectionHandle {
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Packet>();

    let task = tokio::spawn(async move {
        let framed = Framed::new(stream, FrameCodec::new(max_frame_size));
        let (mut sink, mut frames) = framed.split();

        let error = loop {
            tokio::select! {
                incoming = frames.next() => match incoming {
                    Some(Ok(packet)) => {
                        metrics.frame_received();
                        trace!(conn = id, kind = packet.body.opcode(), "Frame received");
                        if events.send(ConnEvent::Frame { conn: id, packet }).await.is_err() {
                            // Reactor is gone
                            return;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(conn = id, %peer, error = %e, "Closing connection on bad frame");
                        break Some(e);
                    }
                    None => break None,
                },
                queued = outbound_rx.recv() => match queued {
                    Some(packet) => {
                        if let Err(e) = sink.send(packet).await {
                            break Some(e);
                        }
                        metrics.frame_sent();
                    }
                    None => return,
                },
            }
        };

        debug!(conn = id, %peer, "Connection finished");
        let _ = events.send(ConnEvent::Closed { conn: id, error }).await;
    });

    ConnectionHandle {
        id,
        peer,
        outbound,
        task,
    }
}
