use crate::core::codec::FrameCodec;
use crate::core::packet::Packet;
use crate::error::{ProtocolError, Result};
use crate::utils::timeout::{with_timeout_error, DEFAULT_TIMEOUT};

use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, instrument};

/// Short-lived request/response connection used while joining the overlay
pub struct PeerClient {
    framed: Framed<TcpStream, FrameCodec>,
    remote: SocketAddr,
    send_timeout: Duration,
    recv_timeout: Duration,
}

impl PeerClient {
    /// Dial `remote`, failing with [`ProtocolError::Connect`] when the dial
    /// errors or does not finish within `connect_timeout`
    #[instrument(skip(connect_timeout, max_frame_size), fields(remote = %remote))]
    pub async fn connect(
        remote: SocketAddr,
        connect_timeout: Duration,
        max_frame_size: usize,
    ) -> Result<Self> {
        let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(remote)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(ProtocolError::Connect {
                    addr: remote,
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(ProtocolError::Connect {
                    addr: remote,
                    reason: crate::error::constants::ERR_CONNECT_TIMEOUT.into(),
                })
            }
        };
        stream.set_nodelay(true)?;
        debug!("Connected");

        Ok(Self {
            framed: Framed::new(stream, FrameCodec::new(max_frame_size)),
            remote,
            send_timeout: DEFAULT_TIMEOUT,
            recv_timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Set custom timeout durations
    pub fn with_timeouts(mut self, send_timeout: Duration, recv_timeout: Duration) -> Self {
        self.send_timeout = send_timeout;
        self.recv_timeout = recv_timeout;
        self
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    #[instrument(skip(self, packet), level = "debug", fields(kind = packet.body.opcode()))]
    pub async fn send(&mut self, packet: Packet) -> Result<()> {
        with_timeout_error(
            async {
                self.framed.send(packet).await?;
                Ok(())
            },
            self.send_timeout,
        )
        .await
    }

    #[instrument(skip(self), level = "debug")]
    pub async fn recv(&mut self) -> Result<Packet> {
        with_timeout_error(
            async {
                self.framed
                    .next()
                    .await
                    .ok_or(ProtocolError::ConnectionClosed)?
            },
            self.recv_timeout,
        )
        .await
    }

    /// Send `packet` and wait for the next frame on this connection
    pub async fn request(&mut self, packet: Packet) -> Result<Packet> {
        self.send(packet).await?;
        self.recv().await
    }
}
