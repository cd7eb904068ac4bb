//! Node lifecycle: bind, join (or found) the overlay, then serve.
//!
//! ```no_run
//! use bst_overlay::{Node, OverlayConfig};
//!
//! # async fn demo() -> bst_overlay::error::Result<()> {
//! let root = Node::bind(OverlayConfig::default_with_overrides(|c| c.node.listen_port = 0))
//!     .await?
//!     .start()
//!     .await?;
//!
//! let bootstrap = root.local_addr();
//! let mut peer = Node::bind(OverlayConfig::default_with_overrides(|c| {
//!     c.node.listen_port = 0;
//!     c.node.bootstrap = Some(bootstrap);
//! }))
//! .await?
//! .start()
//! .await?;
//!
//! root.send_user_message(peer.local_addr(), "hello").await?;
//! let message = peer.next_message().await;
//! # Ok(())
//! # }
//! ```

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, instrument};

use crate::config::OverlayConfig;
use crate::error::{ProtocolError, Result};
use crate::protocol::dispatcher::{ChatMessage, Dispatcher};
use crate::protocol::handshake::join_overlay;
use crate::protocol::membership::{Membership, MembershipSnapshot};
use crate::transport::reactor::{Command, Reactor};
use crate::utils::metrics::{Metrics, MetricsSnapshot};
use crate::utils::timeout::{with_timeout, DEFAULT_TIMEOUT};

/// A bound but not yet serving overlay node
pub struct Node {
    config: OverlayConfig,
    listener: TcpListener,
    membership: Membership,
    metrics: Arc<Metrics>,
}

impl Node {
    /// Validate `config` and bind the listener. Nothing is accepted until
    /// [`Node::start`] hands the listener to the reactor.
    #[instrument(skip(config), fields(port = config.node.listen_port))]
    pub async fn bind(config: OverlayConfig) -> Result<Self> {
        config.validate_strict()?;

        let listener = TcpListener::bind(config.node.listen_addr()).await?;
        let port = listener.local_addr()?.port();
        let host = SocketAddr::new(config.node.advertise_host, port);
        info!(%host, "Listener bound");

        let membership = Membership::new(host, config.node.username.clone());
        Ok(Self {
            config,
            listener,
            membership,
            metrics: Arc::new(Metrics::new()),
        })
    }

    /// Advertised listening address
    pub fn local_addr(&self) -> SocketAddr {
        self.membership.host()
    }

    /// Found a new overlay or join the configured one, then spawn the reactor.
    ///
    /// Join failures (timeouts, unreachable peers) are returned here and the
    /// node never starts serving.
    #[instrument(skip(self), fields(host = %self.membership.host()))]
    pub async fn start(self) -> Result<NodeHandle> {
        let Node {
            config,
            listener,
            mut membership,
            metrics,
        } = self;
        let host = membership.host();

        let joined = match config.node.bootstrap {
            None => {
                let id = match config.node.node_id {
                    Some(id) => id,
                    None => membership.generate_id(&HashSet::new()),
                };
                membership.become_root(id);
                info!(id, "Founded new overlay");
                false
            }
            Some(bootstrap) => {
                join_overlay(
                    &mut membership,
                    bootstrap,
                    config.node.node_id,
                    &config.join,
                    config.transport.max_frame_size,
                    &metrics,
                )
                .await?;
                true
            }
        };

        let (command_tx, command_rx) = mpsc::channel(config.transport.command_capacity);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let (inbox_tx, inbox_rx) = mpsc::channel(config.transport.inbox_capacity);

        let reactor = Reactor::new(
            listener,
            Dispatcher::new(membership),
            command_rx,
            shutdown_rx,
            inbox_tx,
            config.transport.clone(),
            metrics.clone(),
        );
        let task = tokio::spawn(reactor.run());

        if joined {
            command_tx
                .send(Command::Announce)
                .await
                .map_err(|_| ProtocolError::NodeStopped)?;
        }

        Ok(NodeHandle {
            host,
            commands: command_tx,
            shutdown: shutdown_tx,
            inbox: inbox_rx,
            metrics,
            task,
        })
    }
}

/// Control surface of a running node
pub struct NodeHandle {
    host: SocketAddr,
    commands: mpsc::Sender<Command>,
    shutdown: mpsc::Sender<()>,
    inbox: mpsc::Receiver<ChatMessage>,
    metrics: Arc<Metrics>,
    task: JoinHandle<Result<()>>,
}

impl NodeHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.host
    }

    /// Route `text` to the node listening on `target`.
    ///
    /// `Ok(false)` means the first hop could not be reached; an unknown target
    /// is [`ProtocolError::UnknownPeer`].
    pub async fn send_user_message(
        &self,
        target: SocketAddr,
        text: impl Into<String>,
    ) -> Result<bool> {
        let (reply, response) = oneshot::channel();
        self.command(Command::SendMessage {
            target,
            text: text.into(),
            reply,
        })
        .await?;
        response.await.map_err(|_| ProtocolError::NodeStopped)?
    }

    /// Next chat message delivered to this node; `None` once stopped
    pub async fn next_message(&mut self) -> Option<ChatMessage> {
        self.inbox.recv().await
    }

    pub async fn snapshot(&self) -> Result<MembershipSnapshot> {
        let (reply, response) = oneshot::channel();
        self.command(Command::Snapshot(reply)).await?;
        with_timeout(response, DEFAULT_TIMEOUT)
            .await?
            .map_err(|_| ProtocolError::NodeStopped)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Signal the reactor and wait for it to finish. Open connections are
    /// aborted without draining their queues.
    pub async fn stop(self) -> Result<()> {
        let _ = self.shutdown.send(()).await;
        match self.task.await {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "Reactor task failed");
                Err(ProtocolError::NodeStopped)
            }
        }
    }

    async fn command(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ProtocolError::NodeStopped)
    }
}
