//! Connection multiplexer.
//!
//! A single [`Reactor`] task owns the listener, every connection handle, the
//! dialed-address index and the [`Dispatcher`] (and through it the node's
//! membership state). Connection tasks, node handles and the shutdown signal
//! all reach it through channels, so no state here is ever shared or locked.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

use crate::config::TransportConfig;
use crate::core::packet::Packet;
use crate::error::{ProtocolError, Result};
use crate::protocol::dispatcher::{Action, ChatMessage, ConnId, Dispatcher, DropReason};
use crate::protocol::membership::MembershipSnapshot;
use crate::protocol::message::Body;
use crate::transport::connection::{spawn_connection, ConnEvent, ConnectionHandle};
use crate::utils::metrics::Metrics;

/// Request from a node handle to its reactor
#[derive(Debug)]
pub enum Command {
    /// Route a chat message; the reply is `false` when a hop could not be dialed
    SendMessage {
        target: SocketAddr,
        text: String,
        reply: oneshot::Sender<Result<bool>>,
    },
    /// Flood this node's own `new_user` announcement
    Announce,
    Snapshot(oneshot::Sender<MembershipSnapshot>),
}

pub struct Reactor {
    listener: TcpListener,
    dispatcher: Dispatcher,
    connections: HashMap<ConnId, ConnectionHandle>,
    /// Open outbound connection per neighbor listening address
    dialed: HashMap<SocketAddr, ConnId>,
    next_conn: ConnId,
    events_tx: mpsc::Sender<ConnEvent>,
    events_rx: mpsc::Receiver<ConnEvent>,
    commands: mpsc::Receiver<Command>,
    shutdown: mpsc::Receiver<()>,
    inbox: mpsc::Sender<ChatMessage>,
    config: TransportConfig,
    metrics: Arc<Metrics>,
}

impl Reactor {
    pub fn new(
        listener: TcpListener,
        dispatcher: Dispatcher,
        commands: mpsc::Receiver<Command>,
        shutdown: mpsc::Receiver<()>,
        inbox: mpsc::Sender<ChatMessage>,
        config: TransportConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(config.event_capacity);
        Self {
            listener,
            dispatcher,
            connections: HashMap::new(),
            dialed: HashMap::new(),
            next_conn: 1,
            events_tx,
            events_rx,
            commands,
            shutdown,
            inbox,
            config,
            metrics,
        }
    }

    /// Serve until the shutdown signal fires or every handle is dropped
    pub async fn run(mut self) -> Result<()> {
        let membership = self.dispatcher.membership();
        info!(host = %membership.host(), id = ?membership.id(), "Reactor running");

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    info!("Shutting down reactor");
                    break;
                }

                accepted = self.listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        self.register(stream, remote, false);
                    }
                    Err(e) => error!(error = %e, "Accept failed"),
                },

                Some(event) = self.events_rx.recv() => self.on_event(event).await,

                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => {
                        debug!("All node handles dropped");
                        break;
                    }
                },
            }
        }

        for handle in self.connections.values() {
            trace!(conn = handle.id(), peer = %handle.peer(), "Aborting connection");
            handle.abort();
        }
        self.connections.clear();
        self.dialed.clear();
        self.metrics.log_metrics();
        Ok(())
    }

    fn register(&mut self, stream: TcpStream, remote: SocketAddr, outbound: bool) -> ConnId {
        let id = self.next_conn;
        self.next_conn += 1;

        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }
        if outbound {
            self.metrics.connection_dialed();
        } else {
            self.metrics.connection_accepted();
        }

        let handle = spawn_connection(
            id,
            stream,
            remote,
            self.events_tx.clone(),
            self.config.max_frame_size,
            self.metrics.clone(),
        );
        debug!(conn = handle.id(), peer = %handle.peer(), outbound, "Connection registered");
        self.connections.insert(id, handle);
        id
    }

    async fn on_event(&mut self, event: ConnEvent) {
        match event {
            ConnEvent::Frame { conn, packet } => {
                let actions = self.dispatcher.dispatch(conn, packet);
                self.apply(Some(conn), actions).await;
            }
            ConnEvent::Closed { conn, error } => {
                if let Some(handle) = self.connections.remove(&conn) {
                    self.metrics.connection_closed();
                    trace!(conn, peer = %handle.peer(), "Connection deregistered");
                }
                self.dialed.retain(|_, id| *id != conn);
                self.dispatcher.connection_closed(conn);
                match error {
                    Some(e @ (ProtocolError::Framing(_) | ProtocolError::OversizedFrame(_))) => {
                        self.metrics.framing_error();
                        warn!(conn, error = %e, "Connection closed on framing error");
                    }
                    Some(e) => debug!(conn, error = %e, "Connection closed with error"),
                    None => trace!(conn, "Connection closed"),
                }
            }
        }
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::SendMessage {
                target,
                text,
                reply,
            } => {
                let result = match self.dispatcher.send_user_message(target, text) {
                    Ok(actions) => Ok(self.apply(None, actions).await),
                    Err(e) => {
                        if let ProtocolError::UnknownPeer(_) = e {
                            self.metrics.unknown_peer();
                        }
                        Err(e)
                    }
                };
                let _ = reply.send(result);
            }
            Command::Announce => {
                let actions = self.dispatcher.announce();
                self.apply(None, actions).await;
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.dispatcher.membership().snapshot());
            }
        }
    }

    /// Carry out dispatcher actions; `false` if any send or forward failed
    async fn apply(&mut self, origin: Option<ConnId>, actions: Vec<Action>) -> bool {
        let mut delivered = true;
        for action in actions {
            let ok = match action {
                Action::Reply(packet) => match origin {
                    Some(conn) => self.send_on(conn, packet),
                    None => false,
                },
                Action::Respond { conn, packet } => self.send_on(conn, packet),
                Action::Forward { to, packet } => {
                    let flood = matches!(packet.body, Body::NewUser { .. });
                    let sent = self.forward(to, packet).await;
                    if sent && flood {
                        self.metrics.broadcast_forwarded();
                    }
                    sent
                }
                Action::Deliver(message) => {
                    self.metrics.message_delivered();
                    debug!(from = %message.from_host, "Delivering chat message");
                    if let Err(e) = self.inbox.try_send(message) {
                        warn!(error = %e, "Inbox unavailable, message discarded");
                    }
                    true
                }
                Action::Drop(reason) => {
                    self.record_drop(&reason);
                    false
                }
            };
            delivered &= ok;
        }
        delivered
    }

    fn send_on(&mut self, conn: ConnId, packet: Packet) -> bool {
        match self.connections.get(&conn) {
            Some(handle) => handle.send(packet),
            None => {
                debug!(conn, "Connection gone before reply");
                false
            }
        }
    }

    /// Send over the open dialed connection to `to`, dialing one if needed
    async fn forward(&mut self, to: SocketAddr, packet: Packet) -> bool {
        if let Some(handle) = self.dialed.get(&to).and_then(|id| self.connections.get(id)) {
            if handle.send(packet.clone()) {
                return true;
            }
        }
        self.dialed.remove(&to);

        let dial = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(to)).await;
        let stream = match dial {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return self.dial_failed(to, e.to_string()),
            Err(_) => {
                return self.dial_failed(to, crate::error::constants::ERR_CONNECT_TIMEOUT.into())
            }
        };

        let id = self.register(stream, to, true);
        self.dialed.insert(to, id);
        self.send_on(id, packet)
    }

    fn dial_failed(&self, addr: SocketAddr, reason: String) -> bool {
        self.metrics.connect_error();
        let e = ProtocolError::Connect { addr, reason };
        warn!(error = %e, "Forward failed");
        false
    }

    fn record_drop(&self, reason: &DropReason) {
        match reason {
            DropReason::UnknownPeer(id) => {
                self.metrics.unknown_peer();
                warn!(peer = id, "Dropping packet for neighbor with no known address");
            }
            DropReason::Unsupported(kind) => {
                self.metrics.packet_dropped();
                trace!(kind, "Ignoring unsupported packet");
            }
            other => {
                self.metrics.packet_dropped();
                debug!(reason = ?other, "Packet dropped");
            }
        }
    }
}
