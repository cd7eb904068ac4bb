//! Routing and relay engine.
//!
//! The [`Dispatcher`] owns a node's [`Membership`] and turns every inbound
//! packet into a list of [`Action`]s for the multiplexer to carry out. It does
//! no I/O itself, which keeps every routing decision testable without sockets.
//!
//! Dispatch is one exhaustive `match` over [`Body`]; a new packet type does not
//! compile until it has a handler here.

use std::collections::HashMap;
use std::net::SocketAddr;

use tracing::{debug, instrument, trace, warn};

use crate::core::packet::Packet;
use crate::error::{ProtocolError, Result};
use crate::protocol::membership::{Hop, Membership, Slot};
use crate::protocol::message::{
    Body, Broadcast, ConnectStatus, Link, NodeId, PlaceInfo, UserInfo,
};

/// Multiplexer-assigned connection identifier
pub type ConnId = u64;

/// Chat payload that reached its destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub from_id: Option<NodeId>,
    pub from_host: SocketAddr,
    pub text: String,
}

/// Why a packet was not delivered or forwarded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// A neighbor id has no known address
    UnknownPeer(NodeId),
    /// The routing rule pointed at an empty link
    NoRoute(Link),
    /// An `insert_place` answer arrived with no pending requester
    NoReturnPath(NodeId),
    /// The node has no tree position yet
    NotAttached,
    /// Packet type is not meaningful here
    Unexpected(&'static str),
    /// Packet type is a stub (`ping`, `disconnect`)
    Unsupported(&'static str),
}

/// Work produced by dispatching one packet
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Send on the connection the packet arrived on
    Reply(Packet),
    /// Send on another connection (return path of a relayed request)
    Respond { conn: ConnId, packet: Packet },
    /// Send to the listening address of a neighbor
    Forward { to: SocketAddr, packet: Packet },
    /// Hand a chat message to the application
    Deliver(ChatMessage),
    Drop(DropReason),
}

#[derive(Debug)]
pub struct Dispatcher {
    membership: Membership,
    /// Inbound connection each relayed insertion request came from, by candidate id
    return_paths: HashMap<NodeId, ConnId>,
}

impl Dispatcher {
    pub fn new(membership: Membership) -> Self {
        Self {
            membership,
            return_paths: HashMap::new(),
        }
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    pub fn pending_returns(&self) -> usize {
        self.return_paths.len()
    }

    /// Forget return paths through a connection that has closed
    pub fn connection_closed(&mut self, conn: ConnId) {
        let before = self.return_paths.len();
        self.return_paths.retain(|_, origin| *origin != conn);
        let dropped = before - self.return_paths.len();
        if dropped > 0 {
            debug!(conn, dropped, "Discarded return paths of closed connection");
        }
    }

    /// Handle one packet received on connection `origin`
    #[instrument(skip(self, packet), fields(kind = packet.body.opcode(), from = %packet.from_host))]
    pub fn dispatch(&mut self, origin: ConnId, packet: Packet) -> Vec<Action> {
        if !self.membership.is_attached() {
            return vec![Action::Drop(DropReason::NotAttached)];
        }

        match packet.body {
            Body::GetChatInfo => self.on_get_chat_info(&packet),
            Body::FindInsertPlace => match packet.from_id {
                Some(candidate) => self.search_place(origin, candidate, packet.from_host),
                None => vec![Action::Drop(DropReason::Unexpected(
                    "find_insert_place without candidate id",
                ))],
            },
            Body::InsertPlace { .. } => self.on_search_answer(packet),
            Body::Connect {
                ref place_info,
                ref user_info,
            } => self.on_connect(&packet, place_info, user_info),
            Body::Relay {
                inner,
                client_id,
                client_host,
            } => self.on_relay(origin, packet.to_id, packet.to_host, *inner, client_id, client_host),
            Body::NewUser { broadcast } => self.on_new_user(broadcast),
            Body::Message { text } => {
                self.on_message(packet.from_id, packet.from_host, packet.to_host, text)
            }
            Body::ChatInfo { .. } => vec![Action::Drop(DropReason::Unexpected("chat_info"))],
            Body::ConnectResp { .. } if packet.to_host != self.membership.host() => {
                self.on_search_answer(packet)
            }
            Body::ConnectResp { .. } => {
                vec![Action::Drop(DropReason::Unexpected("connect_resp"))]
            }
            Body::Ping => vec![Action::Drop(DropReason::Unsupported("ping"))],
            Body::Disconnect => vec![Action::Drop(DropReason::Unsupported("disconnect"))],
        }
    }

    /// Flood this node's own arrival to every neighbor
    pub fn announce(&mut self) -> Vec<Action> {
        match self.membership.user_info() {
            Some(user_info) if self.membership.is_attached() => self.flood(user_info, None),
            _ => vec![Action::Drop(DropReason::NotAttached)],
        }
    }

    /// Route an application chat message toward the node listening on `target`
    pub fn send_user_message(&mut self, target: SocketAddr, text: String) -> Result<Vec<Action>> {
        let own_id = self.membership.id().ok_or(ProtocolError::NotAttached)?;
        if !self.membership.is_attached() {
            return Err(ProtocolError::NotAttached);
        }

        let target_id = self
            .membership
            .peer(&target)
            .map(|info| info.id)
            .ok_or_else(|| ProtocolError::UnknownPeer(target.to_string()))?;

        let own_host = self.membership.host();
        if target == own_host {
            return Ok(vec![Action::Deliver(ChatMessage {
                from_id: Some(own_id),
                from_host: own_host,
                text,
            })]);
        }

        let packet = Packet::new(
            Some(own_id),
            own_host,
            Some(target_id),
            target,
            Body::relay(Body::Message { text }, own_id, own_host),
        );
        Ok(vec![self.route(target_id, packet)])
    }

    fn on_get_chat_info(&self, request: &Packet) -> Vec<Action> {
        let mut response = request.reply(Body::ChatInfo {
            connected: self.membership.chat_view(),
        });
        response.from_id = self.membership.id();
        response.from_host = self.membership.host();
        debug!(peers = self.membership.peer_count(), "Answering get_chat_info");
        vec![Action::Reply(response)]
    }

    /// Find an insertion point for `candidate`, answering directly when the
    /// slot is here and relaying one hop (by the candidate id) otherwise.
    fn search_place(&mut self, origin: ConnId, candidate: NodeId, client: SocketAddr) -> Vec<Action> {
        let own_id = self.membership.id();
        let own_host = self.membership.host();

        let link = match self.membership.locate_slot(candidate) {
            Slot::Vacant(place_info) => {
                debug!(candidate, side = ?place_info.side, "Found insertion place");
                let answer = Packet::new(
                    own_id,
                    own_host,
                    Some(candidate),
                    client,
                    Body::InsertPlace { place_info },
                );
                return vec![Action::Reply(answer)];
            }
            Slot::Taken => {
                // Refused like a lost attach race, so the joiner can pick another id
                warn!(candidate, "Candidate id collides with this node");
                let refusal = Packet::new(
                    own_id,
                    own_host,
                    Some(candidate),
                    client,
                    Body::ConnectResp {
                        response: ConnectStatus::Error,
                        connected: Vec::new(),
                    },
                );
                return vec![Action::Reply(refusal)];
            }
            Slot::Descend(side) => Link::from(side),
            Slot::Outside => Link::Parent,
        };

        let (next_id, next_host) = match self.resolve(link) {
            Ok(next) => next,
            Err(reason) => return vec![Action::Drop(reason)],
        };

        let relay = Packet::new(
            own_id,
            own_host,
            Some(next_id),
            next_host,
            Body::relay(Body::FindInsertPlace, candidate, client),
        );
        self.return_paths.insert(candidate, origin);
        trace!(candidate, ?link, next_id, "Relaying find_insert_place");
        vec![Action::Forward {
            to: next_host,
            packet: relay,
        }]
    }

    /// A search answer (`insert_place`, or a refusal) travelling back toward
    /// a joining node
    fn on_search_answer(&mut self, packet: Packet) -> Vec<Action> {
        if packet.to_host == self.membership.host() {
            return vec![Action::Drop(DropReason::Unexpected("search answer for self"))];
        }
        let Some(candidate) = packet.to_id else {
            return vec![Action::Drop(DropReason::Unexpected("search answer without target id"))];
        };

        match self.return_paths.remove(&candidate) {
            Some(conn) => vec![Action::Respond { conn, packet }],
            None => vec![Action::Drop(DropReason::NoReturnPath(candidate))],
        }
    }

    /// Attach request from a joining node; the slot must still be empty and
    /// the requested range must be exactly this node's split for that side.
    fn on_connect(&mut self, request: &Packet, place: &PlaceInfo, user: &UserInfo) -> Vec<Action> {
        let vacant = self.membership.child(place.side).is_none();
        let bounds_match = self.membership.child_bounds(place.side)
            == Some((place.low_bound, place.up_bound));
        let id_fits = place.low_bound < user.id && user.id < place.up_bound;

        let mut response = request.reply(Body::ConnectResp {
            response: ConnectStatus::Error,
            connected: Vec::new(),
        });
        response.from_id = self.membership.id();
        response.from_host = self.membership.host();

        if vacant && bounds_match && id_fits {
            self.membership.set_child(place.side, user.id);
            self.membership.add_user(user);
            debug!(child = user.id, side = ?place.side, host = %user.host, "Accepted child");
            response.to_id = Some(user.id);
            response.body = Body::ConnectResp {
                response: ConnectStatus::Ok,
                connected: self.membership.chat_view(),
            };
        } else {
            debug!(
                child = user.id,
                side = ?place.side,
                vacant,
                bounds_match,
                id_fits,
                "Rejected attach request"
            );
        }
        vec![Action::Reply(response)]
    }

    fn on_relay(
        &mut self,
        origin: ConnId,
        to_id: Option<NodeId>,
        to_host: SocketAddr,
        inner: Body,
        client_id: Option<NodeId>,
        client_host: Option<SocketAddr>,
    ) -> Vec<Action> {
        let (Some(client_id), Some(client_host)) = (client_id, client_host) else {
            return vec![Action::Drop(DropReason::Unexpected("relay without client identity"))];
        };

        if let Body::FindInsertPlace = inner {
            return self.search_place(origin, client_id, client_host);
        }

        let own_host = self.membership.host();
        if to_host == own_host {
            let unwrapped = Packet::new(Some(client_id), client_host, self.membership.id(), own_host, inner);
            return self.dispatch(origin, unwrapped);
        }

        let Some(target) = to_id else {
            return vec![Action::Drop(DropReason::Unexpected("relay without target id"))];
        };
        let packet = Packet::new(
            self.membership.id(),
            own_host,
            Some(target),
            to_host,
            Body::Relay {
                inner: Box::new(inner),
                client_id: Some(client_id),
                client_host: Some(client_host),
            },
        );
        vec![self.route(target, packet)]
    }

    /// Merge the announced user, then pass the flood on to every link except
    /// the one it came in on.
    fn on_new_user(&mut self, broadcast: Broadcast) -> Vec<Action> {
        let Broadcast {
            from_node_side,
            user_info,
        } = broadcast;
        self.membership.add_user(&user_info);
        debug!(user = user_info.id, host = %user_info.host, "Learned new user");
        self.flood(user_info, from_node_side)
    }

    fn on_message(
        &mut self,
        from_id: Option<NodeId>,
        from_host: SocketAddr,
        to_host: SocketAddr,
        text: String,
    ) -> Vec<Action> {
        if to_host == self.membership.host() {
            return vec![Action::Deliver(ChatMessage {
                from_id,
                from_host,
                text,
            })];
        }

        let Some(target) = self.membership.peer(&to_host).map(|info| info.id) else {
            warn!(%to_host, "Message for unknown peer");
            return vec![Action::Drop(DropReason::Unexpected("message for unknown host"))];
        };
        let Some(client_id) = from_id else {
            return vec![Action::Drop(DropReason::Unexpected("message without sender id"))];
        };
        let packet = Packet::new(
            self.membership.id(),
            self.membership.host(),
            Some(target),
            to_host,
            Body::relay(Body::Message { text }, client_id, from_host),
        );
        vec![self.route(target, packet)]
    }

    fn flood(&self, user_info: UserInfo, arrived_on: Option<Link>) -> Vec<Action> {
        let own_id = self.membership.id();
        let own_host = self.membership.host();
        let mut actions = Vec::new();

        for link in Link::ALL {
            if Some(link) == arrived_on || self.membership.link_id(link).is_none() {
                continue;
            }
            // Tag as the receiver will see this edge
            let tag = match link {
                Link::Parent => self.membership.side().map(Link::from),
                Link::Left | Link::Right => Some(Link::Parent),
            };
            match self.resolve(link) {
                Ok((next_id, next_host)) => actions.push(Action::Forward {
                    to: next_host,
                    packet: Packet::new(
                        own_id,
                        own_host,
                        Some(next_id),
                        next_host,
                        Body::NewUser {
                            broadcast: Broadcast {
                                from_node_side: tag,
                                user_info: user_info.clone(),
                            },
                        },
                    ),
                }),
                Err(reason) => actions.push(Action::Drop(reason)),
            }
        }
        actions
    }

    /// One unicast hop toward `target`
    fn route(&self, target: NodeId, mut packet: Packet) -> Action {
        let link = match self.membership.next_hop(target) {
            Hop::Local => return Action::Drop(DropReason::Unexpected("route resolved to self")),
            Hop::Via(link) => link,
        };
        match self.resolve(link) {
            Ok((_, next_host)) => {
                packet.from_id = self.membership.id();
                packet.from_host = self.membership.host();
                trace!(target, ?link, %next_host, "Forwarding");
                Action::Forward {
                    to: next_host,
                    packet,
                }
            }
            Err(reason) => Action::Drop(reason),
        }
    }

    fn resolve(&self, link: Link) -> std::result::Result<(NodeId, SocketAddr), DropReason> {
        let id = self
            .membership
            .link_id(link)
            .ok_or(DropReason::NoRoute(link))?;
        let host = self
            .membership
            .host_of(id)
            .ok_or(DropReason::UnknownPeer(id))?;
        Ok((id, host))
    }
}
