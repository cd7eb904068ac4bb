//! In-memory overlay used by the integration tests.
//!
//! Every node is a bare [`Dispatcher`]; connections are simulated as
//! `(dialer, acceptor)` pairs and packets move through one FIFO, so whole
//! join/flood/route exchanges run deterministically without sockets.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::SocketAddr;

use bst_overlay::core::packet::Packet;
use bst_overlay::error::ProtocolError;
use bst_overlay::protocol::dispatcher::{Action, ChatMessage, ConnId, Dispatcher, DropReason};
use bst_overlay::protocol::handshake::{
    absorb_chat_info, absorb_connect_resp, attach_request, chat_info_request, expect_place,
    insert_place_request,
};
use bst_overlay::protocol::membership::{Membership, MembershipSnapshot};
use bst_overlay::protocol::message::{Body, NodeId, PlaceInfo};

/// Upper bound on processed packets per `run`, catches forwarding loops
const MAX_STEPS: usize = 100_000;

pub fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

#[derive(Debug, Default)]
pub struct Sim {
    pub nodes: BTreeMap<SocketAddr, Dispatcher>,
    ends: HashMap<ConnId, (SocketAddr, SocketAddr)>,
    dialed: HashMap<(SocketAddr, SocketAddr), ConnId>,
    next_conn: ConnId,
    queue: VecDeque<(SocketAddr, ConnId, Packet)>,
    client_inbox: HashMap<SocketAddr, VecDeque<Packet>>,
    /// Every packet a node dispatched, in order
    pub received: HashMap<SocketAddr, Vec<Packet>>,
    pub delivered: HashMap<SocketAddr, Vec<ChatMessage>>,
    pub drops: Vec<(SocketAddr, DropReason)>,
    /// Forward actions executed since the last reset
    pub forwards: usize,
}

/// Outcome of a simulated join
#[derive(Debug, Clone, Copy)]
pub struct Joined {
    pub id: NodeId,
    pub parent: NodeId,
    pub retries: u32,
}

impl Sim {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_root(&mut self, port: u16, id: NodeId) -> SocketAddr {
        let host = addr(port);
        let mut membership = Membership::new(host, Some(format!("user-{port}")));
        membership.become_root(id);
        self.nodes.insert(host, Dispatcher::new(membership));
        host
    }

    /// Join a new node through `bootstrap`, announce it and settle the flood
    pub fn join(&mut self, port: u16, bootstrap: SocketAddr, id: Option<NodeId>) -> Joined {
        let host = addr(port);
        let mut membership = Membership::new(host, Some(format!("user-{port}")));

        let response = self.request(host, bootstrap, chat_info_request(&membership, bootstrap));
        let id = absorb_chat_info(&mut membership, response, id).expect("chat_info");

        let mut retries = 0;
        let parent = loop {
            let (place, response) = self.find_and_connect(&membership, bootstrap);
            match absorb_connect_resp(&mut membership, &place, response) {
                Ok(parent) => break parent,
                Err(ProtocolError::SlotOccupied) => retries += 1,
                Err(e) => panic!("join of {id} failed: {e}"),
            }
        };

        self.nodes.insert(host, Dispatcher::new(membership));
        self.announce(host);
        Joined {
            id,
            parent,
            retries,
        }
    }

    /// One `find_insert_place` + `connect` round for a node not yet serving
    pub fn find_and_connect(
        &mut self,
        membership: &Membership,
        bootstrap: SocketAddr,
    ) -> (PlaceInfo, Packet) {
        let place = self.find_place(membership, bootstrap);
        let response = self.connect(membership, &place);
        (place, response)
    }

    pub fn find_place(
        &mut self,
        membership: &Membership,
        bootstrap: SocketAddr,
    ) -> PlaceInfo {
        let host = membership.host();
        let find = insert_place_request(membership, bootstrap).unwrap();
        expect_place(self.request(host, bootstrap, find)).expect("insert_place")
    }

    pub fn connect(
        &mut self,
        membership: &Membership,
        place: &PlaceInfo,
    ) -> Packet {
        let connect = attach_request(membership, place).unwrap();
        self.request(membership.host(), place.conn_host, connect)
    }

    pub fn announce(&mut self, host: SocketAddr) {
        let actions = self.node_mut(host).announce();
        self.apply(host, None, actions);
        self.run();
    }

    pub fn send_message(&mut self, from: SocketAddr, to: SocketAddr, text: &str) {
        let actions = self
            .node_mut(from)
            .send_user_message(to, text.to_string())
            .expect("send_user_message");
        self.apply(from, None, actions);
        self.run();
    }

    /// Send from a non-serving endpoint and wait for the single answer
    pub fn request(&mut self, client: SocketAddr, to: SocketAddr, packet: Packet) -> Packet {
        self.send(client, to, packet);
        self.run();
        self.client_inbox
            .get_mut(&client)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| panic!("no answer for {client}"))
    }

    pub fn send(&mut self, from: SocketAddr, to: SocketAddr, packet: Packet) {
        let conn = self.dial(from, to);
        self.queue.push_back((to, conn, packet));
    }

    pub fn run(&mut self) {
        let mut steps = 0;
        while let Some((to, conn, packet)) = self.queue.pop_front() {
            steps += 1;
            assert!(steps < MAX_STEPS, "packet storm, forwarding loop suspected");

            match self.nodes.get_mut(&to) {
                Some(node) => {
                    self.received.entry(to).or_default().push(packet.clone());
                    let actions = node.dispatch(conn, packet);
                    self.apply(to, Some(conn), actions);
                }
                None => self.client_inbox.entry(to).or_default().push_back(packet),
            }
        }
    }

    pub fn node(&self, host: SocketAddr) -> &Dispatcher {
        self.nodes.get(&host).expect("unknown node")
    }

    pub fn node_mut(&mut self, host: SocketAddr) -> &mut Dispatcher {
        self.nodes.get_mut(&host).expect("unknown node")
    }

    pub fn snapshot(&self, host: SocketAddr) -> MembershipSnapshot {
        self.node(host).membership().snapshot()
    }

    pub fn snapshots(&self) -> Vec<MembershipSnapshot> {
        self.nodes.values().map(|n| n.membership().snapshot()).collect()
    }

    /// Forget recorded traffic
    pub fn reset_logs(&mut self) {
        self.received.clear();
        self.delivered.clear();
        self.drops.clear();
        self.forwards = 0;
    }

    /// `new_user` packets for `user` that `host` dispatched
    pub fn new_user_copies(&self, host: SocketAddr, user: NodeId) -> usize {
        self.received
            .get(&host)
            .map(|packets| {
                packets
                    .iter()
                    .filter(|p| {
                        matches!(&p.body, Body::NewUser { broadcast } if broadcast.user_info.id == user)
                    })
                    .count()
            })
            .unwrap_or(0)
    }

    fn apply(&mut self, at: SocketAddr, origin: Option<ConnId>, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Reply(packet) => {
                    let conn = origin.expect("reply without an inbound connection");
                    let peer = self.other_end(conn, at);
                    self.queue.push_back((peer, conn, packet));
                }
                Action::Respond { conn, packet } => {
                    let peer = self.other_end(conn, at);
                    self.queue.push_back((peer, conn, packet));
                }
                Action::Forward { to, packet } => {
                    self.forwards += 1;
                    self.send(at, to, packet);
                }
                Action::Deliver(message) => self.delivered.entry(at).or_default().push(message),
                Action::Drop(reason) => self.drops.push((at, reason)),
            }
        }
    }

    fn dial(&mut self, from: SocketAddr, to: SocketAddr) -> ConnId {
        if let Some(conn) = self.dialed.get(&(from, to)) {
            return *conn;
        }
        self.next_conn += 1;
        let conn = self.next_conn;
        self.ends.insert(conn, (from, to));
        self.dialed.insert((from, to), conn);
        conn
    }

    fn other_end(&self, conn: ConnId, me: SocketAddr) -> SocketAddr {
        let (a, b) = self.ends[&conn];
        if me == a {
            b
        } else {
            a
        }
    }
}
