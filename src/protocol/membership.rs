//! Membership state of one overlay node.
//!
//! Holds the node's identifier, the identifier range it is authoritative for,
//! its tree links and its local view of known peers. Everything here is pure
//! bookkeeping; the reactor owns the only mutable instance once the node is
//! running.
//!
//! Range ownership: for an attached node `low_bound < id < up_bound`, its left
//! subtree holds ids in `(low_bound, id)` and its right subtree ids in
//! `(id, up_bound)`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::protocol::message::{
    Link, NodeId, PeerRecord, PlaceInfo, Side, UserInfo, ID_RANGE, INF, ROOT_LOW_BOUND,
};

/// What a node knows about a peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: NodeId,
    pub username: Option<String>,
}

/// Tree-position lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodePhase {
    /// No identifier, no bounds
    Unbound,
    /// Identifier known, position not fixed yet
    Joining,
    /// Bounds and parent fixed, serving routing
    Attached,
}

/// Next step for a packet addressed to some identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hop {
    Local,
    Via(Link),
}

/// Where a candidate identifier fits relative to this node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Slot {
    /// The child slot for the candidate is empty here
    Vacant(PlaceInfo),
    /// The slot is occupied; search continues in that child
    Descend(Side),
    /// The candidate lies outside this node's range
    Outside,
    /// The candidate equals this node's identifier
    Taken,
}

/// Read-only copy of a node's membership state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipSnapshot {
    pub host: SocketAddr,
    pub id: Option<NodeId>,
    pub is_root: bool,
    pub phase: NodePhase,
    pub low_bound: NodeId,
    pub up_bound: NodeId,
    pub parent: Option<NodeId>,
    pub left: Option<NodeId>,
    pub right: Option<NodeId>,
    pub side: Option<Side>,
    pub neighbor: Option<NodeId>,
    pub connected: BTreeMap<SocketAddr, PeerInfo>,
}

#[derive(Debug, Clone)]
pub struct Membership {
    host: SocketAddr,
    username: Option<String>,
    id: Option<NodeId>,
    is_root: bool,
    low_bound: NodeId,
    up_bound: NodeId,
    parent: Option<NodeId>,
    left: Option<NodeId>,
    right: Option<NodeId>,
    side: Option<Side>,
    neighbor: Option<NodeId>,
    attached: bool,
    connected: HashMap<SocketAddr, PeerInfo>,
    id2host: HashMap<NodeId, SocketAddr>,
}

impl Membership {
    pub fn new(host: SocketAddr, username: Option<String>) -> Self {
        Self {
            host,
            username,
            id: None,
            is_root: false,
            low_bound: ROOT_LOW_BOUND,
            up_bound: INF,
            parent: None,
            left: None,
            right: None,
            side: None,
            neighbor: None,
            attached: false,
            connected: HashMap::new(),
            id2host: HashMap::new(),
        }
    }

    pub fn host(&self) -> SocketAddr {
        self.host
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn id(&self) -> Option<NodeId> {
        self.id
    }

    pub fn is_root(&self) -> bool {
        self.is_root
    }

    pub fn bounds(&self) -> (NodeId, NodeId) {
        (self.low_bound, self.up_bound)
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn side(&self) -> Option<Side> {
        self.side
    }

    pub fn neighbor(&self) -> Option<NodeId> {
        self.neighbor
    }

    pub fn phase(&self) -> NodePhase {
        match (self.id, self.attached) {
            (None, _) => NodePhase::Unbound,
            (Some(_), false) => NodePhase::Joining,
            (Some(_), true) => NodePhase::Attached,
        }
    }

    pub fn is_attached(&self) -> bool {
        self.phase() == NodePhase::Attached
    }

    pub fn peer(&self, host: &SocketAddr) -> Option<&PeerInfo> {
        self.connected.get(host)
    }

    pub fn host_of(&self, id: NodeId) -> Option<SocketAddr> {
        self.id2host.get(&id).copied()
    }

    pub fn known_ids(&self) -> HashSet<NodeId> {
        self.id2host.keys().copied().collect()
    }

    pub fn peer_count(&self) -> usize {
        self.connected.len()
    }

    /// Draw identifiers from [`ID_RANGE`] until one is absent from `known`,
    /// then take it as this node's identifier.
    pub fn generate_id(&mut self, known: &HashSet<NodeId>) -> NodeId {
        self.generate_id_with(known, &mut rand::rng())
    }

    pub fn generate_id_with<R: Rng>(
        &mut self,
        known: &HashSet<NodeId>,
        rng: &mut R,
    ) -> NodeId {
        let id = loop {
            let candidate = rng.random_range(ID_RANGE);
            if !known.contains(&candidate) && !self.id2host.contains_key(&candidate) {
                break candidate;
            }
        };
        self.assign_id(id);
        id
    }

    /// Take `id` as this node's identifier and record self as a known peer
    pub fn assign_id(&mut self, id: NodeId) {
        self.id = Some(id);
        let info = PeerInfo {
            id,
            username: self.username.clone(),
        };
        self.add_peer(self.host, info);
    }

    /// Insert or overwrite a peer entry. An identifier names one host: a
    /// different host already holding `info.id` is dropped from the table.
    pub fn add_peer(&mut self, host: SocketAddr, info: PeerInfo) {
        if let Some(&holder) = self.id2host.get(&info.id) {
            if holder != host {
                if holder == self.host {
                    warn!(id = info.id, %host, "Peer claims this node's identifier, ignored");
                    return;
                }
                debug!(id = info.id, old = %holder, new = %host, "Identifier moved to another host");
                self.connected.remove(&holder);
            }
        }
        if let Some(previous) = self.connected.get(&host) {
            if previous.id != info.id {
                self.id2host.remove(&previous.id);
            }
        }
        self.id2host.insert(info.id, host);
        self.connected.insert(host, info);
    }

    pub fn add_user(&mut self, user: &UserInfo) {
        self.add_peer(
            user.host,
            PeerInfo {
                id: user.id,
                username: user.username.clone(),
            },
        );
    }

    pub fn merge_records(&mut self, records: &[PeerRecord]) {
        for record in records {
            self.add_peer(
                record.host,
                PeerInfo {
                    id: record.id,
                    username: record.username.clone(),
                },
            );
        }
    }

    /// Start a fresh network with this node as root
    pub fn become_root(&mut self, id: NodeId) {
        self.assign_id(id);
        self.is_root = true;
        self.low_bound = ROOT_LOW_BOUND;
        self.up_bound = INF;
        self.parent = None;
        self.side = None;
        self.neighbor = None;
        self.attached = true;
        debug!(id, "Node is root of a new overlay");
    }

    /// Fix the tree position handed out by a parent's `connect` acceptance
    pub fn adopt_place(&mut self, place: &PlaceInfo, parent_id: NodeId) {
        self.is_root = false;
        self.low_bound = place.low_bound;
        self.up_bound = place.up_bound;
        self.side = Some(place.side);
        self.neighbor = place.neighbor;
        self.parent = Some(parent_id);
        self.attached = true;
        debug!(
            id = ?self.id,
            parent_id,
            side = ?place.side,
            low = place.low_bound,
            up = place.up_bound,
            "Adopted tree position"
        );
    }

    pub fn owns(&self, id: NodeId) -> bool {
        self.low_bound < id && id < self.up_bound
    }

    pub fn child(&self, side: Side) -> Option<NodeId> {
        match side {
            Side::Left => self.left,
            Side::Right => self.right,
        }
    }

    pub fn set_child(&mut self, side: Side, id: NodeId) {
        match side {
            Side::Left => self.left = Some(id),
            Side::Right => self.right = Some(id),
        }
    }

    pub fn link_id(&self, link: Link) -> Option<NodeId> {
        match link {
            Link::Parent => self.parent,
            Link::Left => self.left,
            Link::Right => self.right,
        }
    }

    /// Range a child in `side` owns: this node's range split at its id
    pub fn child_bounds(&self, side: Side) -> Option<(NodeId, NodeId)> {
        let id = self.id?;
        Some(match side {
            Side::Left => (self.low_bound, id),
            Side::Right => (id, self.up_bound),
        })
    }

    /// Locate the insertion point for `candidate` as seen from this node
    pub fn locate_slot(&self, candidate: NodeId) -> Slot {
        let Some(id) = self.id else {
            return Slot::Outside;
        };
        if candidate == id {
            return Slot::Taken;
        }
        if !self.owns(candidate) {
            return Slot::Outside;
        }

        let side = if candidate < id { Side::Left } else { Side::Right };
        if self.child(side).is_some() {
            return Slot::Descend(side);
        }

        let (low_bound, up_bound) = match side {
            Side::Left => (self.low_bound, id),
            Side::Right => (id, self.up_bound),
        };
        Slot::Vacant(PlaceInfo {
            side,
            neighbor: self.child(side.opposite()),
            conn_host: self.host,
            low_bound,
            up_bound,
        })
    }

    /// Unicast rule: descend into the child whose range holds `target`,
    /// otherwise climb to the parent.
    pub fn next_hop(&self, target: NodeId) -> Hop {
        match self.id {
            Some(id) if id == target => Hop::Local,
            Some(id) if self.owns(target) => {
                if target < id {
                    Hop::Via(Link::Left)
                } else {
                    Hop::Via(Link::Right)
                }
            }
            _ => Hop::Via(Link::Parent),
        }
    }

    /// This node's identity as carried in join and broadcast packets
    pub fn user_info(&self) -> Option<UserInfo> {
        Some(UserInfo {
            id: self.id?,
            host: self.host,
            username: self.username.clone(),
        })
    }

    /// `connected` as a list, ordered by identifier
    pub fn chat_view(&self) -> Vec<PeerRecord> {
        let mut records: Vec<PeerRecord> = self
            .connected
            .iter()
            .map(|(host, info)| PeerRecord {
                host: *host,
                id: info.id,
                username: info.username.clone(),
            })
            .collect();
        records.sort_by_key(|record| record.id);
        records
    }

    pub fn snapshot(&self) -> MembershipSnapshot {
        MembershipSnapshot {
            host: self.host,
            id: self.id,
            is_root: self.is_root,
            phase: self.phase(),
            low_bound: self.low_bound,
            up_bound: self.up_bound,
            parent: self.parent,
            left: self.left,
            right: self.right,
            side: self.side,
            neighbor: self.neighbor,
            connected: self
                .connected
                .iter()
                .map(|(host, info)| (*host, info.clone()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn root(id: NodeId) -> Membership {
        let mut m = Membership::new(addr(9000), None);
        m.become_root(id);
        m
    }

    #[test]
    fn test_generate_id_avoids_known_ids() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut scratch = Membership::new(addr(1), None);
        let first = scratch.generate_id_with(&HashSet::new(), &mut StdRng::seed_from_u64(7));

        let mut m = Membership::new(addr(2), None);
        let known: HashSet<NodeId> = [first].into_iter().collect();
        let id = m.generate_id_with(&known, &mut rng);

        assert_ne!(id, first);
        assert!(ID_RANGE.contains(&id));
        assert_eq!(m.id(), Some(id));
        assert_eq!(m.host_of(id), Some(addr(2)));
        assert_eq!(m.phase(), NodePhase::Joining);
    }

    #[test]
    fn test_phase_progression() {
        let mut m = Membership::new(addr(1), None);
        assert_eq!(m.phase(), NodePhase::Unbound);
        m.assign_id(30);
        assert_eq!(m.phase(), NodePhase::Joining);
        let place = PlaceInfo {
            side: Side::Left,
            neighbor: None,
            conn_host: addr(9000),
            low_bound: -1,
            up_bound: 50,
        };
        m.adopt_place(&place, 50);
        assert_eq!(m.phase(), NodePhase::Attached);
        assert_eq!(m.bounds(), (-1, 50));
        assert_eq!(m.parent(), Some(50));
        assert_eq!(m.side(), Some(Side::Left));
    }

    #[test]
    fn test_root_owns_everything() {
        let m = root(50);
        assert!(m.is_root());
        assert_eq!(m.bounds(), (ROOT_LOW_BOUND, INF));
        assert!(m.owns(0));
        assert!(m.owns(INF - 1));
        assert!(!m.owns(ROOT_LOW_BOUND));
    }

    #[test]
    fn test_locate_slot_splits_bounds_at_id() {
        let m = root(50);
        match m.locate_slot(30) {
            Slot::Vacant(place) => {
                assert_eq!(place.side, Side::Left);
                assert_eq!((place.low_bound, place.up_bound), (-1, 50));
                assert_eq!(place.conn_host, addr(9000));
                assert_eq!(place.neighbor, None);
            }
            other => panic!("unexpected slot {other:?}"),
        }
        match m.locate_slot(70) {
            Slot::Vacant(place) => {
                assert_eq!(place.side, Side::Right);
                assert_eq!((place.low_bound, place.up_bound), (50, INF));
            }
            other => panic!("unexpected slot {other:?}"),
        }
        assert_eq!(m.locate_slot(50), Slot::Taken);
    }

    #[test]
    fn test_locate_slot_reports_neighbor_and_descent() {
        let mut m = root(50);
        m.set_child(Side::Left, 30);
        assert_eq!(m.locate_slot(40), Slot::Descend(Side::Left));
        match m.locate_slot(70) {
            Slot::Vacant(place) => assert_eq!(place.neighbor, Some(30)),
            other => panic!("unexpected slot {other:?}"),
        }
    }

    #[test]
    fn test_locate_slot_outside_range() {
        let mut m = Membership::new(addr(1), None);
        m.assign_id(30);
        m.adopt_place(
            &PlaceInfo {
                side: Side::Left,
                neighbor: None,
                conn_host: addr(9000),
                low_bound: -1,
                up_bound: 50,
            },
            50,
        );
        assert_eq!(m.locate_slot(70), Slot::Outside);
        assert_eq!(m.next_hop(70), Hop::Via(Link::Parent));
        assert_eq!(m.next_hop(40), Hop::Via(Link::Right));
        assert_eq!(m.next_hop(10), Hop::Via(Link::Left));
        assert_eq!(m.next_hop(30), Hop::Local);
    }

    #[test]
    fn test_add_peer_keeps_identifiers_unique() {
        let mut m = root(50);
        m.add_peer(addr(9001), PeerInfo { id: 30, username: None });
        m.add_peer(addr(9002), PeerInfo { id: 30, username: None });

        let ids: Vec<NodeId> = m.chat_view().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![30, 50]);
        assert_eq!(m.host_of(30), Some(addr(9002)));
        assert!(m.peer(&addr(9001)).is_none());
    }

    #[test]
    fn test_add_peer_never_evicts_self() {
        let mut m = root(50);
        m.add_peer(addr(9001), PeerInfo { id: 50, username: None });

        assert_eq!(m.host_of(50), Some(addr(9000)));
        assert!(m.peer(&addr(9001)).is_none());
        assert_eq!(m.peer_count(), 1);
    }

    #[test]
    fn test_add_peer_overwrites_stale_id() {
        let mut m = root(50);
        m.add_peer(addr(1), PeerInfo { id: 10, username: None });
        m.add_peer(addr(1), PeerInfo { id: 11, username: None });
        assert_eq!(m.host_of(11), Some(addr(1)));
        assert_eq!(m.host_of(10), None);
        assert_eq!(m.peer_count(), 2);
    }

    #[test]
    fn test_chat_view_sorted_and_includes_self() {
        let mut m = root(50);
        m.add_peer(addr(2), PeerInfo { id: 70, username: Some("c".into()) });
        m.add_peer(addr(1), PeerInfo { id: 30, username: None });
        let ids: Vec<NodeId> = m.chat_view().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![30, 50, 70]);
    }
}
