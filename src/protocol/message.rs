//! Packet bodies and the records they carry.
//!
//! [`Body`] is a closed enum: every packet type the overlay understands is one
//! variant, serialized with an internal `type` tag. A packet in transit is an
//! explicit [`Body::Relay`] envelope wrapping the inner body it carries.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::ops::RangeInclusive;

/// Overlay node identifier
pub type NodeId = i64;

/// Range random identifiers are drawn from
pub const ID_RANGE: RangeInclusive<NodeId> = 10_000_000_000..=90_000_000_000;

/// Exclusive upper bound of the root's range
pub const INF: NodeId = i64::MAX;

/// Exclusive lower bound of the root's range
pub const ROOT_LOW_BOUND: NodeId = -1;

/// Child slot under a parent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }
}

/// Tree edge as seen from the node holding it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Link {
    Parent,
    Left,
    Right,
}

impl Link {
    pub const ALL: [Link; 3] = [Link::Parent, Link::Left, Link::Right];
}

impl From<Side> for Link {
    fn from(side: Side) -> Self {
        match side {
            Side::Left => Link::Left,
            Side::Right => Link::Right,
        }
    }
}

/// Insertion coordinates handed to a joining node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceInfo {
    pub side: Side,
    /// Occupant of the other child slot at the time the place was found
    pub neighbor: Option<NodeId>,
    /// Listening address of the future parent
    pub conn_host: SocketAddr,
    pub low_bound: NodeId,
    pub up_bound: NodeId,
}

/// Identity of a joining node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: NodeId,
    pub host: SocketAddr,
    #[serde(default)]
    pub username: Option<String>,
}

/// One entry of a node's `connected` view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub host: SocketAddr,
    pub id: NodeId,
    #[serde(default)]
    pub username: Option<String>,
}

/// Flood payload of a membership announcement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Broadcast {
    /// Edge the copy arrived on, from the receiver's point of view
    pub from_node_side: Option<Link>,
    pub user_info: UserInfo,
}

/// Outcome of an attach request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConnectStatus {
    Ok,
    Error,
}

/// Packet body, one variant per packet type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Body {
    Connect {
        place_info: PlaceInfo,
        user_info: UserInfo,
    },
    ConnectResp {
        response: ConnectStatus,
        #[serde(default)]
        connected: Vec<PeerRecord>,
    },
    Disconnect,
    Ping,
    GetChatInfo,
    ChatInfo {
        connected: Vec<PeerRecord>,
    },
    Relay {
        inner: Box<Body>,
        client_id: Option<NodeId>,
        client_host: Option<SocketAddr>,
    },
    FindInsertPlace,
    InsertPlace {
        place_info: PlaceInfo,
    },
    NewUser {
        broadcast: Broadcast,
    },
    Message {
        text: String,
    },
}

impl Body {
    /// Wire name of the packet type
    #[inline]
    pub fn opcode(&self) -> &'static str {
        match self {
            Body::Connect { .. } => "connect",
            Body::ConnectResp { .. } => "connect_resp",
            Body::Disconnect => "disconnect",
            Body::Ping => "ping",
            Body::GetChatInfo => "get_chat_info",
            Body::ChatInfo { .. } => "chat_info",
            Body::Relay { .. } => "relay",
            Body::FindInsertPlace => "find_insert_place",
            Body::InsertPlace { .. } => "insert_place",
            Body::NewUser { .. } => "new_user",
            Body::Message { .. } => "message",
        }
    }

    /// Type of the wrapped body for relays, `None` otherwise
    pub fn downtype(&self) -> Option<&'static str> {
        match self {
            Body::Relay { inner, .. } => Some(inner.opcode()),
            _ => None,
        }
    }

    /// Wrap `inner` into a relay envelope on behalf of `client`
    pub fn relay(inner: Body, client_id: NodeId, client_host: SocketAddr) -> Self {
        Body::Relay {
            inner: Box::new(inner),
            client_id: Some(client_id),
            client_host: Some(client_host),
        }
    }
}

impl From<&PeerRecord> for UserInfo {
    fn from(record: &PeerRecord) -> Self {
        UserInfo {
            id: record.id,
            host: record.host,
            username: record.username.clone(),
        }
    }
}
