//! Join protocol: how a new node finds and claims its position in the tree.
//!
//! The exchange runs over short-lived request/response connections before the
//! node's multiplexer starts:
//!
//! 1. `get_chat_info` to the bootstrap node, merging its `connected` view and
//!    picking an identifier unknown to that view.
//! 2. `find_insert_place` to the bootstrap node, answered by `insert_place`
//!    once the request has been relayed to the node owning the empty slot.
//! 3. `connect` to that node. `OK` fixes the position; `ERROR` means another
//!    node won the slot and step 2 is repeated.
//!
//! Each step is a pure request builder plus a pure response absorber, so the
//! same logic drives both the networked [`join_overlay`] and in-memory tests.

use std::collections::HashSet;
use std::net::SocketAddr;

use tracing::{debug, info, instrument, warn};

use crate::config::JoinConfig;
use crate::core::packet::Packet;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::membership::Membership;
use crate::protocol::message::{Body, ConnectStatus, NodeId, PlaceInfo};
use crate::service::client::PeerClient;
use crate::utils::metrics::{Metrics, Timer};

/// Outcome of a completed join
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinReport {
    pub id: NodeId,
    pub parent: NodeId,
    pub place: PlaceInfo,
    /// `connect` attempts answered with `ERROR`
    pub retries: u32,
}

/// Step 1 request
pub fn chat_info_request(membership: &Membership, bootstrap: SocketAddr) -> Packet {
    Packet::new(
        membership.id(),
        membership.host(),
        None,
        bootstrap,
        Body::GetChatInfo,
    )
}

/// Merge a `chat_info` answer and settle this node's identifier.
///
/// A configured `fixed_id` is taken as-is unless the bootstrap view already
/// holds it; otherwise a fresh id is drawn against the received ids.
pub fn absorb_chat_info(
    membership: &mut Membership,
    response: Packet,
    fixed_id: Option<NodeId>,
) -> Result<NodeId> {
    let connected = match response.body {
        Body::ChatInfo { connected } => connected,
        other => return Err(ProtocolError::UnexpectedMessage(other.opcode().to_string())),
    };

    membership.merge_records(&connected);
    if let Some(id) = membership.id() {
        return Ok(id);
    }

    let id = match fixed_id {
        Some(id) if connected.iter().any(|record| record.id == id) => {
            return Err(ProtocolError::ConfigError(format!(
                "node id {id} is already in use"
            )));
        }
        Some(id) => {
            membership.assign_id(id);
            id
        }
        None => {
            let known = membership.known_ids();
            membership.generate_id(&known)
        }
    };
    debug!(id, peers = connected.len(), "Identifier settled");
    Ok(id)
}

/// Step 2 request, keyed on this node's identifier
pub fn insert_place_request(membership: &Membership, bootstrap: SocketAddr) -> Result<Packet> {
    let id = membership
        .id()
        .ok_or_else(|| ProtocolError::UnexpectedMessage(constants::ERR_NO_CANDIDATE_ID.into()))?;
    Ok(Packet::new(
        Some(id),
        membership.host(),
        None,
        bootstrap,
        Body::FindInsertPlace,
    ))
}

/// Step 2 answer. A `connect_resp ERROR` here means the candidate id is
/// already held by a node on the search path.
pub fn expect_place(response: Packet) -> Result<PlaceInfo> {
    match response.body {
        Body::InsertPlace { place_info } => Ok(place_info),
        Body::ConnectResp {
            response: ConnectStatus::Error,
            ..
        } => Err(ProtocolError::IdInUse),
        other => Err(ProtocolError::UnexpectedMessage(other.opcode().to_string())),
    }
}

/// Step 3 request, claiming `place` at its connecting host
pub fn attach_request(membership: &Membership, place: &PlaceInfo) -> Result<Packet> {
    let user_info = membership
        .user_info()
        .ok_or_else(|| ProtocolError::UnexpectedMessage(constants::ERR_NO_CANDIDATE_ID.into()))?;
    let parent_id = membership.peer(&place.conn_host).map(|info| info.id);

    Ok(Packet::new(
        Some(user_info.id),
        membership.host(),
        parent_id,
        place.conn_host,
        Body::Connect {
            place_info: place.clone(),
            user_info,
        },
    ))
}

/// Apply a `connect_resp`. `ERROR` leaves membership untouched and yields
/// [`ProtocolError::SlotOccupied`].
pub fn absorb_connect_resp(
    membership: &mut Membership,
    place: &PlaceInfo,
    response: Packet,
) -> Result<NodeId> {
    let (status, connected) = match response.body {
        Body::ConnectResp {
            response: status,
            connected,
        } => (status, connected),
        other => return Err(ProtocolError::UnexpectedMessage(other.opcode().to_string())),
    };

    if status == ConnectStatus::Error {
        return Err(ProtocolError::SlotOccupied);
    }

    membership.merge_records(&connected);
    let parent_id = response
        .from_id
        .or_else(|| membership.peer(&place.conn_host).map(|info| info.id))
        .ok_or_else(|| ProtocolError::UnknownPeer(constants::ERR_PARENT_UNKNOWN.into()))?;

    membership.adopt_place(place, parent_id);
    Ok(parent_id)
}

/// Run the full join against `bootstrap`, retrying lost attach races.
///
/// Timeouts and dial failures are returned to the caller. A lost slot
/// ([`ProtocolError::SlotOccupied`]) is retried, and so is a generated id
/// refused as [`ProtocolError::IdInUse`] after drawing a fresh one.
#[instrument(skip(membership, config, metrics), fields(host = %membership.host()))]
pub async fn join_overlay(
    membership: &mut Membership,
    bootstrap: SocketAddr,
    fixed_id: Option<NodeId>,
    config: &JoinConfig,
    max_frame_size: usize,
    metrics: &Metrics,
) -> Result<JoinReport> {
    let _timer = Timer::start("join_overlay");
    let response = exchange(
        bootstrap,
        chat_info_request(membership, bootstrap),
        "chat_info",
        config,
        max_frame_size,
    )
    .await?;
    let mut id = absorb_chat_info(membership, response, fixed_id)?;

    let mut retries = 0u32;
    loop {
        metrics.join_attempt();
        let request = insert_place_request(membership, bootstrap)?;
        let response = exchange(bootstrap, request, "insert_place", config, max_frame_size).await?;
        let place = match expect_place(response) {
            Ok(place) => place,
            Err(ProtocolError::IdInUse) if fixed_id.is_none() => {
                retries += 1;
                metrics.join_retry();
                let taken = id;
                id = membership.generate_id(&HashSet::from([taken]));
                warn!(taken, id, retries, "Identifier in use, drew a new one");
                continue;
            }
            Err(ProtocolError::IdInUse) => {
                return Err(ProtocolError::ConfigError(format!(
                    "node id {id} is already in use"
                )));
            }
            Err(e) => return Err(e),
        };
        debug!(side = ?place.side, parent = %place.conn_host, "Got insertion place");

        let request = attach_request(membership, &place)?;
        let response =
            exchange(place.conn_host, request, "connect_resp", config, max_frame_size).await?;

        match absorb_connect_resp(membership, &place, response) {
            Ok(parent) => {
                info!(id, parent, side = ?place.side, retries, "Joined overlay");
                return Ok(JoinReport {
                    id,
                    parent,
                    place,
                    retries,
                });
            }
            Err(ProtocolError::SlotOccupied) => {
                retries += 1;
                metrics.join_retry();
                warn!(id, side = ?place.side, parent = %place.conn_host, retries, "Slot taken, searching again");
            }
            Err(e) => return Err(e),
        }
    }
}

/// One request/response step on a fresh connection
async fn exchange(
    remote: SocketAddr,
    request: Packet,
    awaiting: &'static str,
    config: &JoinConfig,
    max_frame_size: usize,
) -> Result<Packet> {
    let mut client = PeerClient::connect(remote, config.connect_timeout, max_frame_size)
        .await?
        .with_timeouts(config.response_timeout, config.response_timeout);
    debug!(remote = %client.remote(), awaiting, "Sending join request");

    client.request(request).await.map_err(|e| match e {
        ProtocolError::Timeout => ProtocolError::JoinTimeout(awaiting),
        other => other,
    })
}
