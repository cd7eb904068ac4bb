//! Packet envelope and its terminator-delimited wire encoding.
//!
//! ```text
//! [compact JSON packet] [\r\n]
//! ```
//!
//! Compact JSON never emits a raw CR or LF (both are escaped inside strings),
//! so the first terminator in a buffer always ends the current frame.

use crate::config::FRAME_TERMINATOR;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::message::{Body, NodeId};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Addressed packet exchanged between overlay nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    pub from_id: Option<NodeId>,
    pub from_host: SocketAddr,
    pub to_id: Option<NodeId>,
    pub to_host: SocketAddr,
    pub body: Body,
}

impl Packet {
    pub fn new(
        from_id: Option<NodeId>,
        from_host: SocketAddr,
        to_id: Option<NodeId>,
        to_host: SocketAddr,
        body: Body,
    ) -> Self {
        Self {
            from_id,
            from_host,
            to_id,
            to_host,
            body,
        }
    }

    /// Response addressed back to this packet's sender
    pub fn reply(&self, body: Body) -> Self {
        Self {
            from_id: self.to_id,
            from_host: self.to_host,
            to_id: self.from_id,
            to_host: self.from_host,
            body,
        }
    }

    /// Encode into one frame, terminator included
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec(self)?;
        bytes.extend_from_slice(FRAME_TERMINATOR);
        Ok(bytes)
    }

    /// Decode the first frame of `buf`, returning the packet and the bytes after it
    pub fn from_bytes(buf: &[u8]) -> Result<(Self, &[u8])> {
        let end = find_terminator(buf)
            .ok_or_else(|| ProtocolError::Framing(constants::ERR_MISSING_TERMINATOR.into()))?;

        let packet = Self::from_payload(&buf[..end])?;
        Ok((packet, &buf[end + FRAME_TERMINATOR.len()..]))
    }

    /// Decode a frame payload (terminator already stripped)
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(|e| {
            ProtocolError::Framing(format!("{}: {e}", constants::ERR_INVALID_PAYLOAD))
        })
    }
}

/// Offset of the first terminator in `buf`
#[inline]
pub fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(FRAME_TERMINATOR.len())
        .position(|window| window == FRAME_TERMINATOR)
}
