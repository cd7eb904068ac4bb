//! # Overlay Protocol
//!
//! Packet bodies, per-node membership state, the join handshake and the
//! routing engine that turns inbound packets into actions.
//!
//! ## Components
//! - **message**: closed set of packet bodies and the records they carry
//! - **membership**: identifier, range bounds, tree links, known peers
//! - **handshake**: `get_chat_info` → `find_insert_place` → `connect`
//! - **dispatcher**: exhaustive per-body handlers, relay and flood rules

pub mod dispatcher;
pub mod handshake;
pub mod membership;
pub mod message;
