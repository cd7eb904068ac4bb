//! # bst-overlay
//!
//! Peer-to-peer chat overlay whose nodes form a distributed binary search tree
//! keyed by random 64-bit identifiers.
//!
//! Every node owns an open identifier range `(low_bound, up_bound)` and splits
//! it at its own id between its left and right child. New nodes join through
//! any existing node; requests are relayed along the tree to the node owning
//! the empty slot. Once attached, a node announces itself with a loop-free
//! flood and routes unicast chat messages hop by hop.
//!
//! ## Layout
//! - [`core`]: packet envelope, JSON + `\r\n` framing, Tokio codec
//! - [`protocol`]: packet bodies, membership state, join handshake, routing
//! - [`transport`]: per-connection I/O tasks and the reactor event loop
//! - [`service`]: node lifecycle and the handle used by applications
//! - [`config`], [`error`], [`utils`]: configuration, errors, logging,
//!   timeouts and metrics

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use config::OverlayConfig;
pub use crate::core::packet::Packet;
pub use error::{ProtocolError, Result};
pub use protocol::dispatcher::ChatMessage;
pub use protocol::message::{Body, NodeId};
pub use service::{Node, NodeHandle};
