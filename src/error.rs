//! # Error Types
//!
//! Error handling for the overlay node.
//!
//! This module defines every error variant that can surface from the wire
//! codec, the connection multiplexer, the join handshake and the routing
//! engine.
//!
//! ## Error Categories
//! - **I/O Errors**: socket and file system failures
//! - **Framing Errors**: undecodable or oversized frames (the offending connection is closed)
//! - **Connect Errors**: an outbound dial failed; routing reports it as a boolean failure
//! - **Join Errors**: occupied slots (retried), timeouts (fatal to startup)
//! - **Routing Errors**: unknown peers, packets that have nowhere to go
//!
//! All errors implement `std::error::Error` for interoperability.
//!
//! ## Example Usage
//! ```rust
//! use bst_overlay::error::{ProtocolError, Result};
//! use std::fs::File;
//! use std::io::Read;
//! use tracing::{info, error};
//!
//! fn read_file(path: &str) -> Result<String> {
//!     let mut file = File::open(path).map_err(ProtocolError::Io)?;
//!     let mut contents = String::new();
//!     file.read_to_string(&mut contents).map_err(ProtocolError::Io)?;
//!     Ok(contents)
//! }
//!
//! fn main() {
//!     match read_file("overlay.toml") {
//!         Ok(contents) => info!(contents, "Successfully read file"),
//!         Err(e) => error!(error=%e, "Error reading file"),
//!     }
//! }
//! ```

use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Framing errors
    pub const ERR_MISSING_TERMINATOR: &str = "Frame terminator not found";
    pub const ERR_INVALID_PAYLOAD: &str = "Frame payload is not a valid packet";

    /// Connection errors
    pub const ERR_CONNECT_TIMEOUT: &str = "Connection attempt timed out";

    /// Join errors
    pub const ERR_NO_CANDIDATE_ID: &str = "Joining node has no identifier";
    pub const ERR_PARENT_UNKNOWN: &str = "Connecting host is not a known peer";
}

/// ProtocolError is the primary error type for all overlay operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Framing error: {0}")]
    Framing(String),

    #[error("Frame too large: {0} bytes")]
    OversizedFrame(usize),

    #[error("Failed to connect to {addr}: {reason}")]
    Connect { addr: SocketAddr, reason: String },

    #[error("Requested child slot is already occupied")]
    SlotOccupied,

    #[error("Identifier is already held by another node")]
    IdInUse,

    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    #[error("Join handshake timed out waiting for {0}")]
    JoinTimeout(&'static str),

    #[error("Unexpected message type: {0}")]
    UnexpectedMessage(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timeout occurred")]
    Timeout,

    #[error("Node is not attached to the overlay")]
    NotAttached,

    #[error("Node stopped")]
    NodeStopped,

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
