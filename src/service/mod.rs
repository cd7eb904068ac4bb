//! # Node Services
//!
//! - **client**: request/response connection used by the join handshake
//! - **node**: bind, join and serve; the public handle to a running node

pub mod client;
pub mod node;

pub use node::{Node, NodeHandle};
