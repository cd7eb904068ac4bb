//! # Transport Layer
//!
//! TCP connection handling for a running node.
//!
//! ## Components
//! - **connection**: one I/O task per socket, framing packets in both directions
//! - **reactor**: the event loop owning every connection and the routing state
//!
//! ## Ordering
//! Each connection has one decode buffer and one outbound FIFO; frames written
//! to a connection never interleave.

pub mod connection;
pub mod reactor;
