//! # Core Protocol Components
//!
//! Packet envelope, wire encoding and stream framing.
//!
//! ## Components
//! - **Packet**: addressed envelope around a [`Body`](crate::protocol::message::Body)
//! - **Codec**: Tokio codec for framing packets over byte streams
//!
//! ## Wire Format
//! ```text
//! [JSON packet] [\r\n]
//! ```
//!
//! ## Limits
//! - Maximum frame size: 1MB by default (configurable)
//! - Unterminated input beyond the limit closes the connection

pub mod codec;
pub mod packet;
