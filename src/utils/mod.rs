//! # Utility Modules
//!
//! Supporting utilities shared by the transport, the join handshake and the
//! node lifecycle.
//!
//! ## Components
//! - **Logging**: `tracing-subscriber` setup driven by [`LoggingConfig`](crate::config::LoggingConfig)
//! - **Metrics**: per-node atomic counters
//! - **Timeout**: async timeout wrappers producing protocol errors

pub mod logging;
pub mod metrics;
pub mod timeout;

pub use metrics::{Metrics, MetricsSnapshot};
