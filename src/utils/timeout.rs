//! Timeout helpers wrapping `tokio::time::timeout` into protocol errors.

use crate::error::{ProtocolError, Result};
use std::future::Future;
use std::time::Duration;

/// General purpose operation timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on a single join handshake step (request sent, full response read)
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on dialing a peer
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Run a future with a timeout, mapping expiry to `ProtocolError::Timeout`.
pub async fn with_timeout<F, T>(future: F, duration: Duration) -> Result<T>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| ProtocolError::Timeout)
}

/// Run a fallible future with a timeout, flattening its own error.
pub async fn with_timeout_error<F, T>(future: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::Timeout),
    }
}
