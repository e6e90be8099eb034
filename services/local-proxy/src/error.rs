//! Proxy errors.

use std::io;

use eva_networking::Endpoint;
use thiserror::Error;

/// Errors returned by [`crate::LocalProxyServer`] operations.
///
/// Per-session failures never surface here; they become 503 responses.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The listening socket could not be bound.
    #[error("failed to listen on {endpoint}: {source}")]
    Bind {
        endpoint: Endpoint,
        #[source]
        source: io::Error,
    },

    /// The server task is gone.
    #[error("proxy server stopped")]
    Stopped,
}
