//! Events surfaced by the proxy server.

use std::net::SocketAddr;

use super::session::{RelayDirection, SessionId, SessionOutcome};

/// Notifications for the process supervisor and the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyEvent {
    /// A client arrived while the backend was down. Fired at most once per
    /// down period; the supervisor is expected to start the backend.
    WakeRequested,
    /// Bytes were relayed (or buffered for relay) by a session.
    Activity {
        session_id: SessionId,
        direction: RelayDirection,
        bytes: usize,
    },
    /// The listener could not be bound. Carries the OS error string.
    ProxyError(String),
    /// A client connection was accepted.
    SessionOpened { session_id: SessionId, peer: SocketAddr },
    /// A session reached its terminal state.
    SessionClosed {
        session_id: SessionId,
        outcome: SessionOutcome,
    },
}
