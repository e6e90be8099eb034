//! Lazy-wake TCP proxy.
//!
//! This module provides:
//! - A listener that keeps the user-facing port alive while the backend is down
//! - Per-client sessions that park, connect, and relay
//! - Backend availability and endpoint broadcast to every session
//! - 503 responses when the backend cannot be reached
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> ServerActor (registry) -> ProxySession -> Backend
//!                            |                        |
//!                      WakeRequested            503 on failure
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use eva_local_proxy::{LocalProxyServer, ProxyConfig, ProxyEvent};
//!
//! let proxy = LocalProxyServer::new(ProxyConfig::default());
//! let mut events = proxy.subscribe().await?;
//! proxy.set_backend_endpoint("127.0.0.1", 8081).await?;
//! proxy.start("127.0.0.1", 8080).await?;
//!
//! while let Some(event) = events.recv().await {
//!     if event == ProxyEvent::WakeRequested {
//!         spawn_backend().await;
//!         proxy.set_backend_available(true).await?;
//!     }
//! }
//! ```

mod event;
mod response;
mod server;
mod session;

pub use event::ProxyEvent;
pub use response::service_unavailable;
pub use server::{
    LocalProxyServer, ProxyConfig, ProxyStatus, DEFAULT_BUFFER_SIZE, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_FLUSH_TIMEOUT, DEFAULT_WAIT_TIMEOUT,
};
pub use session::{reason, RelayDirection, SessionId, SessionOutcome};
