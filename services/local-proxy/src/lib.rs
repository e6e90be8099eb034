pub mod error;
pub mod probe;
pub mod proxy;

pub use error::ProxyError;
pub use probe::BackendProbe;
pub use proxy::{
    reason, service_unavailable, LocalProxyServer, ProxyConfig, ProxyEvent, ProxyStatus,
    RelayDirection, SessionId, SessionOutcome,
};
