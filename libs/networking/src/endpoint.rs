//! Host/port endpoints.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use crate::error::NetworkError;

/// Host used when an endpoint leaves the host empty.
pub const ANY_HOST: &str = "0.0.0.0";

/// A `{host, port}` pair as supplied by configuration or callers.
///
/// The host is kept as text so names like `localhost` survive until the
/// moment of binding or connecting. IPv6 literals are stored without brackets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// Host name or IP literal. Empty means all interfaces.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl Endpoint {
    /// Create a new endpoint.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .map(str::to_string)
            .unwrap_or(host);
        Self { host, port }
    }

    /// Host to hand to the resolver; an empty host binds every interface.
    pub fn bind_host(&self) -> &str {
        if self.host.is_empty() {
            ANY_HOST
        } else {
            &self.host
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.bind_host(), self.port)
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl FromStr for Endpoint {
    type Err = NetworkError;

    /// Parse `host:port`, `[v6]:port`, or `:port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((host, port)) = s.rsplit_once(':') else {
            return Err(NetworkError::InvalidEndpoint(format!(
                "missing ':' in {}",
                s
            )));
        };

        if host.contains(':') && !host.starts_with('[') {
            return Err(NetworkError::InvalidEndpoint(format!(
                "IPv6 host must be bracketed: {}",
                s
            )));
        }

        let port: u16 = port
            .parse()
            .map_err(|_| NetworkError::InvalidEndpoint(format!("invalid port in {}", s)))?;

        Ok(Self::new(host, port))
    }
}
