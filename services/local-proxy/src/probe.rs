//! Backend readiness probe.
//!
//! Stand-in availability source for running the proxy on its own: it polls
//! the backend with plain TCP connects and flips `set_backend_available` on
//! transitions only. An embedding application that supervises the backend
//! process drives the setters itself and does not need this.

use std::time::Duration;

use eva_networking::Endpoint;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::{debug, info};

use crate::error::ProxyError;
use crate::proxy::LocalProxyServer;

/// Default interval between probes.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(1);

/// Default connect timeout for a single probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Periodic TCP reachability check for the backend.
#[derive(Debug, Clone)]
pub struct BackendProbe {
    /// Time between probes.
    pub interval: Duration,
    /// Connect timeout per probe.
    pub connect_timeout: Duration,
}

impl BackendProbe {
    /// Create a probe with the default connect timeout.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            connect_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    /// Whether a TCP connection to `endpoint` succeeds within the timeout.
    pub async fn probe_once(&self, endpoint: &Endpoint) -> bool {
        match timeout(self.connect_timeout, TcpStream::connect(endpoint.to_string())).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!(backend = %endpoint, error = %e, "Backend probe failed");
                false
            }
            Err(_) => {
                debug!(backend = %endpoint, "Backend probe timed out");
                false
            }
        }
    }

    /// Probe forever, reporting availability changes to `server`.
    ///
    /// Returns only when the server is gone.
    pub async fn run(&self, server: &LocalProxyServer, endpoint: Endpoint) -> Result<(), ProxyError> {
        let mut last = None;

        loop {
            let up = self.probe_once(&endpoint).await;
            if last != Some(up) {
                info!(backend = %endpoint, available = up, "Backend availability changed");
                server.set_backend_available(up).await?;
                last = Some(up);
            }
            sleep(self.interval).await;
        }
    }
}

impl Default for BackendProbe {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_probe_reports_listening_backend() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = Endpoint::from(listener.local_addr().unwrap());

        assert!(BackendProbe::default().probe_once(&endpoint).await);
    }

    #[tokio::test]
    async fn test_probe_reports_closed_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = Endpoint::from(listener.local_addr().unwrap());
        drop(listener);

        assert!(!BackendProbe::default().probe_once(&endpoint).await);
    }

    #[tokio::test]
    async fn test_run_marks_backend_available() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = Endpoint::from(listener.local_addr().unwrap());
        let server = LocalProxyServer::new(Default::default());
        let probe = BackendProbe::new(Duration::from_millis(20));

        let _ = timeout(Duration::from_millis(200), probe.run(&server, endpoint)).await;

        assert!(server.status().await.unwrap().backend_ready);
        server.shutdown().await;
    }
}
