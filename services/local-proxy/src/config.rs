//! Local proxy configuration.
//!
//! The standalone binary is configured from the environment; embedding
//! applications build a [`ProxyConfig`] directly.

use std::time::Duration;

use anyhow::{Context, Result};
use eva_local_proxy::probe::DEFAULT_PROBE_INTERVAL;
use eva_local_proxy::ProxyConfig;
use eva_networking::Endpoint;

/// Local proxy configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// User-facing listen endpoint.
    pub listen: Endpoint,

    /// Backend the proxy forwards to.
    pub backend: Endpoint,

    /// Session timers.
    pub proxy: ProxyConfig,

    /// Interval between backend reachability probes.
    pub probe_interval: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let listen: Endpoint = std::env::var("EVA_PROXY_LISTEN")
            .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
            .parse()
            .context("EVA_PROXY_LISTEN must be host:port.")?;

        let backend: Endpoint = std::env::var("EVA_PROXY_BACKEND")
            .unwrap_or_else(|_| "127.0.0.1:8081".to_string())
            .parse()
            .context("EVA_PROXY_BACKEND must be host:port.")?;

        let mut proxy = ProxyConfig::default();
        if let Some(ms) = env_millis("EVA_PROXY_WAIT_TIMEOUT_MS")? {
            proxy.wait_timeout = ms;
        }
        if let Some(ms) = env_millis("EVA_PROXY_CONNECT_TIMEOUT_MS")? {
            proxy.connect_timeout = ms;
        }

        let probe_interval = env_millis("EVA_PROXY_PROBE_INTERVAL_MS")?
            .unwrap_or(DEFAULT_PROBE_INTERVAL)
            .max(Duration::from_millis(50));

        let log_level = std::env::var("EVA_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            listen,
            backend,
            proxy,
            probe_interval,
            log_level,
        })
    }
}

fn env_millis(name: &str) -> Result<Option<Duration>> {
    let value: Option<u64> = std::env::var(name)
        .ok()
        .map(|v| v.parse())
        .transpose()
        .with_context(|| format!("{} must be an integer (milliseconds).", name))?;
    Ok(value.map(Duration::from_millis))
}
