//! EVA local proxy
//!
//! Keeps a user-facing port alive in front of a local inference backend.
//!
//! This service:
//! - Accepts TCP connections on the configured listen endpoint
//! - Parks clients while the backend is down and requests a wake
//! - Probes the backend and releases parked clients once it answers
//! - Relays bytes both ways, answering 503 when the backend cannot be reached

use anyhow::{Context, Result};
use eva_local_proxy::{BackendProbe, LocalProxyServer, ProxyEvent, SessionOutcome};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to EVA_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting EVA local proxy");
    info!(
        listen = %config.listen,
        backend = %config.backend,
        wait_timeout_ms = config.proxy.wait_timeout.as_millis() as u64,
        connect_timeout_ms = config.proxy.connect_timeout.as_millis() as u64,
        "Configuration loaded"
    );

    let server = LocalProxyServer::new(config.proxy.clone());
    let mut events = server.subscribe().await?;

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            log_event(&event);
        }
    });

    server
        .set_backend_endpoint(&config.backend.host, config.backend.port)
        .await?;
    server
        .start(&config.listen.host, config.listen.port)
        .await
        .with_context(|| format!("Failed to listen on {}", config.listen))?;

    let probe = BackendProbe::new(config.probe_interval);

    tokio::select! {
        result = probe.run(&server, config.backend.clone()) => {
            if let Err(e) = result {
                error!(error = %e, "Backend probe stopped");
            }
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for shutdown signal")?;
            info!("Shutdown requested");
        }
    }

    let terminated = server.stop().await?;
    info!(terminated, "Proxy stopped");
    server.shutdown().await;
    Ok(())
}

fn log_event(event: &ProxyEvent) {
    match event {
        ProxyEvent::WakeRequested => info!("Client waiting, backend wake requested"),
        ProxyEvent::ProxyError(message) => error!(error = %message, "Proxy error"),
        ProxyEvent::SessionOpened { session_id, peer } => {
            debug!(session_id, peer = %peer, "Session opened");
        }
        ProxyEvent::SessionClosed {
            session_id,
            outcome: SessionOutcome::Failed { reason },
        } => warn!(session_id, reason = %reason, "Session failed"),
        ProxyEvent::SessionClosed { session_id, .. } => debug!(session_id, "Session closed"),
        ProxyEvent::Activity { .. } => {}
    }
}
