//! Listener, session registry, and backend-availability broadcast.
//!
//! [`LocalProxyServer`] is a handle to a single coordinating task. That task
//! is the only place the registry (active sessions + pending set), the
//! readiness flag, and the wake debounce flag are mutated; every public
//! operation is a message to it with a oneshot reply, so effects are complete
//! by the time the call returns.
//!
//! The backend endpoint lives in a `watch` channel shared with every session,
//! so a change is visible to all sessions before `set_backend_endpoint`
//! returns.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::time::Duration;

use eva_events::EventHub;
use eva_networking::Endpoint;
use futures_util::future::join_all;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn, Instrument};

use super::event::ProxyEvent;
use super::session::{
    reason, ProxySession, SessionCommand, SessionId, SessionOutcome, SessionReport,
    SessionSettings,
};
use crate::error::ProxyError;

/// Default time a client may wait for the backend to come up.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on a single backend connect attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Default bound on writing a synthesized response.
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Default relay buffer size per direction.
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Backend endpoint before anyone sets one.
pub const DEFAULT_BACKEND_HOST: &str = "127.0.0.1";

/// Delay before retrying after an accept error.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Slack on top of the flush timeout before an unresponsive session is aborted.
const TERMINATE_GRACE: Duration = Duration::from_secs(1);

/// Configuration for a proxy server.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// How long a session accepted while the backend is down waits for it.
    pub wait_timeout: Duration,
    /// Bound on a backend connect attempt.
    pub connect_timeout: Duration,
    /// Bound on writing a 503 to a client.
    pub flush_timeout: Duration,
    /// Relay buffer size per direction.
    pub buffer_size: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl ProxyConfig {
    pub fn with_wait_timeout(mut self, wait_timeout: Duration) -> Self {
        self.wait_timeout = wait_timeout;
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn with_flush_timeout(mut self, flush_timeout: Duration) -> Self {
        self.flush_timeout = flush_timeout;
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            wait_timeout: self.wait_timeout,
            connect_timeout: self.connect_timeout,
            flush_timeout: self.flush_timeout,
            buffer_size: self.buffer_size.max(1),
        }
    }
}

/// Point-in-time view of the server state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyStatus {
    /// Bound listen address, if listening.
    pub listen_addr: Option<SocketAddr>,
    /// Current backend endpoint.
    pub backend: Endpoint,
    /// Whether the backend is marked available.
    pub backend_ready: bool,
    /// Sessions tracked by the registry.
    pub active_sessions: usize,
    /// Sessions parked until the next ready transition.
    pub pending_sessions: usize,
}

enum ServerMessage {
    Start {
        endpoint: Endpoint,
        reply: oneshot::Sender<Result<SocketAddr, ProxyError>>,
    },
    Stop {
        reply: oneshot::Sender<usize>,
    },
    SetBackendEndpoint {
        endpoint: Endpoint,
        reply: oneshot::Sender<()>,
    },
    SetBackendAvailable {
        ready: bool,
        reply: oneshot::Sender<()>,
    },
    ShutdownSessions {
        reason: String,
        reply: oneshot::Sender<usize>,
    },
    Subscribe {
        reply: oneshot::Sender<mpsc::UnboundedReceiver<ProxyEvent>>,
    },
    Status {
        reply: oneshot::Sender<ProxyStatus>,
    },
    Shutdown,
}

/// Handle to a running proxy server.
///
/// Dropping the handle shuts the server down: events are muted first, then
/// the listener and every session are closed.
pub struct LocalProxyServer {
    mailbox: mpsc::UnboundedSender<ServerMessage>,
    task: Option<JoinHandle<()>>,
}

impl LocalProxyServer {
    /// Spawn the coordinating task. Must be called within a tokio runtime.
    pub fn new(config: ProxyConfig) -> Self {
        let (mailbox, inbox) = mpsc::unbounded_channel();
        let actor = ServerActor::new(config, inbox);
        let task = tokio::spawn(actor.run().instrument(tracing::info_span!("local_proxy")));

        Self {
            mailbox,
            task: Some(task),
        }
    }

    /// Bind the listening socket.
    ///
    /// Already listening on the same endpoint is a no-op; a different endpoint
    /// stops the current listener first. Bind failures also raise
    /// [`ProxyEvent::ProxyError`].
    pub async fn start(&self, host: &str, port: u16) -> Result<SocketAddr, ProxyError> {
        let endpoint = Endpoint::new(host, port);
        self.request(|reply| ServerMessage::Start { endpoint, reply })
            .await?
    }

    /// Close the listener and fail every live session with "proxy stopped".
    ///
    /// Returns the number of sessions terminated by this call.
    pub async fn stop(&self) -> Result<usize, ProxyError> {
        self.request(|reply| ServerMessage::Stop { reply }).await
    }

    /// Point all future and in-flight sessions at a new backend.
    pub async fn set_backend_endpoint(&self, host: &str, port: u16) -> Result<(), ProxyError> {
        let endpoint = Endpoint::new(host, port);
        self.request(|reply| ServerMessage::SetBackendEndpoint { endpoint, reply })
            .await
    }

    /// Mark the backend available or unavailable.
    pub async fn set_backend_available(&self, ready: bool) -> Result<(), ProxyError> {
        self.request(|reply| ServerMessage::SetBackendAvailable { ready, reply })
            .await
    }

    /// Fail every tracked session with `reason`, synchronously.
    ///
    /// Returns the number of sessions terminated by this call.
    pub async fn shutdown_sessions(&self, reason: &str) -> Result<usize, ProxyError> {
        let reason = reason.to_string();
        self.request(|reply| ServerMessage::ShutdownSessions { reason, reply })
            .await
    }

    /// Register an event listener.
    pub async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<ProxyEvent>, ProxyError> {
        self.request(|reply| ServerMessage::Subscribe { reply }).await
    }

    /// Snapshot of listener, backend, and registry state.
    pub async fn status(&self) -> Result<ProxyStatus, ProxyError> {
        self.request(|reply| ServerMessage::Status { reply }).await
    }

    /// Whether the listener is bound.
    pub async fn is_listening(&self) -> bool {
        self.listen_addr().await.is_some()
    }

    /// Bound listen address, if any.
    pub async fn listen_addr(&self) -> Option<SocketAddr> {
        self.status().await.ok().and_then(|s| s.listen_addr)
    }

    /// Stop the server and wait for its task to finish.
    pub async fn shutdown(mut self) {
        let _ = self.mailbox.send(ServerMessage::Shutdown);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Proxy server task failed");
            }
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> ServerMessage,
    ) -> Result<T, ProxyError> {
        let (reply, response) = oneshot::channel();
        self.mailbox
            .send(build(reply))
            .map_err(|_| ProxyError::Stopped)?;
        response.await.map_err(|_| ProxyError::Stopped)
    }
}

impl Drop for LocalProxyServer {
    fn drop(&mut self) {
        let _ = self.mailbox.send(ServerMessage::Shutdown);
    }
}

/// A connection handed over by the accept task.
struct Accepted {
    generation: u64,
    stream: TcpStream,
    peer: SocketAddr,
}

struct BoundListener {
    requested: Endpoint,
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl BoundListener {
    fn matches(&self, endpoint: &Endpoint) -> bool {
        self.requested.host == endpoint.host
            && (self.requested.port == endpoint.port || self.local_addr.port() == endpoint.port)
    }
}

struct SessionHandle {
    peer: SocketAddr,
    commands: mpsc::UnboundedSender<SessionCommand>,
    task: JoinHandle<()>,
}

struct ServerActor {
    config: ProxyConfig,
    inbox: mpsc::UnboundedReceiver<ServerMessage>,
    accepted_tx: mpsc::UnboundedSender<Accepted>,
    accepted_rx: mpsc::UnboundedReceiver<Accepted>,
    reports_tx: mpsc::UnboundedSender<SessionReport>,
    reports_rx: mpsc::UnboundedReceiver<SessionReport>,
    listener: Option<BoundListener>,
    listener_generation: u64,
    backend: watch::Sender<Endpoint>,
    backend_ready: bool,
    wake_pending: bool,
    sessions: BTreeMap<SessionId, SessionHandle>,
    pending: BTreeSet<SessionId>,
    next_session_id: SessionId,
    events: EventHub<ProxyEvent>,
}

impl ServerActor {
    fn new(config: ProxyConfig, inbox: mpsc::UnboundedReceiver<ServerMessage>) -> Self {
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        let (backend, _) = watch::channel(Endpoint::new(DEFAULT_BACKEND_HOST, 0));

        Self {
            config,
            inbox,
            accepted_tx,
            accepted_rx,
            reports_tx,
            reports_rx,
            listener: None,
            listener_generation: 0,
            backend,
            backend_ready: false,
            wake_pending: false,
            sessions: BTreeMap::new(),
            pending: BTreeSet::new(),
            next_session_id: 1,
            events: EventHub::new(),
        }
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                msg = self.inbox.recv() => match msg {
                    Some(ServerMessage::Shutdown) | None => break,
                    Some(msg) => self.handle(msg).await,
                },
                Some(accepted) = self.accepted_rx.recv() => self.on_accepted(accepted),
                Some(report) = self.reports_rx.recv() => self.on_report(report),
            }
        }

        self.teardown().await;
    }

    async fn handle(&mut self, msg: ServerMessage) {
        match msg {
            ServerMessage::Start { endpoint, reply } => {
                let result = self.start(endpoint).await;
                let _ = reply.send(result);
            }
            ServerMessage::Stop { reply } => {
                let terminated = self.stop().await;
                let _ = reply.send(terminated);
            }
            ServerMessage::SetBackendEndpoint { endpoint, reply } => {
                self.set_backend_endpoint(endpoint);
                let _ = reply.send(());
            }
            ServerMessage::SetBackendAvailable { ready, reply } => {
                self.set_backend_available(ready);
                let _ = reply.send(());
            }
            ServerMessage::ShutdownSessions { reason, reply } => {
                let terminated = self.shutdown_sessions(&reason).await;
                let _ = reply.send(terminated);
            }
            ServerMessage::Subscribe { reply } => {
                let _ = reply.send(self.events.subscribe());
            }
            ServerMessage::Status { reply } => {
                let _ = reply.send(self.status());
            }
            ServerMessage::Shutdown => {}
        }
    }

    async fn start(&mut self, endpoint: Endpoint) -> Result<SocketAddr, ProxyError> {
        if let Some(listener) = &self.listener {
            if listener.matches(&endpoint) {
                debug!(listen_addr = %listener.local_addr, "Already listening");
                return Ok(listener.local_addr);
            }
            self.stop().await;
        }

        let bound = match TcpListener::bind((endpoint.bind_host(), endpoint.port)).await {
            Ok(listener) => listener.local_addr().map(|addr| (listener, addr)),
            Err(e) => Err(e),
        };

        let (listener, local_addr) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                error!(endpoint = %endpoint, error = %e, "Failed to bind proxy listener");
                self.events.emit(ProxyEvent::ProxyError(e.to_string()));
                return Err(ProxyError::Bind {
                    endpoint,
                    source: e,
                });
            }
        };

        self.listener_generation += 1;
        let task = tokio::spawn(
            accept_loop(listener, self.listener_generation, self.accepted_tx.clone())
                .instrument(tracing::info_span!("listener", addr = %local_addr)),
        );

        info!(listen_addr = %local_addr, "Proxy listening");
        self.listener = Some(BoundListener {
            requested: endpoint,
            local_addr,
            task,
        });
        Ok(local_addr)
    }

    async fn stop(&mut self) -> usize {
        if let Some(listener) = self.listener.take() {
            listener.task.abort();
            info!(listen_addr = %listener.local_addr, "Proxy listener closed");
        }
        self.shutdown_sessions(reason::PROXY_STOPPED).await
    }

    fn set_backend_endpoint(&mut self, endpoint: Endpoint) {
        info!(
            backend = %endpoint,
            sessions = self.sessions.len(),
            "Backend endpoint updated"
        );
        self.backend.send_replace(endpoint);
    }

    fn set_backend_available(&mut self, ready: bool) {
        if self.backend_ready == ready {
            return;
        }

        self.backend_ready = ready;
        self.wake_pending = false;

        if ready {
            info!(pending = self.pending.len(), "Backend available");
            for id in std::mem::take(&mut self.pending) {
                if let Some(session) = self.sessions.get(&id) {
                    let _ = session.commands.send(SessionCommand::BackendReady);
                }
            }
        } else {
            info!(sessions = self.sessions.len(), "Backend unavailable");
            self.pending.extend(self.sessions.keys().copied());
        }
    }

    async fn shutdown_sessions(&mut self, reason: &str) -> usize {
        let sessions = std::mem::take(&mut self.sessions);
        self.pending.clear();

        if sessions.is_empty() {
            return 0;
        }
        info!(sessions = sessions.len(), reason = %reason, "Shutting down sessions");

        // A session gets its own flush bound to write the 503, plus slack.
        let ack_timeout = self.config.flush_timeout + TERMINATE_GRACE;
        let acks = sessions.into_iter().filter_map(|(id, session)| {
            let (ack, outcome) = oneshot::channel();
            let command = SessionCommand::Terminate {
                reason: reason.to_string(),
                ack,
            };
            if session.commands.send(command).is_err() {
                debug!(session_id = id, peer = %session.peer, "Session already finished");
                return None;
            }

            let reason = reason.to_string();
            Some(async move {
                let outcome = match timeout(ack_timeout, outcome).await {
                    Ok(Ok(outcome)) => Some(outcome),
                    Ok(Err(_)) => None,
                    Err(_) => {
                        warn!(session_id = id, "Session did not acknowledge terminate, aborting");
                        session.task.abort();
                        Some(SessionOutcome::Failed { reason })
                    }
                };
                (id, outcome)
            })
        });

        let mut terminated = 0;
        for (id, outcome) in join_all(acks).await {
            match outcome {
                Some(outcome) => {
                    terminated += 1;
                    self.events.emit(ProxyEvent::SessionClosed {
                        session_id: id,
                        outcome,
                    });
                }
                None => debug!(session_id = id, "Session finished before terminate"),
            }
        }
        terminated
    }

    fn on_accepted(&mut self, accepted: Accepted) {
        let Accepted {
            generation,
            stream,
            peer,
        } = accepted;

        if self.listener.is_none() || generation != self.listener_generation {
            debug!(peer = %peer, "Dropping connection from a closed listener");
            return;
        }

        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY on client socket");
        }

        let id = self.next_session_id;
        self.next_session_id += 1;

        let (commands, inbox) = mpsc::unbounded_channel();
        let session = ProxySession::new(
            id,
            peer,
            stream,
            self.backend.subscribe(),
            inbox,
            self.reports_tx.clone(),
            self.config.session_settings(),
        );

        debug!(session_id = id, peer = %peer, ready = self.backend_ready, "Session accepted");
        self.events.emit(ProxyEvent::SessionOpened {
            session_id: id,
            peer,
        });

        let ready = self.backend_ready;
        if !ready {
            self.pending.insert(id);
        }

        let task = tokio::spawn(
            session
                .run(ready)
                .instrument(tracing::info_span!("session", session_id = id, peer = %peer)),
        );
        self.sessions.insert(
            id,
            SessionHandle {
                peer,
                commands,
                task,
            },
        );

        if !ready {
            self.request_wake();
        }
    }

    fn on_report(&mut self, report: SessionReport) {
        match report {
            SessionReport::Activity {
                session_id,
                direction,
                bytes,
            } => {
                self.events.emit(ProxyEvent::Activity {
                    session_id,
                    direction,
                    bytes,
                });
            }
            SessionReport::Finished {
                session_id,
                outcome,
            } => {
                self.sessions.remove(&session_id);
                self.pending.remove(&session_id);
                debug!(session_id, outcome = ?outcome, "Session finished");
                self.events.emit(ProxyEvent::SessionClosed {
                    session_id,
                    outcome,
                });
            }
        }
    }

    /// Fire `WakeRequested` at most once per down period.
    fn request_wake(&mut self) {
        if self.backend_ready || self.wake_pending {
            return;
        }
        self.wake_pending = true;
        info!("Requesting backend wake");
        self.events.emit(ProxyEvent::WakeRequested);
    }

    fn status(&self) -> ProxyStatus {
        ProxyStatus {
            listen_addr: self.listener.as_ref().map(|l| l.local_addr),
            backend: self.backend.borrow().clone(),
            backend_ready: self.backend_ready,
            active_sessions: self.sessions.len(),
            pending_sessions: self.pending.len(),
        }
    }

    /// Mute listeners, then close the listener and every session.
    async fn teardown(&mut self) {
        self.events.mute();
        let terminated = self.stop().await;
        debug!(terminated, "Proxy server task exiting");
    }
}

async fn accept_loop(listener: TcpListener, generation: u64, accepted: mpsc::UnboundedSender<Accepted>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let handoff = Accepted {
                    generation,
                    stream,
                    peer,
                };
                if accepted.send(handoff).is_err() {
                    break;
                }
            }
            Err(e) => {
                error!(error = %e, "Accept error");
                // Brief sleep to avoid tight loop on persistent errors
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_config_default() {
        let config = ProxyConfig::default();
        assert_eq!(config.wait_timeout, Duration::from_secs(30));
        assert_eq!(config.connect_timeout, Duration::from_secs(15));
        assert_eq!(config.buffer_size, DEFAULT_BUFFER_SIZE);
    }

    #[tokio::test]
    async fn test_listener_matches_requested_or_bound_port() {
        let listener = BoundListener {
            requested: Endpoint::new("127.0.0.1", 0),
            local_addr: "127.0.0.1:41000".parse().unwrap(),
            task: tokio::spawn(async {}),
        };

        assert!(listener.matches(&Endpoint::new("127.0.0.1", 0)));
        assert!(listener.matches(&Endpoint::new("127.0.0.1", 41000)));
        assert!(!listener.matches(&Endpoint::new("127.0.0.1", 41001)));
        assert!(!listener.matches(&Endpoint::new("0.0.0.0", 41000)));
    }

    #[tokio::test]
    async fn test_ready_without_pending_sessions_is_noop() {
        let server = LocalProxyServer::new(ProxyConfig::default());
        server.set_backend_available(true).await.unwrap();
        server.set_backend_available(true).await.unwrap();

        let status = server.status().await.unwrap();
        assert!(status.backend_ready);
        assert_eq!(status.active_sessions, 0);
        assert_eq!(status.pending_sessions, 0);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_backend_endpoint_is_recorded() {
        let server = LocalProxyServer::new(ProxyConfig::default());
        assert_eq!(
            server.status().await.unwrap().backend,
            Endpoint::new(DEFAULT_BACKEND_HOST, 0)
        );

        server.set_backend_endpoint("127.0.0.1", 9090).await.unwrap();
        assert_eq!(
            server.status().await.unwrap().backend,
            Endpoint::new("127.0.0.1", 9090)
        );
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_without_listener_is_harmless() {
        let server = LocalProxyServer::new(ProxyConfig::default());
        assert_eq!(server.stop().await.unwrap(), 0);
        assert!(!server.is_listening().await);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_calls_after_shutdown_report_stopped() {
        let server = LocalProxyServer::new(ProxyConfig::default());
        let mailbox = server.mailbox.clone();
        server.shutdown().await;

        let (reply, _rx) = oneshot::channel();
        assert!(mailbox.send(ServerMessage::Status { reply }).is_err());
    }
}
