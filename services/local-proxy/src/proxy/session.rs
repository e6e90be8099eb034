//! Per-client forwarding state machine.
//!
//! A session owns the accepted client stream and, once the backend is up, a
//! single backend stream. Phases:
//!
//! ```text
//! WaitingForBackend --ready--> Connecting --connected--> Connected
//!        |                         |                        |
//!        +--timeout--> 503         +--error/timeout--> 503  +--backend gone--> 503
//!                                                           +--client gone---> close
//! ```
//!
//! Sessions never touch the server registry. They report activity and their
//! final outcome over a channel, and the server removes them.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use eva_networking::Endpoint;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use super::response::service_unavailable;

/// Identifier assigned to each accepted client connection.
pub type SessionId = u64;

/// Reasons carried in synthesized 503 responses.
pub mod reason {
    /// Wait or connect timer expired.
    pub const BACKEND_TIMEOUT: &str = "backend timeout";
    /// Backend connection attempt failed.
    pub const BACKEND_UNAVAILABLE: &str = "backend unavailable";
    /// Backend closed an established connection.
    pub const BACKEND_DISCONNECTED: &str = "backend disconnected";
    /// Backend socket failed after connecting.
    pub const BACKEND_ERROR: &str = "backend error";
    /// Server stopped while the session was live.
    pub const PROXY_STOPPED: &str = "proxy stopped";
}

/// Direction of a relayed chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayDirection {
    ClientToBackend,
    BackendToClient,
}

/// How a session ended. Reported exactly once per session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// A 503 carrying `reason` was sent and both sockets closed.
    Failed { reason: String },
    /// Closed without a synthesized response.
    Closed,
}

/// Commands the server sends to a live session.
#[derive(Debug)]
pub(crate) enum SessionCommand {
    /// The backend became available; leave the waiting phase.
    BackendReady,
    /// Fail immediately with `reason` and acknowledge with the outcome.
    Terminate {
        reason: String,
        ack: oneshot::Sender<SessionOutcome>,
    },
}

/// Reports a session sends back to the server.
#[derive(Debug)]
pub(crate) enum SessionReport {
    Activity {
        session_id: SessionId,
        direction: RelayDirection,
        bytes: usize,
    },
    /// Self-initiated termination. Sessions ended by `Terminate` answer
    /// through the ack instead.
    Finished {
        session_id: SessionId,
        outcome: SessionOutcome,
    },
}

/// Timers and buffer sizing for sessions.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// How long a session waits for the backend to become available.
    pub wait_timeout: Duration,
    /// Bound on a single backend connect attempt.
    pub connect_timeout: Duration,
    /// Bound on writing a synthesized response to the client.
    pub flush_timeout: Duration,
    /// Read buffer size per direction.
    pub buffer_size: usize,
}

enum Finish {
    Fail(String),
    Close,
    Terminated {
        reason: String,
        ack: oneshot::Sender<SessionOutcome>,
    },
}

pub(crate) struct ProxySession {
    id: SessionId,
    peer: SocketAddr,
    client: TcpStream,
    backend: Option<TcpStream>,
    connected_to: Option<Endpoint>,
    pending: BytesMut,
    endpoint: watch::Receiver<Endpoint>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    reports: mpsc::UnboundedSender<SessionReport>,
    settings: SessionSettings,
}

impl ProxySession {
    pub(crate) fn new(
        id: SessionId,
        peer: SocketAddr,
        client: TcpStream,
        endpoint: watch::Receiver<Endpoint>,
        commands: mpsc::UnboundedReceiver<SessionCommand>,
        reports: mpsc::UnboundedSender<SessionReport>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            id,
            peer,
            client,
            backend: None,
            connected_to: None,
            pending: BytesMut::new(),
            endpoint,
            commands,
            reports,
            settings,
        }
    }

    /// Drive the session to completion.
    pub(crate) async fn run(mut self, backend_ready: bool) {
        let finish = self.drive(backend_ready).await;

        match finish {
            Finish::Fail(reason) => {
                self.send_unavailable(&reason).await;
                self.report(SessionReport::Finished {
                    session_id: self.id,
                    outcome: SessionOutcome::Failed { reason },
                });
            }
            Finish::Close => {
                debug!("Session closed");
                self.report(SessionReport::Finished {
                    session_id: self.id,
                    outcome: SessionOutcome::Closed,
                });
            }
            Finish::Terminated { reason, ack } => {
                self.send_unavailable(&reason).await;
                let _ = ack.send(SessionOutcome::Failed { reason });
            }
        }
    }

    async fn drive(&mut self, backend_ready: bool) -> Finish {
        if !backend_ready {
            if let Some(finish) = self.wait_for_backend().await {
                return finish;
            }
        }

        if let Some(finish) = self.connect_backend().await {
            return finish;
        }

        self.relay().await
    }

    /// Park until the server reports the backend ready.
    ///
    /// Returns `None` when the session should go on to connect.
    async fn wait_for_backend(&mut self) -> Option<Finish> {
        debug!(wait_timeout = ?self.settings.wait_timeout, "Waiting for backend");

        let deadline = sleep(self.settings.wait_timeout);
        tokio::pin!(deadline);
        let mut buf = vec![0u8; self.settings.buffer_size];

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    info!("Backend did not become ready in time");
                    return Some(Finish::Fail(reason::BACKEND_TIMEOUT.to_string()));
                }
                cmd = self.commands.recv() => match cmd {
                    Some(SessionCommand::BackendReady) => return None,
                    Some(SessionCommand::Terminate { reason, ack }) => {
                        return Some(Finish::Terminated { reason, ack });
                    }
                    None => return Some(Finish::Close),
                },
                read = self.client.read(&mut buf) => match read {
                    Ok(0) | Err(_) => return Some(Finish::Close),
                    Ok(n) => self.buffer_client_bytes(&buf[..n]),
                },
            }
        }
    }

    /// Make the single backend connection attempt for this ready transition.
    async fn connect_backend(&mut self) -> Option<Finish> {
        let endpoint = self.endpoint.borrow_and_update().clone();
        debug!(backend = %endpoint, "Connecting to backend");

        let connect = timeout(
            self.settings.connect_timeout,
            TcpStream::connect(endpoint.to_string()),
        );
        tokio::pin!(connect);
        let mut buf = vec![0u8; self.settings.buffer_size];

        let backend = loop {
            tokio::select! {
                result = &mut connect => match result {
                    Ok(Ok(stream)) => break stream,
                    Ok(Err(e)) => {
                        warn!(backend = %endpoint, error = %e, "Backend connection failed");
                        return Some(Finish::Fail(reason::BACKEND_UNAVAILABLE.to_string()));
                    }
                    Err(_) => {
                        warn!(backend = %endpoint, "Backend connect timeout");
                        return Some(Finish::Fail(reason::BACKEND_TIMEOUT.to_string()));
                    }
                },
                cmd = self.commands.recv() => match cmd {
                    Some(SessionCommand::BackendReady) => {}
                    Some(SessionCommand::Terminate { reason, ack }) => {
                        return Some(Finish::Terminated { reason, ack });
                    }
                    None => return Some(Finish::Close),
                },
                read = self.client.read(&mut buf) => match read {
                    Ok(0) | Err(_) => return Some(Finish::Close),
                    Ok(n) => self.buffer_client_bytes(&buf[..n]),
                },
            }
        };

        if let Err(e) = backend.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY on backend socket");
        }
        debug!(backend = %endpoint, buffered = self.pending.len(), "Connected to backend");

        self.backend = Some(backend);
        self.connected_to = Some(endpoint);

        None
    }

    /// Full-duplex relay until either side goes away.
    ///
    /// Each direction runs as its own pump so that a write blocked on a slow
    /// peer never keeps the command channel or endpoint watch from being
    /// polled. Bytes buffered while waiting go out first on the upstream pump.
    async fn relay(&mut self) -> Finish {
        let Some(mut backend) = self.backend.take() else {
            return Finish::Fail(reason::BACKEND_ERROR.to_string());
        };

        let (mut client_read, mut client_write) = self.client.split();
        let (mut backend_read, mut backend_write) = backend.split();

        let upstream = pump(
            &mut client_read,
            &mut backend_write,
            &self.pending,
            PumpContext {
                session_id: self.id,
                direction: RelayDirection::ClientToBackend,
                buffer_size: self.settings.buffer_size,
                reports: &self.reports,
            },
        );
        let downstream = pump(
            &mut backend_read,
            &mut client_write,
            &[],
            PumpContext {
                session_id: self.id,
                direction: RelayDirection::BackendToClient,
                buffer_size: self.settings.buffer_size,
                reports: &self.reports,
            },
        );
        tokio::pin!(upstream);
        tokio::pin!(downstream);

        loop {
            tokio::select! {
                end = &mut upstream => return match end {
                    PumpEnd::ReadClosed => Finish::Close,
                    PumpEnd::ReadFailed(e) => {
                        debug!(error = %e, "Client read failed");
                        Finish::Close
                    }
                    PumpEnd::WriteFailed(e) => {
                        debug!(error = %e, "Backend write failed");
                        Finish::Fail(reason::BACKEND_ERROR.to_string())
                    }
                },
                end = &mut downstream => return match end {
                    PumpEnd::ReadClosed => {
                        debug!("Backend closed connection");
                        Finish::Fail(reason::BACKEND_DISCONNECTED.to_string())
                    }
                    PumpEnd::ReadFailed(e) => {
                        debug!(error = %e, "Backend read failed");
                        Finish::Fail(reason::BACKEND_ERROR.to_string())
                    }
                    PumpEnd::WriteFailed(e) => {
                        debug!(error = %e, "Client write failed");
                        Finish::Close
                    }
                },
                changed = self.endpoint.changed() => {
                    if changed.is_err() {
                        return Finish::Close;
                    }
                    let current = self.endpoint.borrow_and_update().clone();
                    if self.connected_to.as_ref() != Some(&current) {
                        info!(backend = %current, "Backend endpoint changed, dropping backend leg");
                        return Finish::Fail(reason::BACKEND_DISCONNECTED.to_string());
                    }
                }
                cmd = self.commands.recv() => match cmd {
                    Some(SessionCommand::BackendReady) => {}
                    Some(SessionCommand::Terminate { reason, ack }) => {
                        return Finish::Terminated { reason, ack };
                    }
                    None => return Finish::Close,
                },
            }
        }
    }

    fn buffer_client_bytes(&mut self, data: &[u8]) {
        self.report_activity(RelayDirection::ClientToBackend, data.len());
        self.pending.extend_from_slice(data);
    }

    /// Best-effort 503 to the client, then close both sides.
    async fn send_unavailable(&mut self, reason: &str) {
        info!(peer = %self.peer, reason = %reason, "Sending 503 to client");
        self.backend = None;

        let response = service_unavailable(reason);
        let client = &mut self.client;
        let write = async {
            client.write_all(&response).await?;
            client.flush().await?;
            client.shutdown().await
        };

        match timeout(self.settings.flush_timeout, write).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "Client went away before 503 was written"),
            Err(_) => debug!("Timed out writing 503 to client"),
        }
    }

    fn report_activity(&self, direction: RelayDirection, bytes: usize) {
        self.report(SessionReport::Activity {
            session_id: self.id,
            direction,
            bytes,
        });
    }

    fn report(&self, report: SessionReport) {
        let _ = self.reports.send(report);
    }
}

/// How one relay direction stopped.
enum PumpEnd {
    ReadClosed,
    ReadFailed(io::Error),
    WriteFailed(io::Error),
}

struct PumpContext<'a> {
    session_id: SessionId,
    direction: RelayDirection,
    buffer_size: usize,
    reports: &'a mpsc::UnboundedSender<SessionReport>,
}

/// Copy `reader` into `writer` after writing `initial`, reporting each chunk.
async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    initial: &[u8],
    ctx: PumpContext<'_>,
) -> PumpEnd
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if !initial.is_empty() {
        if let Err(e) = writer.write_all(initial).await {
            return PumpEnd::WriteFailed(e);
        }
    }

    let mut buf = vec![0u8; ctx.buffer_size];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => return PumpEnd::ReadClosed,
            Ok(n) => n,
            Err(e) => return PumpEnd::ReadFailed(e),
        };
        let _ = ctx.reports.send(SessionReport::Activity {
            session_id: ctx.session_id,
            direction: ctx.direction,
            bytes: n,
        });
        if let Err(e) = writer.write_all(&buf[..n]).await {
            return PumpEnd::WriteFailed(e);
        }
    }
}
