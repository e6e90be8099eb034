//! Host and controller roles behind a single coordinating task.
//!
//! [`ControlChannel`] is a handle; the task behind it owns the host listener,
//! the attached host peer, the controller connection and its state. Public
//! operations are messages answered over oneshot channels, so their effects
//! (including emitted events) are complete when the call returns.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use eva_events::EventHub;
use eva_networking::{encode_frame, Endpoint, JsonObject, ANY_HOST, DEFAULT_MAX_FRAME_LEN};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn, Instrument};

use crate::connection::{CloseCause, Connection, ConnectionId, ConnectionInput};
use crate::error::ControlError;
use crate::event::{reason, reject_busy_frame, ControlEvent, ControllerState};

/// Default bound on a controller connect attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on writing the busy rejection to a refused peer.
const REJECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Delay before retrying after an accept error.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Control channel configuration.
#[derive(Debug, Clone)]
pub struct ControlConfig {
    /// Bound on a controller connect attempt.
    pub connect_timeout: Duration,
    /// Largest accepted frame payload.
    pub max_frame_len: usize,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

/// Point-in-time view of both roles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlStatus {
    /// Bound host listener address, if listening.
    pub host_addr: Option<SocketAddr>,
    /// Controller attached to the host side, if any.
    pub host_peer: Option<SocketAddr>,
    /// Controller-side connection state.
    pub controller_state: ControllerState,
}

enum ChannelMessage {
    StartHost {
        port: u16,
        reply: oneshot::Sender<Result<SocketAddr, ControlError>>,
    },
    StopHost {
        reply: oneshot::Sender<()>,
    },
    ConnectToHost {
        endpoint: Endpoint,
        reply: oneshot::Sender<()>,
    },
    DisconnectFromHost {
        reply: oneshot::Sender<()>,
    },
    SendToController {
        frame: JsonObject,
        reply: oneshot::Sender<bool>,
    },
    SendToHost {
        frame: JsonObject,
        reply: oneshot::Sender<bool>,
    },
    Subscribe {
        reply: oneshot::Sender<mpsc::UnboundedReceiver<ControlEvent>>,
    },
    Status {
        reply: oneshot::Sender<ControlStatus>,
    },
    Shutdown,
}

/// Handle to a control channel.
///
/// Dropping the handle shuts the channel down: events are muted first, then
/// every socket and the listener are closed.
pub struct ControlChannel {
    mailbox: mpsc::UnboundedSender<ChannelMessage>,
    task: Option<JoinHandle<()>>,
}

impl ControlChannel {
    /// Spawn the coordinating task. Must be called within a tokio runtime.
    pub fn new(config: ControlConfig) -> Self {
        let (mailbox, inbox) = mpsc::unbounded_channel();
        let actor = ChannelActor::new(config, inbox);
        let task = tokio::spawn(actor.run().instrument(tracing::info_span!("control_channel")));

        Self {
            mailbox,
            task: Some(task),
        }
    }

    /// Listen for a controller on all interfaces.
    ///
    /// Already listening on `port` (or on the port it resolved to) returns
    /// the current address.
    pub async fn start_host(&self, port: u16) -> Result<SocketAddr, ControlError> {
        self.request(|reply| ChannelMessage::StartHost { port, reply })
            .await?
    }

    /// Close the listener and drop the attached controller, if any.
    pub async fn stop_host(&self) -> Result<(), ControlError> {
        self.request(|reply| ChannelMessage::StopHost { reply }).await
    }

    /// Connect to a host as controller, replacing any previous connection.
    ///
    /// Returns once the state is `Connecting`; the outcome arrives as a
    /// [`ControlEvent::ControllerStateChanged`].
    pub async fn connect_to_host(&self, host: &str, port: u16) -> Result<(), ControlError> {
        let endpoint = Endpoint::new(host, port);
        self.request(|reply| ChannelMessage::ConnectToHost { endpoint, reply })
            .await
    }

    /// Drop the controller connection. Idempotent.
    pub async fn disconnect_from_host(&self) -> Result<(), ControlError> {
        self.request(|reply| ChannelMessage::DisconnectFromHost { reply })
            .await
    }

    /// Send a frame to the attached controller. False if none is attached.
    pub async fn send_to_controller(&self, frame: JsonObject) -> bool {
        self.request(|reply| ChannelMessage::SendToController { frame, reply })
            .await
            .unwrap_or(false)
    }

    /// Send a frame to the host. False unless connected.
    pub async fn send_to_host(&self, frame: JsonObject) -> bool {
        self.request(|reply| ChannelMessage::SendToHost { frame, reply })
            .await
            .unwrap_or(false)
    }

    /// Register an event listener.
    pub async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<ControlEvent>, ControlError> {
        self.request(|reply| ChannelMessage::Subscribe { reply }).await
    }

    pub async fn status(&self) -> Result<ControlStatus, ControlError> {
        self.request(|reply| ChannelMessage::Status { reply }).await
    }

    pub async fn host_addr(&self) -> Option<SocketAddr> {
        self.status().await.ok().and_then(|s| s.host_addr)
    }

    pub async fn host_peer(&self) -> Option<SocketAddr> {
        self.status().await.ok().and_then(|s| s.host_peer)
    }

    pub async fn has_host_client(&self) -> bool {
        self.host_peer().await.is_some()
    }

    pub async fn controller_state(&self) -> ControllerState {
        self.status()
            .await
            .map(|s| s.controller_state)
            .unwrap_or_default()
    }

    /// Shut down and wait for the channel task to finish.
    pub async fn shutdown(mut self) {
        let _ = self.mailbox.send(ChannelMessage::Shutdown);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Control channel task failed");
            }
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> ChannelMessage,
    ) -> Result<T, ControlError> {
        let (reply, response) = oneshot::channel();
        self.mailbox
            .send(build(reply))
            .map_err(|_| ControlError::Stopped)?;
        response.await.map_err(|_| ControlError::Stopped)
    }
}

impl Default for ControlChannel {
    fn default() -> Self {
        Self::new(ControlConfig::default())
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        let _ = self.mailbox.send(ChannelMessage::Shutdown);
    }
}

struct Accepted {
    generation: u64,
    stream: TcpStream,
    peer: SocketAddr,
}

struct ConnectOutcome {
    attempt: u64,
    endpoint: Endpoint,
    result: io::Result<TcpStream>,
}

struct HostListener {
    requested_port: u16,
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl HostListener {
    fn matches(&self, port: u16) -> bool {
        self.requested_port == port || self.local_addr.port() == port
    }
}

struct ChannelActor {
    config: ControlConfig,
    inbox: mpsc::UnboundedReceiver<ChannelMessage>,
    accepted_tx: mpsc::UnboundedSender<Accepted>,
    accepted_rx: mpsc::UnboundedReceiver<Accepted>,
    connect_tx: mpsc::UnboundedSender<ConnectOutcome>,
    connect_rx: mpsc::UnboundedReceiver<ConnectOutcome>,
    inputs_tx: mpsc::UnboundedSender<ConnectionInput>,
    inputs_rx: mpsc::UnboundedReceiver<ConnectionInput>,
    listener: Option<HostListener>,
    listener_generation: u64,
    host_peer: Option<Connection>,
    controller: Option<Connection>,
    controller_state: ControllerState,
    connect_attempt: u64,
    connect_task: Option<JoinHandle<()>>,
    next_connection_id: ConnectionId,
    events: EventHub<ControlEvent>,
}

impl ChannelActor {
    fn new(config: ControlConfig, inbox: mpsc::UnboundedReceiver<ChannelMessage>) -> Self {
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        let (connect_tx, connect_rx) = mpsc::unbounded_channel();
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();

        Self {
            config,
            inbox,
            accepted_tx,
            accepted_rx,
            connect_tx,
            connect_rx,
            inputs_tx,
            inputs_rx,
            listener: None,
            listener_generation: 0,
            host_peer: None,
            controller: None,
            controller_state: ControllerState::Idle,
            connect_attempt: 0,
            connect_task: None,
            next_connection_id: 1,
            events: EventHub::new(),
        }
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                msg = self.inbox.recv() => match msg {
                    Some(ChannelMessage::Shutdown) | None => break,
                    Some(msg) => self.handle(msg).await,
                },
                Some(accepted) = self.accepted_rx.recv() => self.on_accepted(accepted),
                Some(outcome) = self.connect_rx.recv() => self.on_connect_outcome(outcome),
                Some(input) = self.inputs_rx.recv() => self.on_input(input),
            }
        }

        self.teardown();
    }

    async fn handle(&mut self, msg: ChannelMessage) {
        match msg {
            ChannelMessage::StartHost { port, reply } => {
                let result = self.start_host(port).await;
                let _ = reply.send(result);
            }
            ChannelMessage::StopHost { reply } => {
                self.stop_host();
                let _ = reply.send(());
            }
            ChannelMessage::ConnectToHost { endpoint, reply } => {
                self.connect_to_host(endpoint);
                let _ = reply.send(());
            }
            ChannelMessage::DisconnectFromHost { reply } => {
                self.disconnect_from_host();
                let _ = reply.send(());
            }
            ChannelMessage::SendToController { frame, reply } => {
                let sent = self
                    .host_peer
                    .as_ref()
                    .is_some_and(|conn| conn.send(&frame));
                let _ = reply.send(sent);
            }
            ChannelMessage::SendToHost { frame, reply } => {
                let sent = self.controller_state == ControllerState::Connected
                    && self.controller.as_ref().is_some_and(|conn| conn.send(&frame));
                let _ = reply.send(sent);
            }
            ChannelMessage::Subscribe { reply } => {
                let _ = reply.send(self.events.subscribe());
            }
            ChannelMessage::Status { reply } => {
                let _ = reply.send(ControlStatus {
                    host_addr: self.listener.as_ref().map(|l| l.local_addr),
                    host_peer: self.host_peer.as_ref().map(Connection::peer),
                    controller_state: self.controller_state,
                });
            }
            ChannelMessage::Shutdown => {}
        }
    }

    async fn start_host(&mut self, port: u16) -> Result<SocketAddr, ControlError> {
        if let Some(listener) = &self.listener {
            if listener.matches(port) {
                debug!(host_addr = %listener.local_addr, "Host already listening");
                return Ok(listener.local_addr);
            }
        }
        self.close_listener();

        let bound = match TcpListener::bind((ANY_HOST, port)).await {
            Ok(listener) => listener.local_addr().map(|addr| (listener, addr)),
            Err(e) => Err(e),
        };

        let (listener, local_addr) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                error!(port, error = %e, "Failed to bind control host");
                self.events.emit(ControlEvent::HostClientChanged {
                    connected: false,
                    reason: reason::LISTEN_FAILED.to_string(),
                });
                return Err(ControlError::Bind { port, source: e });
            }
        };

        self.listener_generation += 1;
        let task = tokio::spawn(
            accept_loop(listener, self.listener_generation, self.accepted_tx.clone())
                .instrument(tracing::info_span!("control_host", addr = %local_addr)),
        );

        info!(host_addr = %local_addr, "Control host listening");
        self.listener = Some(HostListener {
            requested_port: port,
            local_addr,
            task,
        });
        Ok(local_addr)
    }

    fn close_listener(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.task.abort();
            info!(host_addr = %listener.local_addr, "Control host listener closed");
        }
    }

    fn stop_host(&mut self) {
        self.close_listener();
        if let Some(peer) = self.host_peer.take() {
            info!(peer = %peer.peer(), "Detaching controller");
            self.events.emit(ControlEvent::HostClientChanged {
                connected: false,
                reason: reason::HOST_STOP.to_string(),
            });
        }
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

        if self.host_peer.is_some() {
            reject_busy(stream, peer);
            return;
        }

        let id = self.next_connection_id();
        let span = tracing::info_span!("control_peer", role = "host", peer = %peer);
        self.host_peer = Some(Connection::spawn(
            id,
            stream,
            peer,
            self.config.max_frame_len,
            self.inputs_tx.clone(),
            span,
        ));

        info!(peer = %peer, "Controller attached");
        self.events.emit(ControlEvent::HostClientChanged {
            connected: true,
            reason: reason::CONNECTED.to_string(),
        });
    }

    fn connect_to_host(&mut self, endpoint: Endpoint) {
        self.disconnect_from_host();

        self.connect_attempt += 1;
        let attempt = self.connect_attempt;
        self.set_controller_state(ControllerState::Connecting, reason::CONNECTING);

        let connect_timeout = self.config.connect_timeout;
        let outcomes = self.connect_tx.clone();
        let task = async move {
            let result = match timeout(connect_timeout, TcpStream::connect(endpoint.to_string())).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
            };
            let _ = outcomes.send(ConnectOutcome {
                attempt,
                endpoint,
                result,
            });
        };
        self.connect_task = Some(tokio::spawn(task.in_current_span()));
    }

    fn on_connect_outcome(&mut self, outcome: ConnectOutcome) {
        let ConnectOutcome {
            attempt,
            endpoint,
            result,
        } = outcome;

        if attempt != self.connect_attempt || self.controller_state != ControllerState::Connecting {
            debug!(host = %endpoint, "Ignoring superseded connect attempt");
            return;
        }
        self.connect_task = None;

        match result {
            Ok(stream) => {
                let peer = match stream.peer_addr() {
                    Ok(peer) => peer,
                    Err(e) => {
                        warn!(host = %endpoint, error = %e, "Connected socket has no peer address");
                        self.set_controller_state(ControllerState::Idle, reason::ERROR);
                        return;
                    }
                };

                let id = self.next_connection_id();
                let span = tracing::info_span!("control_peer", role = "controller", peer = %peer);
                self.controller = Some(Connection::spawn(
                    id,
                    stream,
                    peer,
                    self.config.max_frame_len,
                    self.inputs_tx.clone(),
                    span,
                ));
                info!(host = %endpoint, "Connected to control host");
                self.set_controller_state(ControllerState::Connected, reason::CONNECTED);
            }
            Err(e) => {
                let why = if e.kind() == io::ErrorKind::ConnectionRefused {
                    reason::REFUSED
                } else {
                    reason::ERROR
                };
                warn!(host = %endpoint, error = %e, "Control host connect failed");
                self.set_controller_state(ControllerState::Idle, why);
            }
        }
    }

    fn disconnect_from_host(&mut self) {
        // Invalidate any in-flight attempt.
        self.connect_attempt += 1;
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
        self.controller = None;

        if self.controller_state != ControllerState::Idle {
            self.set_controller_state(ControllerState::Idle, reason::DISCONNECTED);
        }
    }

    fn on_input(&mut self, input: ConnectionInput) {
        match input {
            ConnectionInput::Frame { id, frame } => {
                if self.host_peer.as_ref().is_some_and(|c| c.id() == id) {
                    self.events.emit(ControlEvent::HostCommand(frame));
                } else if self.controller.as_ref().is_some_and(|c| c.id() == id) {
                    self.events.emit(ControlEvent::ControllerEvent(frame));
                } else {
                    debug!(connection = id, "Dropping frame from a closed connection");
                }
            }
            ConnectionInput::Closed { id, cause } => {
                if self.host_peer.as_ref().is_some_and(|c| c.id() == id) {
                    self.host_peer = None;
                    let why = match cause {
                        CloseCause::Eof => reason::PEER_CLOSED,
                        CloseCause::Error => reason::ERROR,
                        CloseCause::FrameTooLarge => reason::FRAME_TOO_LARGE,
                    };
                    info!(reason = why, "Controller detached");
                    self.events.emit(ControlEvent::HostClientChanged {
                        connected: false,
                        reason: why.to_string(),
                    });
                } else if self.controller.as_ref().is_some_and(|c| c.id() == id) {
                    self.controller = None;
                    let why = match cause {
                        CloseCause::Eof | CloseCause::Error => reason::DISCONNECTED,
                        CloseCause::FrameTooLarge => reason::FRAME_TOO_LARGE,
                    };
                    info!(reason = why, "Control host connection lost");
                    self.set_controller_state(ControllerState::Idle, why);
                }
            }
        }
    }

    fn set_controller_state(&mut self, state: ControllerState, why: &str) {
        debug!(from = %self.controller_state, to = %state, reason = why, "Controller state change");
        self.controller_state = state;
        self.events.emit(ControlEvent::ControllerStateChanged {
            state,
            reason: why.to_string(),
        });
    }

    fn next_connection_id(&mut self) -> ConnectionId {
        let id = self.next_connection_id;
        self.next_connection_id += 1;
        id
    }

    /// Mute listeners, then close every socket.
    fn teardown(&mut self) {
        self.events.mute();
        self.stop_host();
        self.disconnect_from_host();
        debug!("Control channel task exiting");
    }
}

/// Tell a second controller the host is taken, then close it.
fn reject_busy(mut stream: TcpStream, peer: SocketAddr) {
    let frame = match encode_frame(&reject_busy_frame()) {
        Ok(frame) => frame,
        Err(e) => {
            error!(peer = %peer, error = %e, "Failed to encode reject frame");
            return;
        }
    };

    info!(peer = %peer, "Rejecting controller, host is busy");
    tokio::spawn(async move {
        let write = async {
            stream.write_all(&frame).await?;
            stream.shutdown().await
        };
        match timeout(REJECT_TIMEOUT, write).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(peer = %peer, error = %e, "Rejected peer went away"),
            Err(_) => debug!(peer = %peer, "Timed out writing reject frame"),
        }
    });
}

async fn accept_loop(listener: TcpListener, generation: u64, accepted: mpsc::UnboundedSender<Accepted>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                if accepted.send(Accepted { generation, stream, peer }).is_err() {
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
    fn test_control_config_default() {
        let config = ControlConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.max_frame_len, DEFAULT_MAX_FRAME_LEN);
    }

    #[tokio::test]
    async fn test_host_listener_matches_requested_or_bound_port() {
        let listener = HostListener {
            requested_port: 0,
            local_addr: "0.0.0.0:42000".parse().unwrap(),
            task: tokio::spawn(async {}),
        };
        assert!(listener.matches(0));
        assert!(listener.matches(42000));
        assert!(!listener.matches(42001));
    }

    #[tokio::test]
    async fn test_sends_fail_without_peers() {
        let channel = ControlChannel::default();
        assert!(!channel.send_to_controller(JsonObject::new()).await);
        assert!(!channel.send_to_host(JsonObject::new()).await);
        assert!(!channel.has_host_client().await);
        assert_eq!(channel.controller_state().await, ControllerState::Idle);
        channel.shutdown().await;
    }

    #[tokio::test]
    async fn test_disconnect_when_idle_emits_nothing() {
        let channel = ControlChannel::default();
        let mut events = channel.subscribe().await.unwrap();

        channel.disconnect_from_host().await.unwrap();
        channel.stop_host().await.unwrap();

        assert!(events.try_recv().is_err());
        channel.shutdown().await;
    }
}
