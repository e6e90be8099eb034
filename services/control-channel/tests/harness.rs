//! Test harness for control channel integration tests.

use std::net::SocketAddr;
use std::time::Duration;

use eva_control_channel::{ControlChannel, ControlEvent, ControllerState, JsonObject};
use eva_networking::{encode_frame, FrameDecoder};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

const EVENT_TIMEOUT: Duration = Duration::from_secs(2);

/// A channel plus its event stream.
#[allow(dead_code)]
pub struct ChannelHandle {
    pub channel: ControlChannel,
    pub events: mpsc::UnboundedReceiver<ControlEvent>,
}

#[allow(dead_code)]
impl ChannelHandle {
    pub async fn new() -> Self {
        let channel = ControlChannel::default();
        let events = channel.subscribe().await.unwrap();
        Self { channel, events }
    }

    /// A channel already hosting on an ephemeral port; returns the
    /// loopback address to dial.
    pub async fn host() -> (Self, SocketAddr) {
        let handle = Self::new().await;
        let addr = handle.channel.start_host(0).await.unwrap();
        (handle, SocketAddr::from(([127, 0, 0, 1], addr.port())))
    }

    pub async fn next_event(&mut self) -> ControlEvent {
        timeout(EVENT_TIMEOUT, self.events.recv())
            .await
            .expect("timed out waiting for control event")
            .expect("event stream closed")
    }

    /// Wait for the next controller state change.
    pub async fn next_state(&mut self) -> (ControllerState, String) {
        loop {
            if let ControlEvent::ControllerStateChanged { state, reason } = self.next_event().await {
                return (state, reason);
            }
        }
    }

    /// Wait for the next host attach/detach.
    pub async fn next_host_change(&mut self) -> (bool, String) {
        loop {
            if let ControlEvent::HostClientChanged { connected, reason } = self.next_event().await {
                return (connected, reason);
            }
        }
    }

    pub fn drain(&mut self) -> Vec<ControlEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}

#[allow(dead_code)]
pub fn object(value: serde_json::Value) -> JsonObject {
    value.as_object().cloned().unwrap()
}

/// Raw framed client, for poking the host directly.
#[allow(dead_code)]
pub struct RawPeer {
    pub stream: TcpStream,
    decoder: FrameDecoder,
}

#[allow(dead_code)]
impl RawPeer {
    pub async fn connect(addr: SocketAddr) -> Self {
        Self {
            stream: TcpStream::connect(addr).await.unwrap(),
            decoder: FrameDecoder::new(),
        }
    }

    pub async fn send(&mut self, frame: &JsonObject) {
        let bytes = encode_frame(frame).unwrap();
        self.stream.write_all(&bytes).await.unwrap();
    }

    /// Read until the host closes; return every decoded frame.
    pub async fn read_until_closed(&mut self) -> Vec<JsonObject> {
        let mut received = Vec::new();
        timeout(EVENT_TIMEOUT, self.stream.read_to_end(&mut received))
            .await
            .expect("timed out waiting for close")
            .unwrap();
        self.decoder.extend(&received);
        self.decoder.drain_objects().unwrap()
    }

    /// Read until at least one frame is decoded.
    pub async fn next_frame(&mut self) -> JsonObject {
        let mut buf = vec![0u8; 4096];
        loop {
            if let Some(frame) = self.decoder.drain_objects().unwrap().into_iter().next() {
                return frame;
            }
            let n = timeout(EVENT_TIMEOUT, self.stream.read(&mut buf))
                .await
                .expect("timed out waiting for frame")
                .unwrap();
            assert!(n > 0, "host closed before sending a frame");
            self.decoder.extend(&buf[..n]);
        }
    }
}

/// A port on 127.0.0.1 with nothing listening on it.
#[allow(dead_code)]
pub async fn dead_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}
