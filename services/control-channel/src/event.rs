//! Events surfaced by the control channel.

use eva_networking::JsonObject;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Reason strings carried by [`ControlEvent`]s.
pub mod reason {
    pub const CONNECTED: &str = "connected";
    pub const CONNECTING: &str = "connecting";
    pub const DISCONNECTED: &str = "disconnected";
    pub const REFUSED: &str = "refused";
    pub const ERROR: &str = "error";
    pub const LISTEN_FAILED: &str = "listen failed";
    pub const HOST_STOP: &str = "host stop";
    pub const PEER_CLOSED: &str = "peer closed";
    pub const FRAME_TOO_LARGE: &str = "frame too large";
    pub const BUSY: &str = "busy";
}

/// Controller-side connection state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerState {
    #[default]
    Idle,
    Connecting,
    Connected,
}

impl std::fmt::Display for ControllerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControllerState::Idle => write!(f, "idle"),
            ControllerState::Connecting => write!(f, "connecting"),
            ControllerState::Connected => write!(f, "connected"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    /// A controller attached to or detached from the host side.
    HostClientChanged { connected: bool, reason: String },
    /// Frame received by the host from its controller.
    HostCommand(JsonObject),
    /// Frame received by the controller from its host.
    ControllerEvent(JsonObject),
    /// Controller-side state transition.
    ControllerStateChanged {
        state: ControllerState,
        reason: String,
    },
}

/// The frame sent to a connection refused because the host is paired.
pub fn reject_busy_frame() -> JsonObject {
    match json!({"type": "reject", "reason": reason::BUSY}) {
        Value::Object(map) => map,
        _ => JsonObject::new(),
    }
}

/// Whether `frame` is a busy rejection.
pub fn is_reject(frame: &JsonObject) -> bool {
    frame.get("type").and_then(Value::as_str) == Some("reject")
}
