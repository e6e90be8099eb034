//! Framed JSON control channel.
//!
//! One [`ControlChannel`] can play two roles at once:
//!
//! - **host**: listens on a port and pairs with exactly one controller.
//!   Further connections get a `{"type":"reject","reason":"busy"}` frame and
//!   are closed.
//! - **controller**: connects out to a host.
//!
//! Frames are `[u32 big-endian length][compact JSON object]`, see
//! [`eva_networking::frame`].

mod channel;
mod connection;
pub mod error;
pub mod event;

pub use channel::{ControlChannel, ControlConfig, ControlStatus, DEFAULT_CONNECT_TIMEOUT};
pub use error::ControlError;
pub use event::{is_reject, reason, reject_busy_frame, ControlEvent, ControllerState};
pub use eva_networking::JsonObject;
