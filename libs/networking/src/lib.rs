//! Networking primitives shared by the EVA proxy and control channel.
//!
//! This library provides:
//! - `Endpoint`: a `{host, port}` pair with bind helpers
//! - Length-prefixed JSON framing (`encode_frame`, `FrameDecoder`)

mod endpoint;
mod error;
pub mod frame;

pub use endpoint::{Endpoint, ANY_HOST};
pub use error::{FrameError, NetworkError};
pub use frame::{
    encode_frame, encode_frame_with_max, DecodedFrame, FrameDecoder, JsonObject,
    DEFAULT_MAX_FRAME_LEN,
};
