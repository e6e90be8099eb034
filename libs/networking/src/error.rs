//! Networking errors.

use thiserror::Error;

/// Endpoint and address errors.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// The endpoint string could not be parsed.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

/// Control frame errors.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Frame length exceeds what the peer is willing to buffer.
    #[error("frame too large: {len} bytes (max {max})")]
    TooLarge { len: usize, max: usize },

    /// Payload could not be serialized.
    #[error("frame encode failed: {0}")]
    Encode(String),
}

impl From<serde_json::Error> for FrameError {
    fn from(err: serde_json::Error) -> Self {
        FrameError::Encode(err.to_string())
    }
}
