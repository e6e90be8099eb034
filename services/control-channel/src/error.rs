//! Control channel errors.

use std::io;

use thiserror::Error;

/// Errors returned by [`crate::ControlChannel`] operations.
#[derive(Debug, Error)]
pub enum ControlError {
    /// The host listener could not be bound.
    #[error("failed to listen on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },

    /// The channel task is gone.
    #[error("control channel stopped")]
    Stopped,
}
