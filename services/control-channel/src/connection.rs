//! Per-socket reader and writer tasks.
//!
//! Each paired socket is split in two. The reader decodes frames and forwards
//! them, in order, to the channel task followed by exactly one close notice.
//! The writer drains a queue of encoded frames; dropping the [`Connection`]
//! closes the queue, so frames already queued are still written before the
//! write half shuts down.

use std::net::SocketAddr;

use eva_networking::{encode_frame_with_max, DecodedFrame, FrameDecoder, JsonObject};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn, Instrument};

const READ_BUFFER_SIZE: usize = 8192;

pub(crate) type ConnectionId = u64;

/// Why a connection stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseCause {
    Eof,
    Error,
    FrameTooLarge,
}

/// Input the socket tasks hand to the channel task.
#[derive(Debug)]
pub(crate) enum ConnectionInput {
    Frame { id: ConnectionId, frame: JsonObject },
    Closed { id: ConnectionId, cause: CloseCause },
}

pub(crate) struct Connection {
    id: ConnectionId,
    peer: SocketAddr,
    max_frame_len: usize,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    reader: JoinHandle<()>,
}

impl Connection {
    pub(crate) fn spawn(
        id: ConnectionId,
        stream: TcpStream,
        peer: SocketAddr,
        max_frame_len: usize,
        inputs: mpsc::UnboundedSender<ConnectionInput>,
        span: tracing::Span,
    ) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
        }

        let (read_half, write_half) = stream.into_split();
        let (outbound, queue) = mpsc::unbounded_channel();

        tokio::spawn(write_loop(write_half, queue, id, inputs.clone()).instrument(span.clone()));
        let reader = tokio::spawn(read_loop(read_half, id, max_frame_len, inputs).instrument(span));

        Self {
            id,
            peer,
            max_frame_len,
            outbound,
            reader,
        }
    }

    pub(crate) fn id(&self) -> ConnectionId {
        self.id
    }

    pub(crate) fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Queue `frame` for writing. False if it cannot be encoded, exceeds the
    /// frame limit, or the writer is gone.
    pub(crate) fn send(&self, frame: &JsonObject) -> bool {
        match encode_frame_with_max(frame, self.max_frame_len) {
            Ok(bytes) => self.outbound.send(bytes).is_ok(),
            Err(e) => {
                warn!(peer = %self.peer, error = %e, "Failed to encode frame");
                false
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop(
    mut half: OwnedReadHalf,
    id: ConnectionId,
    max_frame_len: usize,
    inputs: mpsc::UnboundedSender<ConnectionInput>,
) {
    let mut decoder = FrameDecoder::with_max_frame_len(max_frame_len);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    let cause = 'read: loop {
        match half.read(&mut buf).await {
            Ok(0) => break CloseCause::Eof,
            Ok(n) => {
                decoder.extend(&buf[..n]);
                loop {
                    match decoder.next_frame() {
                        Ok(Some(DecodedFrame::Object(frame))) => {
                            if inputs.send(ConnectionInput::Frame { id, frame }).is_err() {
                                return;
                            }
                        }
                        Ok(Some(DecodedFrame::Discarded)) => {
                            debug!("Dropped frame that is not a JSON object");
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(error = %e, "Closing connection");
                            break 'read CloseCause::FrameTooLarge;
                        }
                    }
                }
            }
            Err(e) => {
                debug!(error = %e, "Read failed");
                break CloseCause::Error;
            }
        }
    };

    let _ = inputs.send(ConnectionInput::Closed { id, cause });
}

async fn write_loop(
    mut half: OwnedWriteHalf,
    mut queue: mpsc::UnboundedReceiver<Vec<u8>>,
    id: ConnectionId,
    inputs: mpsc::UnboundedSender<ConnectionInput>,
) {
    while let Some(frame) = queue.recv().await {
        if let Err(e) = half.write_all(&frame).await {
            debug!(error = %e, "Write failed");
            let _ = inputs.send(ConnectionInput::Closed {
                id,
                cause: CloseCause::Error,
            });
            return;
        }
    }
    let _ = half.shutdown().await;
}
