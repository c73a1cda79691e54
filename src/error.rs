//! Multiplexer error types.
//!
//! [`MuxError`] is the central error type for the crate. It is `Clone` so
//! that a single connection-level failure can be handed to every live
//! stream during a broadcast.

use std::io;
use std::sync::Arc;

use crate::domain::StreamId;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, MuxError>;

/// Errors raised by the frame codec, the connection supervisor and the
/// logical streams.
///
/// # Categories
///
/// | Category   | Variants                                   | Effect                    |
/// |------------|--------------------------------------------|---------------------------|
/// | Transport  | `Transport`                                | fatal to the connection   |
/// | Protocol   | `InvalidVersion`                           | fatal to the connection   |
/// | Addressing | `StreamNotFound`                           | local, answered by close  |
/// | Stream     | `StreamCancelled`, `HandshakeTimeout`, ... | scoped to one stream      |
#[derive(Debug, Clone, thiserror::Error)]
pub enum MuxError {
    /// I/O failure on the physical connection (reset, timeout, EOF).
    #[error("transport error: {0}")]
    Transport(Arc<io::Error>),

    /// The first header byte did not match the protocol version.
    #[error("invalid version header: {0:#04x}")]
    InvalidVersion(u8),

    /// A data payload does not fit in a single frame.
    #[error("payload of {0} bytes exceeds the frame limit")]
    PayloadTooLarge(usize),

    /// A buffer ended before the frame it announces.
    #[error("truncated frame: need {needed} bytes, have {available}")]
    Truncated {
        /// Bytes required to decode the frame.
        needed: usize,
        /// Bytes actually available.
        available: usize,
    },

    /// A registry already holds an entry under this key.
    #[error("{0} is already registered")]
    AlreadyRegistered(String),

    /// No stream with this id is registered on the connection.
    #[error("stream not found: {0}")]
    StreamNotFound(StreamId),

    /// The physical connection has been shut down.
    #[error("connection closed")]
    ConnectionClosed,

    /// A blocked read or write was cancelled by garbage collection.
    #[error("stream {0} cancelled")]
    StreamCancelled(StreamId),

    /// The peer did not acknowledge a hello in time.
    #[error("handshake for stream {0} timed out")]
    HandshakeTimeout(StreamId),

    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),
}

impl MuxError {
    /// Returns `true` if this error tears down the whole connection.
    ///
    /// Transport and protocol errors are fatal; everything else is scoped
    /// to a single stream or call.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::InvalidVersion(_))
    }

    /// Returns the [`io::ErrorKind`] of a transport error.
    #[must_use]
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            Self::Transport(e) => Some(e.kind()),
            _ => None,
        }
    }
}

impl From<io::Error> for MuxError {
    fn from(err: io::Error) -> Self {
        Self::Transport(Arc::new(err))
    }
}
