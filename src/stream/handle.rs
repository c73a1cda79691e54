//! Contract between the connection supervisor and a logical stream.
//!
//! The supervisor never creates streams and never touches their buffers.
//! It only reads liveness and activity, pushes decoded events into the
//! stream's queues, and sends cancellation or teardown notifications.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use tokio::time::Instant;

use crate::domain::StreamId;
use crate::error::MuxError;
use crate::protocol::Command;

/// Result of one read cycle as seen by a stream.
#[derive(Debug, Clone)]
pub enum ReadEvent {
    /// Payload of a data frame.
    Data(Bytes),
    /// Control command relayed from the peer (ack, close, ...).
    Command(Command),
    /// The payload of a frame addressed to this stream could not be read.
    /// The connection-wide failure follows as [`ReadEvent::Terminated`].
    PayloadFailed(MuxError),
    /// The connection failed; no further events will arrive.
    Terminated(MuxError),
}

impl ReadEvent {
    /// Returns `true` for events that end the stream.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated(_))
    }
}

/// A logical stream as seen by its connection supervisor.
pub trait StreamHandle: Send + Sync + fmt::Debug {
    /// Id of the stream within its connection.
    fn id(&self) -> StreamId;

    /// `false` once the stream has been closed by its owner.
    fn is_alive(&self) -> bool;

    /// Time of the stream's last read or write.
    fn last_active(&self) -> Instant;

    /// Per-stream idle timeout. `None` falls back to the connection policy;
    /// `Some(Duration::ZERO)` disables idle collection for this stream.
    fn idle_timeout(&self) -> Option<Duration>;

    /// Delivers an event, waiting for queue space.
    fn deliver(&self, event: ReadEvent) -> BoxFuture<'_, ()>;

    /// Delivers an event only if the queue can take it right now.
    /// Returns `false` if the event was dropped.
    fn try_deliver(&self, event: ReadEvent) -> bool;

    /// Hands a control command to the write side if it can take it right
    /// now. Returns `false` if the command was dropped.
    fn try_ack(&self, cmd: Command) -> bool;

    /// Wakes a blocked reader with a cancellation.
    fn cancel_read(&self);

    /// Wakes a blocked writer with a cancellation.
    fn cancel_write(&self);

    /// Tears the stream down without reporting an error to its owner.
    fn close_silently(&self);
}
