//! Channel-backed logical stream.
//!
//! [`MuxStream`] is the supervisor-facing half: it implements
//! [`StreamHandle`] on top of two bounded tokio channels and a pair of
//! [`Notify`] cancellation hooks. [`StreamEndpoint`] is the owner-facing
//! half used by the application to read, write and close.

use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;

use super::{ReadEvent, StreamHandle};
use crate::conn::{FrameWriter, Supervisor};
use crate::domain::StreamId;
use crate::error::MuxError;
use crate::protocol::{Command, Frame, MAX_PAYLOAD_LEN};

/// Supervisor-facing state of one logical stream.
#[derive(Debug)]
pub struct MuxStream {
    id: StreamId,
    alive: AtomicBool,
    created: Instant,
    /// Milliseconds after `created` of the last read or write.
    active_ms: AtomicU64,
    idle_timeout: Option<Duration>,
    events: mpsc::Sender<ReadEvent>,
    acks: mpsc::Sender<Command>,
    read_cancel: Notify,
    write_cancel: Notify,
    writer: FrameWriter,
}

impl MuxStream {
    /// Creates a stream that writes through `writer`.
    ///
    /// `capacity` bounds both the event and the ack queue (minimum 1).
    /// The stream is not registered anywhere yet.
    #[must_use]
    pub fn new(
        id: StreamId,
        writer: FrameWriter,
        capacity: usize,
        idle_timeout: Option<Duration>,
    ) -> (Arc<Self>, StreamEndpoint) {
        let capacity = capacity.max(1);
        let (events_tx, events_rx) = mpsc::channel(capacity);
        let (acks_tx, acks_rx) = mpsc::channel(capacity);
        let stream = Arc::new(Self {
            id,
            alive: AtomicBool::new(true),
            created: Instant::now(),
            active_ms: AtomicU64::new(0),
            idle_timeout,
            events: events_tx,
            acks: acks_tx,
            read_cancel: Notify::new(),
            write_cancel: Notify::new(),
            writer,
        });
        let endpoint = StreamEndpoint {
            stream: Arc::clone(&stream),
            events: events_rx,
            acks: acks_rx,
            conn: Weak::new(),
        };
        (stream, endpoint)
    }

    /// Builds and registers the local side of a stream the peer asked for.
    ///
    /// Call this from the new-stream callback so the stream is in the
    /// registry before the hello is acknowledged.
    ///
    /// # Errors
    ///
    /// Returns [`MuxError::AlreadyRegistered`] if the id is in use and
    /// [`MuxError::ConnectionClosed`] if the connection has stopped.
    pub async fn accept(conn: &Arc<Supervisor>, id: StreamId) -> Result<StreamEndpoint, MuxError> {
        let config = conn.config();
        let (stream, mut endpoint) =
            Self::new(id, conn.frame_writer(), config.stream_queue_capacity, None);
        conn.register(stream).await?;
        endpoint.conn = Arc::downgrade(conn);
        Ok(endpoint)
    }

    /// Opens a new stream: registers it, sends a hello and waits for the
    /// peer's ack.
    ///
    /// # Errors
    ///
    /// Returns [`MuxError::HandshakeTimeout`] if no ack arrives within the
    /// configured handshake timeout, [`MuxError::StreamNotFound`] if the
    /// peer answers with a close, or any registration or write error.
    pub async fn open(conn: &Arc<Supervisor>) -> Result<StreamEndpoint, MuxError> {
        let id = conn.next_stream_id();
        let mut endpoint = Self::accept(conn, id).await?;

        let hello = Frame::control(id, Command::Hello);
        let handshake = match conn.frame_writer().write_frame(&hello).await {
            Ok(()) => endpoint.wait_ack(conn.config().handshake_timeout).await,
            Err(err) => Err(err),
        };
        if let Err(err) = handshake {
            endpoint.stream.mark_dead();
            conn.remove_stream(id).await;
            tracing::debug!(conn = %conn.id(), stream = %id, error = %err, "stream open failed");
            return Err(err);
        }

        tracing::debug!(conn = %conn.id(), stream = %id, "stream opened");
        Ok(endpoint)
    }

    /// Records activity now.
    pub fn touch(&self) {
        let ms = u64::try_from(self.created.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.active_ms.store(ms, Ordering::Relaxed);
    }

    fn mark_dead(&self) -> bool {
        self.alive.swap(false, Ordering::AcqRel)
    }
}

impl StreamHandle for MuxStream {
    fn id(&self) -> StreamId {
        self.id
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    fn last_active(&self) -> Instant {
        self.created + Duration::from_millis(self.active_ms.load(Ordering::Relaxed))
    }

    fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    fn deliver(&self, event: ReadEvent) -> BoxFuture<'_, ()> {
        async move {
            // The owner may have dropped its endpoint; nothing left to tell.
            let _ = self.events.send(event).await;
        }
        .boxed()
    }

    fn try_deliver(&self, event: ReadEvent) -> bool {
        self.events.try_send(event).is_ok()
    }

    fn try_ack(&self, cmd: Command) -> bool {
        self.acks.try_send(cmd).is_ok()
    }

    fn cancel_read(&self) {
        self.read_cancel.notify_one();
    }

    fn cancel_write(&self) {
        self.write_cancel.notify_one();
    }

    fn close_silently(&self) {
        self.mark_dead();
        self.read_cancel.notify_one();
        self.write_cancel.notify_one();
    }
}

/// Owner-facing half of a [`MuxStream`].
#[derive(Debug)]
pub struct StreamEndpoint {
    stream: Arc<MuxStream>,
    events: mpsc::Receiver<ReadEvent>,
    acks: mpsc::Receiver<Command>,
    conn: Weak<Supervisor>,
}

impl StreamEndpoint {
    /// Id of the stream.
    #[must_use]
    pub fn id(&self) -> StreamId {
        self.stream.id
    }

    /// `false` once the stream was closed, cancelled or torn down.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.stream.is_alive()
    }

    /// Shared handle, as registered with the supervisor.
    #[must_use]
    pub fn handle(&self) -> Arc<MuxStream> {
        Arc::clone(&self.stream)
    }

    /// Reads the next payload.
    ///
    /// Returns `Ok(None)` once the peer closed the stream or the connection
    /// was shut down locally.
    ///
    /// # Errors
    ///
    /// Returns the connection error carried by a terminal or payload-failure
    /// event, or [`MuxError::StreamCancelled`] if garbage collection
    /// cancelled the stream.
    pub async fn read(&mut self) -> Result<Option<Bytes>, MuxError> {
        loop {
            let event = if self.stream.is_alive() {
                tokio::select! {
                    biased;
                    event = self.events.recv() => event,
                    () = self.stream.read_cancel.notified() => {
                        if self.stream.mark_dead() {
                            return Err(MuxError::StreamCancelled(self.stream.id));
                        }
                        continue;
                    }
                }
            } else {
                self.events.try_recv().ok()
            };

            let Some(event) = event else {
                return Ok(None);
            };
            match event {
                ReadEvent::Data(payload) => {
                    self.stream.touch();
                    return Ok(Some(payload));
                }
                ReadEvent::Command(Command::Close) => {
                    self.stream.mark_dead();
                    return Ok(None);
                }
                ReadEvent::Command(_) => {}
                ReadEvent::PayloadFailed(err) => return Err(err),
                ReadEvent::Terminated(err) => {
                    self.stream.mark_dead();
                    return Err(err);
                }
            }
        }
    }

    /// Writes `data`, split into frames of at most
    /// [`MAX_PAYLOAD_LEN`] bytes.
    ///
    /// # Errors
    ///
    /// Returns [`MuxError::ConnectionClosed`] if the stream is no longer
    /// alive, [`MuxError::StreamCancelled`] if garbage collection cancelled
    /// it, or the transport error of a failed write.
    pub async fn write(&self, data: &[u8]) -> Result<(), MuxError> {
        for chunk in data.chunks(MAX_PAYLOAD_LEN) {
            if !self.stream.is_alive() {
                return Err(MuxError::ConnectionClosed);
            }
            let frame = Frame::data(self.stream.id, Bytes::copy_from_slice(chunk));
            // Cancellation only interrupts the wait for the writer; a frame
            // that has started goes out whole.
            let mut guard = tokio::select! {
                biased;
                () = self.stream.write_cancel.notified() => {
                    self.stream.mark_dead();
                    return Err(MuxError::StreamCancelled(self.stream.id));
                }
                guard = self.stream.writer.lock() => guard?,
            };
            guard.write_frame(&frame).await?;
            drop(guard);
            self.stream.touch();
        }
        Ok(())
    }

    /// Closes the stream: tells the peer and leaves the registry entry for
    /// the next garbage-collection pass. Closing twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the close notice cannot be written.
    pub async fn close(&self) -> Result<(), MuxError> {
        if !self.stream.mark_dead() {
            return Ok(());
        }
        self.stream
            .writer
            .write_frame(&Frame::control(self.stream.id, Command::Close))
            .await
    }

    /// Shuts down the whole connection this stream belongs to, tearing
    /// down every other stream on it and removing it from the master
    /// registry. Returns `false` if the stream was never attached to a
    /// connection or the connection is already gone.
    pub async fn close_connection(&self) -> bool {
        let Some(conn) = self.conn.upgrade() else {
            return false;
        };
        tracing::debug!(conn = %conn.id(), stream = %self.stream.id, "connection closed by stream");
        conn.stop().await;
        true
    }

    async fn wait_ack(&mut self, timeout: Duration) -> Result<(), MuxError> {
        let id = self.stream.id;
        let acks = &mut self.acks;
        let acked = async move {
            loop {
                match acks.recv().await {
                    Some(Command::Ack) => return Ok(()),
                    Some(Command::Close) => return Err(MuxError::StreamNotFound(id)),
                    Some(_) => {}
                    None => return Err(MuxError::ConnectionClosed),
                }
            }
        };
        tokio::time::timeout(timeout, acked)
            .await
            .map_err(|_| MuxError::HandshakeTimeout(id))?
    }
}
