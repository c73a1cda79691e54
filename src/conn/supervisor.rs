//! Per-connection supervisor.
//!
//! A [`Supervisor`] owns one physical connection. It runs two tasks:
//!
//! - the **read loop**, which decodes frames strictly in arrival order and
//!   dispatches them to the stream registry, and
//! - the **keepalive loop**, which periodically garbage-collects dead or
//!   idle streams and writes a ping.
//!
//! Any fatal error (transport failure or a bad version byte) is
//! broadcast to every registered stream before the connection is shut
//! down. Shutdown runs exactly once.
//!
//! ```text
//!             ┌──────────────┐  fatal error   ┌───────────┐
//!  start ───> │   Running    │──────────────> │ Broadcast │
//!             └──────────────┘                └───────────┘
//!                    │ stop()                       │
//!                    ↓                              ↓
//!             ┌──────────────────────────────────────────┐
//!             │ Stopped: streams torn down, socket closed, │
//!             │ removed from the master registry          │
//!             └──────────────────────────────────────────┘
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use bytes::Bytes;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{Mutex, watch};
use tokio::time::{Instant, MissedTickBehavior};

use super::FrameWriter;
use crate::config::MuxConfig;
use crate::domain::{ConnId, MasterRegistry, Registry, StreamId};
use crate::error::MuxError;
use crate::protocol::{Command, Frame, HeaderKind, read_header};
use crate::stream::{ReadEvent, StreamHandle};

/// Invoked with the id of every inbound hello. The handler must build and
/// register the stream before its future completes; the ack is written
/// right after.
pub type NewStreamCallback =
    Arc<dyn Fn(Arc<Supervisor>, StreamId) -> BoxFuture<'static, ()> + Send + Sync>;

/// Invoked once per fatal connection error, before the broadcast. The
/// return value reports whether the embedder escalated the error; shutdown
/// proceeds either way.
pub type ErrorCallback = Arc<dyn Fn(&MuxError) -> bool + Send + Sync>;

/// Which side of the connection this supervisor runs on. Decides the
/// parity of locally allocated stream ids so both peers can open streams
/// without colliding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    /// Dialling side; opens odd stream ids.
    #[default]
    Client,
    /// Accepting side; opens even stream ids.
    Server,
}

/// Coordinates reads, keepalive, the stream registry and shutdown for one
/// physical connection.
pub struct Supervisor {
    id: ConnId,
    master: Arc<MasterRegistry>,
    streams: Registry<StreamId, dyn StreamHandle>,
    writer: FrameWriter,
    config: MuxConfig,
    on_new_stream: Option<NewStreamCallback>,
    on_error: Option<ErrorCallback>,
    exit_read: watch::Sender<bool>,
    daemon_stop: watch::Sender<bool>,
    stopped: Mutex<bool>,
    broadcasting: AtomicBool,
    next_stream_id: AtomicU32,
}

impl Supervisor {
    /// Starts building a supervisor that registers in `master`.
    #[must_use]
    pub fn builder(master: Arc<MasterRegistry>) -> SupervisorBuilder {
        SupervisorBuilder {
            master,
            config: MuxConfig::default(),
            role: Role::default(),
            on_new_stream: None,
            on_error: None,
        }
    }

    /// Id of this connection in the master registry.
    #[must_use]
    pub const fn id(&self) -> ConnId {
        self.id
    }

    /// Settings this connection runs with.
    #[must_use]
    pub const fn config(&self) -> &MuxConfig {
        &self.config
    }

    /// Shared writer for frames on this connection.
    #[must_use]
    pub fn frame_writer(&self) -> FrameWriter {
        self.writer.clone()
    }

    /// Allocates the next locally opened stream id.
    pub fn next_stream_id(&self) -> StreamId {
        StreamId::new(self.next_stream_id.fetch_add(2, Ordering::Relaxed))
    }

    /// Adds a stream to this connection's registry.
    ///
    /// # Errors
    ///
    /// Returns [`MuxError::ConnectionClosed`] once the connection has
    /// stopped and [`MuxError::AlreadyRegistered`] for a duplicate id.
    pub async fn register(&self, stream: Arc<dyn StreamHandle>) -> Result<(), MuxError> {
        let stopped = self.stopped.lock().await;
        if *stopped {
            return Err(MuxError::ConnectionClosed);
        }
        let id = stream.id();
        self.streams.insert(id, stream).await?;
        tracing::debug!(conn = %self.id, stream = %id, "stream registered");
        Ok(())
    }

    /// Removes a stream from the registry without notifying it.
    pub async fn remove_stream(&self, id: StreamId) -> Option<Arc<dyn StreamHandle>> {
        self.streams.remove(id).await
    }

    /// Looks up a registered stream.
    pub async fn stream(&self, id: StreamId) -> Option<Arc<dyn StreamHandle>> {
        self.streams.get(id).await
    }

    /// Number of streams currently registered.
    pub async fn stream_count(&self) -> usize {
        self.streams.len().await
    }

    /// Returns `true` once [`Supervisor::stop`] has completed.
    pub async fn is_stopped(&self) -> bool {
        *self.stopped.lock().await
    }

    /// Runs one garbage-collection pass and returns the number of streams
    /// removed.
    ///
    /// Closed streams are dropped silently. Streams idle for longer than
    /// their timeout have their reader and writer cancelled and are
    /// dropped. A zero timeout keeps the stream regardless of activity.
    pub async fn collect_garbage(&self) -> usize {
        let now = Instant::now();
        let default_timeout = self.config.idle_timeout;
        let mut removed = 0usize;

        self.streams
            .retain(|id, stream| {
                if !stream.is_alive() {
                    tracing::debug!(conn = %self.id, stream = %id, "reaped closed stream");
                    removed += 1;
                    return false;
                }
                let timeout = stream.idle_timeout().unwrap_or(default_timeout);
                if timeout.is_zero() || now.saturating_duration_since(stream.last_active()) <= timeout
                {
                    return true;
                }
                tracing::debug!(conn = %self.id, stream = %id, ?timeout, "stream idle; cancelling");
                stream.cancel_read();
                stream.cancel_write();
                removed += 1;
                false
            })
            .await;

        removed
    }

    /// Reports a fatal error to every registered stream and shuts the
    /// connection down.
    ///
    /// The error callback runs for every call made before shutdown
    /// completes, but only the first call delivers terminal events, so each
    /// stream sees the failure exactly once. Delivery waits for queue space.
    pub async fn broadcast(&self, err: MuxError) {
        if self.is_stopped().await {
            return;
        }
        if let Some(on_error) = &self.on_error {
            let escalated = on_error(&err);
            tracing::debug!(conn = %self.id, escalated, "error observer notified");
        }
        if self.broadcasting.swap(true, Ordering::AcqRel) {
            return;
        }

        tracing::warn!(conn = %self.id, error = %err, "connection failed");
        for (_, stream) in self.streams.snapshot().await {
            stream.deliver(ReadEvent::Terminated(err.clone())).await;
        }
        self.stop().await;
    }

    /// Shuts the connection down. Later calls are no-ops.
    ///
    /// Stops both loops, tears every registered stream down silently,
    /// closes the socket and removes the connection from the master
    /// registry.
    pub async fn stop(&self) {
        let mut stopped = self.stopped.lock().await;
        if *stopped {
            return;
        }

        self.exit_read.send_replace(true);
        self.daemon_stop.send_replace(true);

        let streams = self.streams.drain().await;
        let torn_down = streams.len();
        for (_, stream) in streams {
            stream.close_silently();
        }

        self.writer.close().await;
        self.master.deregister(self.id).await;

        *stopped = true;
        tracing::info!(conn = %self.id, torn_down, "connection stopped");
    }

    async fn read_loop<R>(self: Arc<Self>, mut reader: R, mut exit: watch::Receiver<bool>)
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let cycle = tokio::select! {
                biased;
                _ = exit.wait_for(|stop| *stop) => break,
                cycle = self.read_cycle(&mut reader) => cycle,
            };
            if let Err(err) = cycle {
                self.broadcast(err).await;
                break;
            }
        }
        tracing::debug!(conn = %self.id, "read loop exited");
    }

    async fn read_cycle<R>(self: &Arc<Self>, reader: &mut R) -> Result<(), MuxError>
    where
        R: AsyncRead + Unpin,
    {
        let header = read_header(reader).await?;
        let id = header.stream_id;

        match header.kind {
            HeaderKind::Control(Command::Hello) => {
                tracing::debug!(conn = %self.id, stream = %id, "hello received");
                match &self.on_new_stream {
                    Some(on_new_stream) => on_new_stream(Arc::clone(self), id).await,
                    None => tracing::debug!(conn = %self.id, stream = %id, "no new-stream handler"),
                }
                self.writer
                    .write_frame(&Frame::control(id, Command::Ack))
                    .await?;
            }
            HeaderKind::Control(Command::Ping) => {
                tracing::trace!(conn = %self.id, "ping received");
            }
            HeaderKind::Control(cmd) => {
                if let Some(stream) = self.streams.get(id).await {
                    let acked = stream.try_ack(cmd);
                    let delivered = stream.try_deliver(ReadEvent::Command(cmd));
                    tracing::debug!(conn = %self.id, stream = %id, ?cmd, acked, delivered, "command relayed");
                }
            }
            HeaderKind::Data { len } => {
                let mut payload = vec![0u8; len];
                // A failed payload read goes to the stream only; the next
                // header read hits the same fault and broadcasts it.
                let event = match reader.read_exact(&mut payload).await {
                    Ok(_) => ReadEvent::Data(Bytes::from(payload)),
                    Err(err) => ReadEvent::PayloadFailed(MuxError::from(err)),
                };
                match self.streams.get(id).await {
                    Some(stream) => stream.deliver(event).await,
                    None => {
                        tracing::debug!(conn = %self.id, stream = %id, "data for unknown stream");
                        self.writer
                            .write_frame(&Frame::control(id, Command::Close))
                            .await?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn keepalive(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let period = self.config.ping_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = stop.wait_for(|stop| *stop) => break,
                _ = ticker.tick() => {}
            }

            let removed = self.collect_garbage().await;
            if removed > 0 {
                tracing::debug!(conn = %self.id, removed, "garbage collected streams");
            }

            if let Err(err) = self.writer.write_frame(&Frame::ping()).await {
                self.broadcast(err).await;
                break;
            }
        }
        tracing::debug!(conn = %self.id, "keepalive exited");
    }
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("id", &self.id)
            .field("streams", &self.streams)
            .field("writer", &self.writer)
            .field("config", &self.config)
            .field("broadcasting", &self.broadcasting.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Builder for [`Supervisor`].
pub struct SupervisorBuilder {
    master: Arc<MasterRegistry>,
    config: MuxConfig,
    role: Role,
    on_new_stream: Option<NewStreamCallback>,
    on_error: Option<ErrorCallback>,
}

impl SupervisorBuilder {
    /// Sets the connection settings.
    #[must_use]
    pub fn config(mut self, config: MuxConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets which side of the connection this is.
    #[must_use]
    pub const fn role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    /// Sets the handler run for every inbound hello.
    #[must_use]
    pub fn on_new_stream<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Arc<Supervisor>, StreamId) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_new_stream = Some(Arc::new(move |conn: Arc<Supervisor>, id: StreamId| {
            handler(conn, id).boxed()
        }));
        self
    }

    /// Sets the observer run for every fatal connection error.
    #[must_use]
    pub fn on_error<F>(mut self, observer: F) -> Self
    where
        F: Fn(&MuxError) -> bool + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(observer));
        self
    }

    /// Takes ownership of `io`, registers the supervisor in the master
    /// registry and spawns its read and keepalive tasks.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`MuxError::Config`] for invalid settings or
    /// [`MuxError::AlreadyRegistered`] if the allocated id is taken.
    pub async fn start<T>(self, io: T) -> Result<Arc<Supervisor>, MuxError>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.config.validate()?;

        let (reader, writer) = tokio::io::split(io);
        let (exit_read, exit_rx) = watch::channel(false);
        let (daemon_stop, daemon_rx) = watch::channel(false);
        let first_stream_id = match self.role {
            Role::Client => 1,
            Role::Server => 2,
        };

        let supervisor = Arc::new(Supervisor {
            id: self.master.allocate_id(),
            master: Arc::clone(&self.master),
            streams: Registry::new(),
            writer: FrameWriter::new(writer),
            config: self.config,
            on_new_stream: self.on_new_stream,
            on_error: self.on_error,
            exit_read,
            daemon_stop,
            stopped: Mutex::new(false),
            broadcasting: AtomicBool::new(false),
            next_stream_id: AtomicU32::new(first_stream_id),
        });

        self.master.register(Arc::clone(&supervisor)).await?;
        tokio::spawn(Arc::clone(&supervisor).keepalive(daemon_rx));
        tokio::spawn(Arc::clone(&supervisor).read_loop(reader, exit_rx));

        tracing::info!(conn = %supervisor.id, role = ?self.role, "connection started");
        Ok(supervisor)
    }
}

impl fmt::Debug for SupervisorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SupervisorBuilder")
            .field("config", &self.config)
            .field("role", &self.role)
            .field("on_new_stream", &self.on_new_stream.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish_non_exhaustive()
    }
}
