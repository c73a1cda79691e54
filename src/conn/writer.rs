//! Serialised frame output for one physical connection.

use std::fmt;
use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, MutexGuard, watch};

use crate::error::MuxError;
use crate::protocol::Frame;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Shared write half of a physical connection.
///
/// Each frame is encoded up front and written while holding the lock, so
/// frames from the supervisor and from every stream land on the wire whole
/// and never interleave. Cloning shares the same connection.
///
/// [`FrameWriter::close`] raises a closing signal before it takes the
/// lock. A write blocked on a peer that stopped draining observes the
/// signal and gives the lock up, so closing never waits on the socket.
#[derive(Clone)]
pub struct FrameWriter {
    inner: Arc<Mutex<Option<BoxedWriter>>>,
    closing: Arc<watch::Sender<bool>>,
}

impl FrameWriter {
    /// Wraps the write half of a connection.
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (closing, _) = watch::channel(false);
        Self {
            inner: Arc::new(Mutex::new(Some(Box::new(writer)))),
            closing: Arc::new(closing),
        }
    }

    /// Takes exclusive use of the connection.
    ///
    /// Waiting for the lock is cancel-safe. Frames written through the
    /// returned guard are either completed or abandoned only because the
    /// connection is closing.
    ///
    /// # Errors
    ///
    /// Returns [`MuxError::ConnectionClosed`] once [`FrameWriter::close`]
    /// has been called.
    pub async fn lock(&self) -> Result<FrameGuard<'_>, MuxError> {
        let mut closing = self.closing.subscribe();
        if *closing.borrow_and_update() {
            return Err(MuxError::ConnectionClosed);
        }
        let guard = tokio::select! {
            biased;
            _ = closing.wait_for(|closing| *closing) => return Err(MuxError::ConnectionClosed),
            guard = self.inner.lock() => guard,
        };
        if guard.is_none() {
            return Err(MuxError::ConnectionClosed);
        }
        Ok(FrameGuard { guard, closing })
    }

    /// Writes one complete frame and flushes it.
    ///
    /// # Errors
    ///
    /// Returns [`MuxError::PayloadTooLarge`] for an oversized payload,
    /// [`MuxError::ConnectionClosed`] once the writer is closing, or
    /// [`MuxError::Transport`] if the socket write fails.
    pub async fn write_frame(&self, frame: &Frame) -> Result<(), MuxError> {
        self.lock().await?.write_frame(frame).await
    }

    /// Shuts the write half down and drops it. Later writes fail with
    /// [`MuxError::ConnectionClosed`]; a write in progress is abandoned.
    pub async fn close(&self) {
        self.closing.send_replace(true);
        let taken = self.inner.lock().await.take();
        if let Some(mut writer) = taken
            && let Err(err) = writer.shutdown().await
        {
            tracing::debug!(error = %err, "shutdown of write half failed");
        }
    }

    /// Returns `true` once [`FrameWriter::close`] has been called.
    pub fn is_closed(&self) -> bool {
        *self.closing.borrow()
    }
}

impl fmt::Debug for FrameWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameWriter")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Exclusive access to a [`FrameWriter`], held across one or more frames.
pub struct FrameGuard<'a> {
    guard: MutexGuard<'a, Option<BoxedWriter>>,
    closing: watch::Receiver<bool>,
}

impl FrameGuard<'_> {
    /// Writes one complete frame and flushes it. Only a closing writer
    /// interrupts the frame midway.
    ///
    /// # Errors
    ///
    /// Returns [`MuxError::PayloadTooLarge`] for an oversized payload,
    /// [`MuxError::ConnectionClosed`] if the writer closes first, or
    /// [`MuxError::Transport`] if the socket write fails.
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), MuxError> {
        let wire = frame.encode()?;
        let Some(writer) = self.guard.as_mut() else {
            return Err(MuxError::ConnectionClosed);
        };
        let write = async {
            writer.write_all(&wire).await?;
            writer.flush().await
        };
        tokio::select! {
            biased;
            _ = self.closing.wait_for(|closing| *closing) => Err(MuxError::ConnectionClosed),
            written = write => written.map_err(MuxError::from),
        }
    }
}

impl fmt::Debug for FrameGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameGuard")
            .field("closing", &*self.closing.borrow())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::domain::StreamId;
    use crate::protocol::{Command, read_frame};

    #[tokio::test]
    async fn concurrent_writers_never_interleave() {
        let (local, mut peer) = tokio::io::duplex(1 << 20);
        let writer = FrameWriter::new(local);

        let mut tasks = Vec::new();
        for raw in 1..=8u32 {
            let writer = writer.clone();
            tasks.push(tokio::spawn(async move {
                let frame = Frame::data(StreamId::new(raw), vec![raw as u8; 4096]);
                writer.write_frame(&frame).await
            }));
        }
        for task in tasks {
            let Ok(result) = task.await else {
                panic!("writer task panicked");
            };
            assert!(result.is_ok());
        }

        for _ in 0..8 {
            let Ok(frame) = read_frame(&mut peer).await else {
                panic!("expected frame");
            };
            let expected = Frame::data(frame.stream_id, vec![frame.stream_id.get() as u8; 4096]);
            assert_eq!(frame, expected);
        }
    }

    #[tokio::test]
    async fn writes_after_close_fail() {
        let (local, _peer) = tokio::io::duplex(64);
        let writer = FrameWriter::new(local);
        writer.close().await;
        assert!(writer.is_closed());

        let result = writer
            .write_frame(&Frame::control(StreamId::new(1), Command::Ping))
            .await;
        assert!(matches!(result, Err(MuxError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn peer_hangup_surfaces_as_transport_error() {
        let (local, peer) = tokio::io::duplex(64);
        drop(peer);
        let writer = FrameWriter::new(local);
        let result = writer.write_frame(&Frame::ping()).await;
        assert!(matches!(result, Err(MuxError::Transport(_))));
    }

    #[tokio::test]
    async fn close_abandons_a_write_blocked_on_a_full_socket() {
        let (local, _peer) = tokio::io::duplex(8);
        let writer = FrameWriter::new(local);

        let blocked = writer.clone();
        let pending = tokio::spawn(async move {
            blocked
                .write_frame(&Frame::data(StreamId::new(1), vec![0u8; 64]))
                .await
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!pending.is_finished());

        let Ok(()) = tokio::time::timeout(std::time::Duration::from_secs(1), writer.close()).await
        else {
            panic!("close waited on the blocked write");
        };
        let Ok(result) = pending.await else {
            panic!("writer task panicked");
        };
        assert!(matches!(result, Err(MuxError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn guard_writes_several_frames_back_to_back() {
        let (local, mut peer) = tokio::io::duplex(1024);
        let writer = FrameWriter::new(local);
        {
            let Ok(mut guard) = writer.lock().await else {
                panic!("lock failed");
            };
            for raw in [1u32, 3] {
                let Ok(()) = guard.write_frame(&Frame::control(StreamId::new(raw), Command::Ack)).await
                else {
                    panic!("guarded write failed");
                };
            }
        }
        for raw in [1u32, 3] {
            let Ok(frame) = read_frame(&mut peer).await else {
                panic!("expected frame");
            };
            assert_eq!(frame, Frame::control(StreamId::new(raw), Command::Ack));
        }
    }
}
