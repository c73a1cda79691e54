//! Connection wrapper that can look at the first inbound byte.
//!
//! Useful for protocol sniffing on a shared listener: peek the first byte,
//! decide who handles the connection, then read normally with the byte
//! still in place.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// Wraps a connection and caches its first byte.
#[derive(Debug)]
pub struct PeekConn<T> {
    inner: T,
    /// The first byte, once read.
    first: Option<u8>,
    /// `true` while `first` has not yet been handed to a reader.
    pending: bool,
    /// Failure of the peek read, replayed on every later read.
    failed: Option<(io::ErrorKind, String)>,
    /// Error hit while filling the rest of the read that returned the
    /// peeked byte; reported by the next read.
    deferred: Option<io::Error>,
}

impl<T> PeekConn<T> {
    /// Wraps `inner` without reading from it.
    pub const fn new(inner: T) -> Self {
        Self {
            inner,
            first: None,
            pending: false,
            failed: None,
            deferred: None,
        }
    }

    /// Returns the wrapped connection.
    ///
    /// A byte that was peeked but not yet read is lost.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Shared access to the wrapped connection.
    pub const fn get_ref(&self) -> &T {
        &self.inner
    }

    fn cached_error(&self) -> Option<io::Error> {
        self.failed
            .as_ref()
            .map(|(kind, message)| io::Error::new(*kind, message.clone()))
    }
}

impl<T: AsyncRead + Unpin> PeekConn<T> {
    /// Returns the first byte of the connection without consuming it.
    ///
    /// Only the first call touches the connection; later calls return the
    /// cached byte or error.
    ///
    /// # Errors
    ///
    /// Returns the error of the underlying 1-byte read, or
    /// [`io::ErrorKind::UnexpectedEof`] if the peer closed before sending
    /// anything.
    pub async fn peek_first_byte(&mut self) -> io::Result<u8> {
        if let Some(err) = self.cached_error() {
            return Err(err);
        }
        if let Some(b) = self.first {
            return Ok(b);
        }

        let mut one = [0u8; 1];
        let read = self.inner.read(&mut one).await;
        let [byte] = one;
        let result = match read {
            Ok(1) => Ok(byte),
            Ok(_) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before the first byte",
            )),
            Err(err) => Err(err),
        };
        match result {
            Ok(b) => {
                self.first = Some(b);
                self.pending = true;
                Ok(b)
            }
            Err(err) => {
                self.failed = Some((err.kind(), err.to_string()));
                Err(err)
            }
        }
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for PeekConn<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(err) = this.cached_error().or_else(|| this.deferred.take()) {
            return Poll::Ready(Err(err));
        }
        if !this.pending || buf.remaining() == 0 {
            return Pin::new(&mut this.inner).poll_read(cx, buf);
        }

        let Some(first) = this.first else {
            this.pending = false;
            return Pin::new(&mut this.inner).poll_read(cx, buf);
        };
        buf.put_slice(&[first]);
        this.pending = false;

        if buf.remaining() > 0 {
            // The peeked byte is already in `buf`; anything the inner read
            // cannot supply right now is left for the next call.
            if let Poll::Ready(Err(err)) = Pin::new(&mut this.inner).poll_read(cx, buf) {
                tracing::debug!(error = %err, "read after peeked byte failed; deferring");
                this.deferred = Some(err);
            }
        }
        Poll::Ready(Ok(()))
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for PeekConn<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::indexing_slicing)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;

    #[tokio::test]
    async fn peeked_byte_is_prepended_to_the_next_read() {
        let source: &[u8] = &[0xAB, 1, 2, 3, 4, 5];
        let mut conn = PeekConn::new(source);

        let Ok(first) = conn.peek_first_byte().await else {
            panic!("peek failed");
        };
        assert_eq!(first, 0xAB);
        let Ok(again) = conn.peek_first_byte().await else {
            panic!("second peek failed");
        };
        assert_eq!(again, 0xAB);

        let mut buf = [0u8; 4];
        let Ok(n) = conn.read(&mut buf).await else {
            panic!("read failed");
        };
        assert_eq!(n, 4);
        assert_eq!(buf, [0xAB, 1, 2, 3]);

        let mut rest = Vec::new();
        let Ok(_) = conn.read_to_end(&mut rest).await else {
            panic!("read_to_end failed");
        };
        assert_eq!(rest, vec![4, 5]);
    }

    #[tokio::test]
    async fn reads_without_peek_pass_through() {
        let source: &[u8] = b"plain";
        let mut conn = PeekConn::new(source);
        let mut out = Vec::new();
        let Ok(_) = conn.read_to_end(&mut out).await else {
            panic!("read failed");
        };
        assert_eq!(out, b"plain");
    }

    #[tokio::test]
    async fn peek_error_is_replayed_without_touching_the_source() {
        let mock = tokio_test::io::Builder::new()
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();
        let mut conn = PeekConn::new(mock);

        let Err(err) = conn.peek_first_byte().await else {
            panic!("expected peek error");
        };
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);

        let mut buf = [0u8; 8];
        let Err(err) = conn.read(&mut buf).await else {
            panic!("expected cached error");
        };
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        let Err(err) = conn.peek_first_byte().await else {
            panic!("expected cached error");
        };
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }

    #[tokio::test]
    async fn peek_on_closed_connection_is_eof() {
        let source: &[u8] = &[];
        let mut conn = PeekConn::new(source);
        let Err(err) = conn.peek_first_byte().await else {
            panic!("expected eof");
        };
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn one_byte_buffer_gets_only_the_peeked_byte() {
        let source: &[u8] = &[9, 8, 7];
        let mut conn = PeekConn::new(source);
        let _ = conn.peek_first_byte().await;

        let mut buf = [0u8; 1];
        let Ok(1) = conn.read(&mut buf).await else {
            panic!("read failed");
        };
        assert_eq!(buf[0], 9);
        let Ok(1) = conn.read(&mut buf).await else {
            panic!("read failed");
        };
        assert_eq!(buf[0], 8);
    }

    #[tokio::test]
    async fn writes_pass_through() {
        let (local, mut remote) = tokio::io::duplex(64);
        let mut conn = PeekConn::new(local);
        let Ok(()) = conn.write_all(b"pong").await else {
            panic!("write failed");
        };
        let mut buf = [0u8; 4];
        let Ok(_) = remote.read_exact(&mut buf).await else {
            panic!("read failed");
        };
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn error_behind_the_peeked_byte_is_reported_next() {
        let mock = tokio_test::io::Builder::new()
            .read(&[0xCD])
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();
        let mut conn = PeekConn::new(mock);
        let Ok(0xCD) = conn.peek_first_byte().await else {
            panic!("peek failed");
        };

        let mut buf = [0u8; 8];
        let Ok(1) = conn.read(&mut buf).await else {
            panic!("expected the peeked byte alone");
        };
        assert_eq!(buf[0], 0xCD);
        let Err(err) = conn.read(&mut buf).await else {
            panic!("expected the deferred error");
        };
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }
}
