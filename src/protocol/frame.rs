//! Wire framing for multiplexed streams.
//!
//! Every frame starts with a fixed 7-byte header. The last two header
//! bytes either carry a control command or the length of the payload that
//! follows.
//!
//! ```text
//! +---------+----------------+-----------------+-----------------+---------+
//! | version | stream id (u32)| marker | len hi | command | len lo | payload |
//! |  0x89   |   big-endian   |  0xFF  |        |  != 0   |        |         |
//! +---------+----------------+-----------------+-----------------+---------+
//!   1 byte       4 bytes          1 byte            1 byte         len bytes
//!                  <- fixed 7 bytes ->
//! ```
//!
//! Byte 5 equal to [`CONTROL_MARKER`] with a non-zero byte 6 is a control
//! frame and has no payload. Anything else is a data frame whose payload
//! length is bytes 5..7 read as a big-endian `u16`.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::domain::StreamId;
use crate::error::MuxError;

/// Protocol version carried in byte 0 of every header.
pub const VERSION: u8 = 0x89;

/// Fixed header size: version(1) + stream id(4) + marker/len(2).
pub const HEADER_LEN: usize = 7;

/// Value of byte 5 that marks a control frame.
pub const CONTROL_MARKER: u8 = 0xFF;

/// Largest payload a data frame may carry.
///
/// Any length up to this value has either a high byte below the control
/// marker or a zero low byte, so it can never be read back as a command.
pub const MAX_PAYLOAD_LEN: usize = 0xFF00;

/// Control commands exchanged between peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Request a new stream; the peer answers with [`Command::Ack`].
    Hello,
    /// Keepalive. Needs no reply.
    Ping,
    /// Acknowledges a hello for the same stream id.
    Ack,
    /// The named stream is unknown to the sender or has been closed.
    Close,
    /// A non-zero command byte this implementation does not define.
    Other(u8),
}

impl Command {
    /// Returns the wire byte for this command.
    #[must_use]
    pub const fn to_byte(self) -> u8 {
        match self {
            Self::Hello => 1,
            Self::Ping => 2,
            Self::Ack => 3,
            Self::Close => 4,
            Self::Other(b) => b,
        }
    }

    /// Parses a command byte. Zero is not a command.
    #[must_use]
    pub const fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => None,
            1 => Some(Self::Hello),
            2 => Some(Self::Ping),
            3 => Some(Self::Ack),
            4 => Some(Self::Close),
            other => Some(Self::Other(other)),
        }
    }
}

/// What follows a decoded header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderKind {
    /// Control frame; nothing follows.
    Control(Command),
    /// Data frame; `len` payload bytes follow.
    Data {
        /// Payload length in bytes.
        len: usize,
    },
}

/// A decoded 7-byte frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Stream the frame is addressed to.
    pub stream_id: StreamId,
    /// Control command or payload length.
    pub kind: HeaderKind,
}

impl FrameHeader {
    /// Parses a raw header.
    ///
    /// # Errors
    ///
    /// Returns [`MuxError::InvalidVersion`] if byte 0 is not [`VERSION`].
    pub fn parse(raw: [u8; HEADER_LEN]) -> Result<Self, MuxError> {
        let [version, a, b, c, d, hi, lo] = raw;
        if version != VERSION {
            return Err(MuxError::InvalidVersion(version));
        }
        let stream_id = StreamId::new(u32::from_be_bytes([a, b, c, d]));
        let kind = match Command::from_byte(lo) {
            Some(cmd) if hi == CONTROL_MARKER => HeaderKind::Control(cmd),
            _ => HeaderKind::Data {
                len: usize::from(u16::from_be_bytes([hi, lo])),
            },
        };
        Ok(Self { stream_id, kind })
    }

    /// Serialises this header.
    ///
    /// # Errors
    ///
    /// Returns [`MuxError::PayloadTooLarge`] for a data length above
    /// [`MAX_PAYLOAD_LEN`].
    pub fn encode(&self) -> Result<[u8; HEADER_LEN], MuxError> {
        let [hi, lo] = match self.kind {
            HeaderKind::Control(cmd) => [CONTROL_MARKER, cmd.to_byte()],
            HeaderKind::Data { len } => {
                if len > MAX_PAYLOAD_LEN {
                    return Err(MuxError::PayloadTooLarge(len));
                }
                u16::try_from(len)
                    .map_err(|_| MuxError::PayloadTooLarge(len))?
                    .to_be_bytes()
            }
        };
        let [a, b, c, d] = self.stream_id.get().to_be_bytes();
        Ok([VERSION, a, b, c, d, hi, lo])
    }
}

/// Body of a complete frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameBody {
    /// Control command.
    Control(Command),
    /// Stream payload.
    Data(Bytes),
}

/// A complete frame: header plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Stream the frame is addressed to.
    pub stream_id: StreamId,
    /// Control command or payload.
    pub body: FrameBody,
}

impl Frame {
    /// Builds a control frame.
    #[must_use]
    pub const fn control(stream_id: StreamId, cmd: Command) -> Self {
        Self {
            stream_id,
            body: FrameBody::Control(cmd),
        }
    }

    /// Builds a data frame.
    #[must_use]
    pub fn data(stream_id: StreamId, payload: impl Into<Bytes>) -> Self {
        Self {
            stream_id,
            body: FrameBody::Data(payload.into()),
        }
    }

    /// Builds the connection-level keepalive frame.
    #[must_use]
    pub const fn ping() -> Self {
        Self::control(StreamId::CONNECTION, Command::Ping)
    }

    /// Returns the header describing this frame.
    #[must_use]
    pub fn header(&self) -> FrameHeader {
        let kind = match &self.body {
            FrameBody::Control(cmd) => HeaderKind::Control(*cmd),
            FrameBody::Data(payload) => HeaderKind::Data { len: payload.len() },
        };
        FrameHeader {
            stream_id: self.stream_id,
            kind,
        }
    }

    /// Serialises header and payload into one buffer.
    ///
    /// # Errors
    ///
    /// Returns [`MuxError::PayloadTooLarge`] if the payload exceeds
    /// [`MAX_PAYLOAD_LEN`].
    pub fn encode(&self) -> Result<Bytes, MuxError> {
        let header = self.header().encode()?;
        let payload: &[u8] = match &self.body {
            FrameBody::Control(_) => &[],
            FrameBody::Data(payload) => payload.as_ref(),
        };
        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
        buf.put_slice(&header);
        buf.put_slice(payload);
        Ok(buf.freeze())
    }

    /// Decodes one frame from the start of `buf`, returning it together
    /// with the number of bytes consumed.
    ///
    /// # Errors
    ///
    /// Returns [`MuxError::Truncated`] if `buf` ends early and
    /// [`MuxError::InvalidVersion`] on a version mismatch.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), MuxError> {
        let raw: [u8; HEADER_LEN] = buf
            .get(..HEADER_LEN)
            .and_then(|head| head.try_into().ok())
            .ok_or(MuxError::Truncated {
                needed: HEADER_LEN,
                available: buf.len(),
            })?;
        let header = FrameHeader::parse(raw)?;
        match header.kind {
            HeaderKind::Control(cmd) => Ok((Self::control(header.stream_id, cmd), HEADER_LEN)),
            HeaderKind::Data { len } => {
                let end = HEADER_LEN + len;
                let payload = buf.get(HEADER_LEN..end).ok_or(MuxError::Truncated {
                    needed: end,
                    available: buf.len(),
                })?;
                Ok((
                    Self::data(header.stream_id, Bytes::copy_from_slice(payload)),
                    end,
                ))
            }
        }
    }
}

/// Reads exactly one header from `reader`.
///
/// # Errors
///
/// Returns [`MuxError::Transport`] on I/O failure (including EOF) and
/// [`MuxError::InvalidVersion`] on a bad version byte.
pub async fn read_header<R>(reader: &mut R) -> Result<FrameHeader, MuxError>
where
    R: AsyncRead + Unpin,
{
    let mut raw = [0u8; HEADER_LEN];
    reader.read_exact(&mut raw).await?;
    FrameHeader::parse(raw)
}

/// Reads one complete frame from `reader`.
///
/// # Errors
///
/// Same as [`read_header`], plus [`MuxError::Transport`] if the payload
/// cannot be read in full.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, MuxError>
where
    R: AsyncRead + Unpin,
{
    let header = read_header(reader).await?;
    match header.kind {
        HeaderKind::Control(cmd) => Ok(Frame::control(header.stream_id, cmd)),
        HeaderKind::Data { len } => {
            let mut payload = vec![0u8; len];
            reader.read_exact(&mut payload).await?;
            Ok(Frame::data(header.stream_id, payload))
        }
    }
}
