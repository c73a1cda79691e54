//! # tcp-mux
//!
//! Multiplexes many ordered, bidirectional logical streams over a single
//! TCP connection using a 7-byte binary frame header, periodic keepalive
//! and automatic garbage collection of closed or idle streams.
//!
//! ## Architecture
//!
//! ```text
//! Application
//!     │
//!     ├── StreamEndpoint / MuxStream (stream/)
//!     │
//!     ├── Supervisor: read loop, keepalive + GC, broadcast, stop (conn/)
//!     ├── FrameWriter (conn/)
//!     │
//!     ├── Frame codec (protocol/)
//!     ├── Registry / MasterRegistry (domain/)
//!     │
//!     └── TCP socket (optionally wrapped in PeekConn)
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! let master = Arc::new(MasterRegistry::new());
//! let socket = tokio::net::TcpStream::connect("127.0.0.1:7400").await?;
//! let conn = Supervisor::builder(master).start(socket).await?;
//!
//! let mut stream = MuxStream::open(&conn).await?;
//! stream.write(b"hello").await?;
//! let reply = stream.read().await?;
//! ```

pub mod config;
pub mod conn;
pub mod domain;
pub mod error;
pub mod protocol;
pub mod stream;

pub use config::MuxConfig;
pub use conn::{PeekConn, Role, Supervisor};
pub use domain::{ConnId, MasterRegistry, StreamId};
pub use error::{MuxError, Result};
pub use stream::{MuxStream, StreamEndpoint};
