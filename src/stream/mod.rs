//! Stream layer: the interface the supervisor drives, and a channel-backed
//! implementation of it.

pub mod handle;
pub mod mux_stream;

pub use handle::{ReadEvent, StreamHandle};
pub use mux_stream::{MuxStream, StreamEndpoint};
