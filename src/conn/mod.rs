//! Connection layer: the per-connection supervisor, its serialised frame
//! writer, and the first-byte peeking wrapper.

pub mod peek;
pub mod supervisor;
pub mod writer;

pub use peek::PeekConn;
pub use supervisor::{ErrorCallback, NewStreamCallback, Role, Supervisor, SupervisorBuilder};
pub use writer::{FrameGuard, FrameWriter};
