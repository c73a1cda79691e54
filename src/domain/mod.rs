//! Domain layer: identifiers and concurrent registries.
//!
//! This module contains the id newtypes shared by every layer, the generic
//! [`Registry`] used as a per-connection stream table, and the
//! [`MasterRegistry`] of live connections.

pub mod master;
pub mod registry;
pub mod stream_id;

pub use master::MasterRegistry;
pub use registry::Registry;
pub use stream_id::{ConnId, StreamId};
