//! Process-wide table of live physical connections.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use super::{ConnId, Registry};
use crate::conn::Supervisor;
use crate::error::MuxError;

/// Table of every running [`Supervisor`], keyed by [`ConnId`].
///
/// Create one at application start and hand an `Arc` to every supervisor.
/// A supervisor registers itself when started and deregisters only from
/// its shutdown path; closing all of a connection's streams leaves the
/// connection in place.
#[derive(Debug)]
pub struct MasterRegistry {
    connections: Registry<ConnId, Supervisor>,
    next_id: AtomicU32,
}

impl MasterRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: Registry::new(),
            next_id: AtomicU32::new(1),
        }
    }

    /// Allocates a connection id that has not been handed out before.
    pub fn allocate_id(&self) -> ConnId {
        ConnId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Adds a running supervisor.
    ///
    /// # Errors
    ///
    /// Returns [`MuxError::AlreadyRegistered`] if the id is already live.
    pub async fn register(&self, supervisor: Arc<Supervisor>) -> Result<(), MuxError> {
        self.connections.insert(supervisor.id(), supervisor).await
    }

    /// Removes a connection. Returns `true` if it was present.
    pub async fn deregister(&self, id: ConnId) -> bool {
        self.connections.remove(id).await.is_some()
    }

    /// Looks up a live connection.
    pub async fn get(&self, id: ConnId) -> Option<Arc<Supervisor>> {
        self.connections.get(id).await
    }

    /// Returns the ids of all live connections.
    pub async fn ids(&self) -> Vec<ConnId> {
        let mut ids: Vec<ConnId> = self
            .connections
            .snapshot()
            .await
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Returns the number of live connections.
    pub async fn len(&self) -> usize {
        self.connections.len().await
    }

    /// Returns `true` if no connection is live.
    pub async fn is_empty(&self) -> bool {
        self.connections.is_empty().await
    }
}

impl Default for MasterRegistry {
    fn default() -> Self {
        Self::new()
    }
}
