//! Type-safe stream and connection identifiers.
//!
//! [`StreamId`] and [`ConnId`] are newtype wrappers around `u32` so that a
//! stream id can never be confused with a connection id in a registry
//! lookup.

use std::fmt;

/// Identifier of a logical stream, unique within its physical connection.
///
/// Carried big-endian in bytes 1..5 of every frame header. Id `0` is
/// reserved for connection-level control frames such as pings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct StreamId(u32);

impl StreamId {
    /// Id used by frames that address the connection rather than a stream.
    pub const CONNECTION: Self = Self(0);

    /// Creates a `StreamId` from its raw value.
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw `u32` value.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

impl From<u32> for StreamId {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl From<StreamId> for u32 {
    fn from(id: StreamId) -> Self {
        id.0
    }
}

/// Identifier of a physical connection in the [`super::MasterRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u32);

impl ConnId {
    /// Creates a `ConnId` from its raw value.
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw `u32` value.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind() {
        assert_eq!(StreamId::new(42).to_string(), "stream#42");
        assert_eq!(ConnId::new(3).to_string(), "conn#3");
    }

    #[test]
    fn raw_round_trip() {
        let id = StreamId::from(0xDEAD_BEEF);
        assert_eq!(u32::from(id), 0xDEAD_BEEF);
        assert_eq!(id.get(), 0xDEAD_BEEF);
    }

    #[test]
    fn connection_id_is_zero() {
        assert_eq!(StreamId::CONNECTION, StreamId::default());
    }

    #[test]
    fn hash_works_in_hashmap() {
        use std::collections::HashMap;
        let id = StreamId::new(9);
        let mut map = HashMap::new();
        map.insert(id, "test");
        assert_eq!(map.get(&id), Some(&"test"));
    }
}
