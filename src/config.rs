//! Multiplexer configuration loaded from environment variables.
//!
//! Follows 12-factor style: all settings come from environment variables
//! (or a `.env` file via `dotenvy`), with defaults for anything unset.

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::MuxError;

/// Per-connection tuning shared by every supervisor built from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxConfig {
    /// Interval between keepalive pings, which is also the garbage
    /// collection period.
    pub ping_interval: Duration,

    /// Idle timeout applied to streams without their own override.
    /// `Duration::ZERO` disables idle collection.
    pub idle_timeout: Duration,

    /// How long [`crate::stream::MuxStream::open`] waits for an ack.
    pub handshake_timeout: Duration,

    /// Capacity of each stream's event and ack queues.
    pub stream_queue_capacity: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(60),
            handshake_timeout: Duration::from_secs(10),
            stream_queue_capacity: 64,
        }
    }
}

impl MuxConfig {
    /// Loads configuration from environment variables.
    ///
    /// | Variable                     | Default |
    /// |------------------------------|---------|
    /// | `MUX_PING_INTERVAL_SECS`     | 5       |
    /// | `MUX_IDLE_TIMEOUT_SECS`      | 60 (0 disables) |
    /// | `MUX_HANDSHAKE_TIMEOUT_SECS` | 10      |
    /// | `MUX_STREAM_QUEUE_CAPACITY`  | 64      |
    ///
    /// # Errors
    ///
    /// Returns [`MuxError::Config`] if the resulting values fail
    /// [`MuxConfig::validate`].
    pub fn from_env() -> Result<Self, MuxError> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();
        let config = Self {
            ping_interval: Duration::from_secs(parse_env(
                "MUX_PING_INTERVAL_SECS",
                defaults.ping_interval.as_secs(),
            )),
            idle_timeout: Duration::from_secs(parse_env(
                "MUX_IDLE_TIMEOUT_SECS",
                defaults.idle_timeout.as_secs(),
            )),
            handshake_timeout: Duration::from_secs(parse_env(
                "MUX_HANDSHAKE_TIMEOUT_SECS",
                defaults.handshake_timeout.as_secs(),
            )),
            stream_queue_capacity: parse_env(
                "MUX_STREAM_QUEUE_CAPACITY",
                defaults.stream_queue_capacity,
            ),
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks that the values can drive a supervisor.
    ///
    /// # Errors
    ///
    /// Returns [`MuxError::Config`] for a zero ping interval or a zero
    /// queue capacity.
    pub fn validate(&self) -> Result<(), MuxError> {
        if self.ping_interval.is_zero() {
            return Err(MuxError::Config("ping interval must be non-zero".to_string()));
        }
        if self.stream_queue_capacity == 0 {
            return Err(MuxError::Config(
                "stream queue capacity must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration for the demo echo server binary.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address to listen on (e.g. `0.0.0.0:7400`).
    pub listen_addr: SocketAddr,

    /// Settings for every accepted connection.
    pub mux: MuxConfig,
}

impl ServerConfig {
    /// Loads configuration from environment variables.
    ///
    /// Reads `MUX_LISTEN_ADDR` (default `0.0.0.0:7400`) plus everything
    /// [`MuxConfig::from_env`] reads.
    ///
    /// # Errors
    ///
    /// Returns [`MuxError::Config`] if `MUX_LISTEN_ADDR` cannot be parsed
    /// or the multiplexer settings are invalid.
    pub fn from_env() -> Result<Self, MuxError> {
        dotenvy::dotenv().ok();

        let raw = std::env::var("MUX_LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:7400".to_string());
        let listen_addr = raw
            .parse()
            .map_err(|e| MuxError::Config(format!("invalid MUX_LISTEN_ADDR {raw:?}: {e}")))?;

        Ok(Self {
            listen_addr,
            mux: MuxConfig::from_env()?,
        })
    }
}

/// Parses an environment variable as `T`, returning `default` on missing
/// or invalid values.
fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
