//! Settings for TCP connections and servers.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default cap on unread inbound bytes per connection (1 MiB).
pub const DEFAULT_MAX_INBOUND_BUFFER: usize = 1 << 20;

/// Default size of the receive loop's scratch buffer (16 KiB).
pub const DEFAULT_READ_CHUNK_SIZE: usize = 16_384;

/// Socket-level settings shared by outbound and accepted connections.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpSettings {
    /// Maximum number of received-but-unread bytes per connection.
    ///
    /// A connection whose peer pushes past this limit is closed.
    pub max_inbound_buffer: usize,
    /// Scratch buffer size for each blocking read.
    pub read_chunk_size: usize,
    /// Listen backlog for servers.
    pub backlog: u32,
    /// Enable TCP_NODELAY (disable Nagle's algorithm).
    pub no_delay: bool,
    /// Set `SO_REUSEPORT` on listening sockets where the platform supports it.
    pub reuse_port: bool,
    /// Outbound connect timeout. `None` waits for the OS to give up.
    pub connect_timeout: Option<Duration>,
}

impl Default for TcpSettings {
    fn default() -> Self {
        Self {
            max_inbound_buffer: DEFAULT_MAX_INBOUND_BUFFER,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            backlog: 128,
            no_delay: false,
            reuse_port: true,
            connect_timeout: None,
        }
    }
}

impl TcpSettings {
    /// Create settings with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the inbound buffer cap.
    pub fn max_inbound_buffer(mut self, bytes: usize) -> Self {
        self.max_inbound_buffer = bytes;
        self
    }

    /// Set the receive scratch buffer size.
    pub fn read_chunk_size(mut self, bytes: usize) -> Self {
        self.read_chunk_size = bytes.max(1);
        self
    }

    /// Set the listen backlog.
    pub fn backlog(mut self, size: u32) -> Self {
        self.backlog = size;
        self
    }

    /// Enable or disable TCP_NODELAY.
    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.no_delay = enabled;
        self
    }

    /// Enable or disable `SO_REUSEPORT` on listeners.
    pub fn reuse_port(mut self, enabled: bool) -> Self {
        self.reuse_port = enabled;
        self
    }

    /// Set the outbound connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Wait for the OS to finish or fail the connect.
    pub fn no_connect_timeout(mut self) -> Self {
        self.connect_timeout = None;
        self
    }
}
