//! Error types for the transport module.

use crate::socket::SocketError;

/// Transport-level errors.
///
/// Only foreground calls return these: opening servers and outbound
/// connections, sending, and starting the request client. Failures inside
/// background loops are turned into connection state changes instead.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// Host name could not be resolved to an IPv4 address.
    #[error("Could not resolve '{address}': {message}")]
    Resolve {
        /// The host name that was looked up.
        address: String,
        /// Resolver message.
        message: String,
    },
    /// A socket primitive failed.
    #[error("Socket error: {0}")]
    Socket(#[from] SocketError),
    /// The listening socket could not be bound to the requested port.
    #[error("Could not bind port {port}: {source}")]
    Bind {
        /// The requested port.
        port: u16,
        /// The underlying socket failure.
        #[source]
        source: SocketError,
    },
    /// The connection is not in the `Connected` state.
    #[error("Connection is not connected")]
    NotConnected,
    /// The peer closed the connection while data was being written.
    #[error("Peer closed the connection during send")]
    PeerClosed,
    /// The request client could not be started.
    #[error("Request runtime error: {0}")]
    Runtime(String),
}

impl NetworkError {
    /// Create a resolution error.
    pub(crate) fn resolve(address: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Resolve {
            address: address.into(),
            message: message.into(),
        }
    }
}

/// A specialized Result type for transport operations.
pub type Result<T> = std::result::Result<T, NetworkError>;
