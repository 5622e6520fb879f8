//! Connection lifecycle state.

/// Lifecycle of a [`Connection`](super::Connection).
///
/// Outbound connections move `Initial -> Connecting -> Connected -> Closed`
/// (or straight from `Connecting` to `Closed` when the connect fails).
/// Server-accepted connections start at `Connected`. `Closed` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnectionState {
    /// Constructed, no connect attempt started yet.
    Initial,
    /// Outbound connect in progress.
    Connecting,
    /// Established; bytes flow in both directions.
    Connected,
    /// Shut down by either side or by a fatal error.
    Closed,
}

impl ConnectionState {
    /// Whether this is the terminal state.
    pub fn is_closed(self) -> bool {
        self == Self::Closed
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Initial
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initial => write!(f, "Initial"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}
