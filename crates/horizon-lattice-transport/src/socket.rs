//! Socket primitives.
//!
//! Thin wrappers over `socket2` for the handful of calls the transport needs:
//! create, bind/listen, accept, connect, send, recv and shutdown. Every call
//! reports failures as a [`SocketError`], and [`SocketError::is_transient`]
//! is the single place that decides whether a failure is worth retrying.

use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, SocketAddrV4, TcpStream, ToSocketAddrs};
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::error::{NetworkError, Result};

const TARGET: &str = "horizon_lattice_transport::socket";

/// Timeout used when poking a listener awake during server shutdown.
const WAKE_TIMEOUT: Duration = Duration::from_millis(100);

/// A failed socket call.
///
/// Carries the platform's numeric error code (when there is one) and its
/// human-readable message.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct SocketError {
    kind: io::ErrorKind,
    code: Option<i32>,
    message: String,
}

impl SocketError {
    /// Create an error of the given kind that has no OS error code.
    pub fn new(kind: io::ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: None,
            message: message.into(),
        }
    }

    /// The platform error code, if the failure came from the OS.
    pub fn code(&self) -> Option<i32> {
        self.code
    }

    /// The portable error category.
    pub fn kind(&self) -> io::ErrorKind {
        self.kind
    }

    /// Human-readable description.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether the call should simply be retried (interrupted or would-block).
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
        )
    }

    /// Whether the call failed only because it would have blocked.
    ///
    /// Callers retrying a would-block failure yield before the next attempt.
    pub fn is_would_block(&self) -> bool {
        self.kind == io::ErrorKind::WouldBlock
    }
}

impl From<io::Error> for SocketError {
    fn from(err: io::Error) -> Self {
        Self {
            kind: err.kind(),
            code: err.raw_os_error(),
            message: err.to_string(),
        }
    }
}

/// A bidirectional byte stream a [`Connection`](crate::tcp::Connection) can run over.
///
/// All methods take `&self`: one thread blocks in [`read`](Self::read) while
/// another writes or shuts the stream down.
pub trait ByteStream: Send + Sync {
    /// Read into `buf`, blocking until at least one byte is available.
    ///
    /// `Ok(0)` means the peer closed the stream.
    fn read(&self, buf: &mut [u8]) -> std::result::Result<usize, SocketError>;

    /// Write some prefix of `buf`, returning how many bytes were taken.
    fn write(&self, buf: &[u8]) -> std::result::Result<usize, SocketError>;

    /// Shut down both directions. Blocked readers wake up with `Ok(0)` or an error.
    fn shutdown(&self) -> std::result::Result<(), SocketError>;
}

impl ByteStream for Socket {
    fn read(&self, buf: &mut [u8]) -> std::result::Result<usize, SocketError> {
        recv(self, buf)
    }

    fn write(&self, buf: &[u8]) -> std::result::Result<usize, SocketError> {
        send(self, buf)
    }

    fn shutdown(&self) -> std::result::Result<(), SocketError> {
        shutdown(self)
    }
}

/// Resolve `host` to its first IPv4 address.
pub fn resolve_ipv4(host: &str, port: u16) -> Result<SocketAddrV4> {
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|e| NetworkError::resolve(host, e.to_string()))?;

    addrs
        .filter_map(|addr| match addr {
            SocketAddr::V4(v4) => Some(v4),
            SocketAddr::V6(_) => None,
        })
        .next()
        .ok_or_else(|| NetworkError::resolve(host, "no IPv4 address found"))
}

/// Create an unconnected IPv4 stream socket.
pub fn create_stream_socket() -> std::result::Result<Socket, SocketError> {
    Ok(Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?)
}

/// Connect `socket` to `addr`, blocking until the handshake finishes or fails.
pub fn connect(
    socket: &Socket,
    addr: SocketAddrV4,
    timeout: Option<Duration>,
) -> std::result::Result<(), SocketError> {
    let addr = SockAddr::from(addr);
    match timeout {
        Some(timeout) => socket.connect_timeout(&addr, timeout)?,
        None => socket.connect(&addr)?,
    }
    Ok(())
}

/// Create a listening socket on `0.0.0.0:port`.
///
/// Sets `SO_REUSEADDR` (and `SO_REUSEPORT` on platforms that have it when
/// `reuse_port` is set), binds and starts listening. On failure the
/// partially configured socket is dropped, which closes it.
pub fn create_listener(port: u16, backlog: u32, reuse_port: bool) -> Result<Socket> {
    let socket = create_stream_socket()?;

    socket.set_reuse_address(true).map_err(SocketError::from)?;
    #[cfg(all(
        unix,
        not(any(target_os = "solaris", target_os = "illumos", target_os = "cygwin"))
    ))]
    if reuse_port {
        socket.set_reuse_port(true).map_err(SocketError::from)?;
    }
    #[cfg(not(all(
        unix,
        not(any(target_os = "solaris", target_os = "illumos", target_os = "cygwin"))
    )))]
    let _ = reuse_port;

    let address = SockAddr::from(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
    socket.bind(&address).map_err(|e| NetworkError::Bind {
        port,
        source: e.into(),
    })?;

    let backlog = i32::try_from(backlog).unwrap_or(i32::MAX);
    socket.listen(backlog).map_err(SocketError::from)?;

    Ok(socket)
}

/// The IPv4 port a socket is bound to.
pub fn local_port(socket: &Socket) -> Option<u16> {
    socket
        .local_addr()
        .ok()
        .and_then(|addr| addr.as_socket_ipv4())
        .map(|addr| addr.port())
}

/// Accept one client from `listener`, blocking until one arrives.
pub fn accept(listener: &Socket) -> std::result::Result<(Socket, SocketAddrV4), SocketError> {
    let (socket, addr) = listener.accept()?;
    let peer = addr
        .as_socket_ipv4()
        .unwrap_or_else(|| SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
    Ok((socket, peer))
}

/// Apply `TCP_NODELAY` to a stream socket.
///
/// Failures are logged and otherwise ignored; the socket stays usable.
pub fn configure_stream(socket: Socket, no_delay: bool) -> Socket {
    let stream = TcpStream::from(socket);
    if let Err(e) = stream.set_nodelay(no_delay) {
        tracing::warn!(target: TARGET, "failed to set TCP_NODELAY: {}", e);
    }
    Socket::from(stream)
}

/// Send as much of `buf` as the socket takes in one call.
pub fn send(socket: &Socket, buf: &[u8]) -> std::result::Result<usize, SocketError> {
    Ok(Write::write(&mut &*socket, buf)?)
}

/// Receive into `buf`; `Ok(0)` means the peer closed the stream.
pub fn recv(socket: &Socket, buf: &mut [u8]) -> std::result::Result<usize, SocketError> {
    Ok(Read::read(&mut &*socket, buf)?)
}

/// Shut down both directions of `socket`.
pub fn shutdown(socket: &Socket) -> std::result::Result<(), SocketError> {
    Ok(socket.shutdown(Shutdown::Both)?)
}

/// Shut down both directions, then close the descriptor.
pub fn shutdown_and_close(socket: Socket) {
    if let Err(e) = shutdown(&socket) {
        tracing::debug!(target: TARGET, "shutdown before close failed: {}", e);
    }
    drop(socket);
}

/// Poke a blocked `accept` on `port` by connecting to it over loopback.
///
/// Used on platforms where shutting down a listening socket does not wake
/// the accepting thread.
pub fn wake_listener(port: u16) {
    let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port));
    if let Ok(stream) = TcpStream::connect_timeout(&addr, WAKE_TIMEOUT) {
        let _ = stream.shutdown(Shutdown::Both);
    }
}
