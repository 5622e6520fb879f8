//! Byte-stream connection with a background receiver thread.

use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use socket2::Socket;

use super::config::TcpSettings;
use super::state::ConnectionState;
use crate::error::{NetworkError, Result};
use crate::socket::{self, ByteStream};

const TARGET: &str = "horizon_lattice_transport::tcp";

/// Identifier the registry assigns to a connection.
///
/// Identifiers increase monotonically and are never reused by one
/// [`Network`](crate::Network).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Bytes received but not yet read, plus the lifecycle state.
///
/// Both live behind one lock so `recv` sees a consistent pair.
struct Inbound {
    queue: VecDeque<u8>,
    state: ConnectionState,
}

/// State shared between the connection handle and its receiver thread.
struct Shared {
    peer: SocketAddrV4,
    inbound: Mutex<Inbound>,
    stream: Mutex<Option<Arc<dyn ByteStream>>>,
    released: AtomicBool,
    upload: AtomicU64,
    download: AtomicU64,
    max_inbound: usize,
    read_chunk_size: usize,
}

impl Shared {
    fn new(
        stream: Arc<dyn ByteStream>,
        peer: SocketAddrV4,
        state: ConnectionState,
        settings: &TcpSettings,
    ) -> Self {
        Self {
            peer,
            inbound: Mutex::new(Inbound {
                queue: VecDeque::new(),
                state,
            }),
            stream: Mutex::new(Some(stream)),
            released: AtomicBool::new(false),
            upload: AtomicU64::new(0),
            download: AtomicU64::new(0),
            max_inbound: settings.max_inbound_buffer,
            read_chunk_size: settings.read_chunk_size.max(1),
        }
    }

    fn state(&self) -> ConnectionState {
        self.inbound.lock().state
    }

    fn set_state(&self, state: ConnectionState) {
        self.inbound.lock().state = state;
    }

    fn stream(&self) -> Option<Arc<dyn ByteStream>> {
        self.stream.lock().clone()
    }

    /// Move `Connecting -> Connected` unless a close got there first.
    fn finish_connect(&self) -> bool {
        let mut inbound = self.inbound.lock();
        if inbound.state == ConnectionState::Connecting {
            inbound.state = ConnectionState::Connected;
            true
        } else {
            false
        }
    }

    /// Shut the stream down and drop our handle to it. Runs at most once.
    ///
    /// The descriptor closes when the last clone of the stream is dropped,
    /// so an in-flight read or write never touches a closed descriptor.
    fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let stream = self.stream.lock().take();
        if let Some(stream) = stream {
            if let Err(e) = stream.shutdown() {
                tracing::debug!(target: TARGET, peer = %self.peer, "shutdown failed: {}", e);
            }
        }
    }

    fn receive_loop(&self) {
        let Some(stream) = self.stream() else {
            self.set_state(ConnectionState::Closed);
            return;
        };
        let mut scratch = vec![0u8; self.read_chunk_size];

        while self.state() == ConnectionState::Connected {
            let size = match stream.read(&mut scratch) {
                Ok(0) => {
                    tracing::info!(target: TARGET, "closed connection with {}", self.peer);
                    break;
                }
                Ok(size) => size,
                Err(e) if e.is_transient() => continue,
                Err(e) => {
                    if self.state() == ConnectionState::Connected {
                        tracing::warn!(
                            target: TARGET,
                            code = ?e.code(),
                            "recv failed from {}: {}", self.peer, e
                        );
                    } else {
                        tracing::debug!(target: TARGET, "recv interrupted (closing) {}", self.peer);
                    }
                    break;
                }
            };

            {
                let mut inbound = self.inbound.lock();
                // A read that finished after close must not refill the queue.
                if inbound.state != ConnectionState::Connected {
                    break;
                }
                if inbound.queue.len() + size > self.max_inbound {
                    drop(inbound);
                    tracing::warn!(
                        target: TARGET,
                        "client {} exceeded input buffer limit, dropping", self.peer
                    );
                    break;
                }
                inbound.queue.extend(&scratch[..size]);
                self.download.fetch_add(size as u64, Ordering::Relaxed);
            }
            tracing::debug!(target: TARGET, "read {} bytes from {}", size, self.peer);
        }

        drop(stream);
        self.release();
        self.set_state(ConnectionState::Closed);
    }
}

/// One byte-stream endpoint, client- or server-side.
///
/// A background thread reads from the stream into an inbound queue; the
/// owner drains it with the non-blocking [`recv`](Self::recv) and writes with
/// the blocking [`send`](Self::send). Dropping the connection closes it.
///
/// # Example
///
/// ```ignore
/// let mut buf = [0u8; 1024];
/// match connection.recv(&mut buf) {
///     Some(0) => {} // nothing yet, poll again next tick
///     Some(n) => handle(&buf[..n]),
///     None => {} // closed and fully drained
/// }
/// connection.send(b"pong")?;
/// ```
pub struct Connection {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Wrap an established stream in a `Connected` connection and start its
    /// receiver thread.
    ///
    /// Server accept loops use this for sockets; tests and in-process
    /// loopbacks use it with [`MemoryStream`](crate::memory::MemoryStream).
    pub fn from_stream(
        stream: Arc<dyn ByteStream>,
        peer: SocketAddrV4,
        settings: &TcpSettings,
    ) -> Arc<Self> {
        let shared = Arc::new(Shared::new(
            stream,
            peer,
            ConnectionState::Connected,
            settings,
        ));

        let worker = {
            let shared = shared.clone();
            thread::Builder::new()
                .name(format!("tcp-recv-{peer}"))
                .spawn(move || shared.receive_loop())
        };

        Self::with_worker(shared, worker)
    }

    /// Start connecting `socket` to `peer` on a background thread.
    ///
    /// `on_connected` runs on that thread once the handshake succeeds, before
    /// the first read. A failed connect leaves the connection `Closed`.
    pub(crate) fn connect(
        socket: Socket,
        peer: SocketAddrV4,
        settings: &TcpSettings,
        on_connected: impl FnOnce() + Send + 'static,
    ) -> Arc<Self> {
        let socket = Arc::new(socket);
        let shared = Arc::new(Shared::new(
            socket.clone(),
            peer,
            ConnectionState::Initial,
            settings,
        ));
        let timeout = settings.connect_timeout;

        shared.set_state(ConnectionState::Connecting);
        let worker = {
            let shared = shared.clone();
            thread::Builder::new()
                .name(format!("tcp-connect-{peer}"))
                .spawn(move || {
                    tracing::info!(target: TARGET, "connecting to {}", peer);
                    let result = socket::connect(&socket, peer, timeout);
                    drop(socket);

                    if let Err(e) = result {
                        tracing::error!(
                            target: TARGET,
                            code = ?e.code(),
                            "connect to {} failed: {}", peer, e
                        );
                        shared.release();
                        shared.set_state(ConnectionState::Closed);
                        return;
                    }
                    if !shared.finish_connect() {
                        shared.release();
                        return;
                    }

                    tracing::info!(target: TARGET, "connected to {}", peer);
                    on_connected();
                    shared.receive_loop();
                })
        };

        Self::with_worker(shared, worker)
    }

    fn with_worker(shared: Arc<Shared>, worker: std::io::Result<JoinHandle<()>>) -> Arc<Self> {
        let worker = match worker {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::error!(
                    target: TARGET,
                    "could not start thread for {}: {}", shared.peer, e
                );
                shared.release();
                shared.set_state(ConnectionState::Closed);
                None
            }
        };

        Arc::new(Self {
            shared,
            worker: Mutex::new(worker),
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Remote IPv4 address.
    pub fn address(&self) -> Ipv4Addr {
        *self.shared.peer.ip()
    }

    /// Remote port.
    pub fn port(&self) -> u16 {
        self.shared.peer.port()
    }

    /// Remote socket address.
    pub fn peer_addr(&self) -> SocketAddrV4 {
        self.shared.peer
    }

    /// Number of received bytes waiting to be read.
    pub fn available(&self) -> usize {
        self.shared.inbound.lock().queue.len()
    }

    /// Move up to `buf.len()` queued bytes into `buf`. Never blocks.
    ///
    /// Returns `Some(n)` with the number of bytes copied, which is `0` when
    /// nothing has arrived yet. Returns `None` only once the connection is
    /// `Closed` and every received byte has been read.
    pub fn recv(&self, buf: &mut [u8]) -> Option<usize> {
        let mut inbound = self.shared.inbound.lock();
        if inbound.state == ConnectionState::Closed && inbound.queue.is_empty() {
            return None;
        }

        let size = buf.len().min(inbound.queue.len());
        for (dst, src) in buf.iter_mut().zip(inbound.queue.drain(..size)) {
            *dst = src;
        }
        Some(size)
    }

    /// Write all of `data`, blocking until it is sent or the connection fails.
    ///
    /// Interrupted and would-block writes are retried. A peer that stops
    /// accepting data, or any other write failure, closes the connection and
    /// returns an error. Fails immediately, without I/O, unless the
    /// connection is `Connected`.
    pub fn send(&self, data: &[u8]) -> Result<usize> {
        if self.state() != ConnectionState::Connected {
            return Err(NetworkError::NotConnected);
        }
        let Some(stream) = self.shared.stream() else {
            return Err(NetworkError::NotConnected);
        };

        let mut total = 0;
        while total < data.len() {
            match stream.write(&data[total..]) {
                Ok(0) => {
                    tracing::debug!(target: TARGET, "peer closed connection during send");
                    drop(stream);
                    self.close();
                    return Err(NetworkError::PeerClosed);
                }
                Ok(sent) => total += sent,
                Err(e) if e.is_transient() => {
                    if e.is_would_block() {
                        thread::yield_now();
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        target: TARGET,
                        code = ?e.code(),
                        "send to {} failed, closing socket: {}", self.shared.peer, e
                    );
                    drop(stream);
                    self.close();
                    return Err(NetworkError::Socket(e));
                }
            }
        }

        self.shared.upload.fetch_add(total as u64, Ordering::Relaxed);
        Ok(total)
    }

    /// Close the connection, keeping unread bytes available to `recv`.
    ///
    /// Blocks until the receiver thread has exited. Repeated and concurrent
    /// calls are no-ops.
    pub fn close(&self) {
        self.close_inner(false);
    }

    /// Close the connection and discard any unread bytes.
    pub fn close_discarding(&self) {
        self.close_inner(true);
    }

    fn close_inner(&self, discard: bool) {
        {
            let mut inbound = self.shared.inbound.lock();
            if discard {
                inbound.queue.clear();
            }
            inbound.state = ConnectionState::Closed;
        }
        self.shared.release();
        self.join_worker();
    }

    fn join_worker(&self) {
        let handle = {
            let mut worker = self.worker.lock();
            match worker.as_ref() {
                // Closing from our own callback; the next close from outside joins.
                Some(handle) if handle.thread().id() == thread::current().id() => return,
                _ => worker.take(),
            }
        };
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::warn!(target: TARGET, "receiver thread for {} panicked", self.shared.peer);
            }
        }
    }

    /// Bytes sent since the previous call; resets the counter.
    pub fn pull_upload(&self) -> u64 {
        self.shared.upload.swap(0, Ordering::AcqRel)
    }

    /// Bytes received since the previous call; resets the counter.
    pub fn pull_download(&self) -> u64 {
        self.shared.download.swap(0, Ordering::AcqRel)
    }

    /// `Closed` with nothing left to read: safe for the registry to forget.
    pub(crate) fn is_finished(&self) -> bool {
        let inbound = self.shared.inbound.lock();
        inbound.state == ConnectionState::Closed && inbound.queue.is_empty()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close_inner(false);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer_addr", &self.shared.peer)
            .field("state", &self.state())
            .field("available", &self.available())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStream;
    use crate::socket::SocketError;
    use parking_lot::Condvar;
    use std::collections::VecDeque;
    use std::io;
    use std::time::Duration;

    fn peer() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, 7000)
    }

    fn memory_connection(settings: &TcpSettings) -> (Arc<Connection>, Arc<MemoryStream>, MemoryStream) {
        let (local, remote) = MemoryStream::pair();
        let local = Arc::new(local);
        let connection = Connection::from_stream(local.clone(), peer(), settings);
        (connection, local, remote)
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        condition()
    }

    #[test]
    fn test_accepted_connection_starts_connected() {
        let (connection, _local, _remote) = memory_connection(&TcpSettings::default());
        assert_eq!(connection.state(), ConnectionState::Connected);
        assert_eq!(connection.address(), Ipv4Addr::LOCALHOST);
        assert_eq!(connection.port(), 7000);
        assert_eq!(connection.available(), 0);

        let mut buf = [0u8; 4];
        assert_eq!(connection.recv(&mut buf), Some(0));
    }

    #[test]
    fn test_recv_is_fifo_byte_stream() {
        let (connection, _local, remote) = memory_connection(&TcpSettings::default());
        remote.write(b"hello ").unwrap();
        remote.write(b"world").unwrap();
        assert!(wait_for(|| connection.available() == 11));

        let mut buf = [0u8; 4];
        assert_eq!(connection.recv(&mut buf), Some(4));
        assert_eq!(&buf, b"hell");

        let mut rest = [0u8; 32];
        let n = connection.recv(&mut rest).unwrap();
        assert_eq!(&rest[..n], b"o world");
        assert_eq!(connection.pull_download(), 11);
        assert_eq!(connection.pull_download(), 0);
    }

    #[test]
    fn test_peer_close_then_drain_reports_not_found() {
        let (connection, _local, remote) = memory_connection(&TcpSettings::default());
        remote.write(b"last").unwrap();
        remote.shutdown().unwrap();

        assert!(wait_for(|| connection.state() == ConnectionState::Closed));
        assert!(!connection.is_finished());

        let mut buf = [0u8; 8];
        assert_eq!(connection.recv(&mut buf), Some(4));
        assert_eq!(&buf[..4], b"last");
        assert_eq!(connection.recv(&mut buf), None);
        assert!(connection.is_finished());
    }

    #[test]
    fn test_overflow_closes_connection() {
        let settings = TcpSettings::new().max_inbound_buffer(1024).read_chunk_size(256);
        let (connection, local, remote) = memory_connection(&settings);
        remote.write(&[7u8; 4096]).unwrap();

        assert!(wait_for(|| connection.state() == ConnectionState::Closed));
        assert!(connection.available() <= 1024);
        assert_eq!(local.shutdown_count(), 1);
    }

    #[test]
    fn test_exact_cap_is_accepted() {
        let settings = TcpSettings::new().max_inbound_buffer(512).read_chunk_size(128);
        let (connection, _local, remote) = memory_connection(&settings);
        remote.write(&[1u8; 512]).unwrap();

        assert!(wait_for(|| connection.available() == 512));
        assert_eq!(connection.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_send_reaches_peer_and_counts_upload() {
        let (connection, _local, remote) = memory_connection(&TcpSettings::default());
        assert_eq!(connection.send(b"ping").unwrap(), 4);
        assert_eq!(connection.send(b"").unwrap(), 0);

        let mut buf = [0u8; 8];
        let n = remote.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(connection.pull_upload(), 4);
        assert_eq!(connection.pull_upload(), 0);
    }

    #[test]
    fn test_send_on_closed_connection_fails_without_io() {
        let (connection, local, remote) = memory_connection(&TcpSettings::default());
        connection.close();

        assert!(matches!(connection.send(b"data"), Err(NetworkError::NotConnected)));
        assert_eq!(local.shutdown_count(), 1);

        let mut buf = [0u8; 8];
        assert_eq!(remote.read(&mut buf).unwrap(), 0);
        assert_eq!(connection.pull_upload(), 0);
    }

    #[test]
    fn test_send_failure_closes_connection() {
        let (connection, _local, remote) = memory_connection(&TcpSettings::default());
        remote.shutdown().unwrap();

        let _ = connection.send(b"into the void");
        assert!(wait_for(|| connection.state() == ConnectionState::Closed));
        assert!(connection.send(b"again").is_err());
    }

    #[test]
    fn test_close_is_idempotent() {
        let (connection, local, _remote) = memory_connection(&TcpSettings::default());
        connection.close();
        connection.close();
        connection.close_discarding();

        assert_eq!(connection.state(), ConnectionState::Closed);
        assert_eq!(local.shutdown_count(), 1);
        assert!(connection.worker.lock().is_none());
    }

    #[test]
    fn test_concurrent_close_shuts_down_once() {
        let (connection, local, _remote) = memory_connection(&TcpSettings::default());

        let closers: Vec<_> = (0..4)
            .map(|_| {
                let connection = connection.clone();
                thread::spawn(move || connection.close())
            })
            .collect();
        for closer in closers {
            closer.join().unwrap();
        }

        assert_eq!(connection.state(), ConnectionState::Closed);
        assert_eq!(local.shutdown_count(), 1);
    }

    #[test]
    fn test_close_keeps_or_discards_pending_bytes() {
        let (keep, _l1, remote1) = memory_connection(&TcpSettings::default());
        remote1.write(b"pending").unwrap();
        assert!(wait_for(|| keep.available() == 7));
        keep.close();
        assert_eq!(keep.available(), 7);
        assert!(!keep.is_finished());

        let (discard, _l2, remote2) = memory_connection(&TcpSettings::default());
        remote2.write(b"pending").unwrap();
        assert!(wait_for(|| discard.available() == 7));
        discard.close_discarding();
        assert_eq!(discard.available(), 0);
        assert!(discard.is_finished());
    }

    #[test]
    fn test_drop_releases_stream() {
        let (connection, local, remote) = memory_connection(&TcpSettings::default());
        drop(connection);

        assert_eq!(local.shutdown_count(), 1);
        let mut buf = [0u8; 4];
        assert_eq!(remote.read(&mut buf).unwrap(), 0);
    }

    enum ReadStep {
        Data(&'static [u8]),
        Fail(io::ErrorKind),
        Slow(Duration, &'static [u8]),
    }

    /// Stream that replays scripted reads and write failures, then behaves
    /// like an idle peer until shut down.
    #[derive(Default)]
    struct ScriptedStream {
        reads: Mutex<VecDeque<ReadStep>>,
        write_failures: Mutex<VecDeque<io::ErrorKind>>,
        written: Mutex<Vec<u8>>,
        closed: Mutex<bool>,
        wake: Condvar,
    }

    impl ScriptedStream {
        fn with_reads(reads: Vec<ReadStep>) -> Arc<Self> {
            Arc::new(Self {
                reads: Mutex::new(reads.into()),
                ..Self::default()
            })
        }

        fn with_write_failures(failures: Vec<io::ErrorKind>) -> Arc<Self> {
            Arc::new(Self {
                write_failures: Mutex::new(failures.into()),
                ..Self::default()
            })
        }
    }

    impl ByteStream for ScriptedStream {
        fn read(&self, buf: &mut [u8]) -> std::result::Result<usize, SocketError> {
            let step = self.reads.lock().pop_front();
            let data = match step {
                Some(ReadStep::Data(data)) => data,
                Some(ReadStep::Fail(kind)) => return Err(SocketError::new(kind, "scripted")),
                Some(ReadStep::Slow(delay, data)) => {
                    thread::sleep(delay);
                    data
                }
                None => {
                    let mut closed = self.closed.lock();
                    while !*closed {
                        self.wake.wait(&mut closed);
                    }
                    return Ok(0);
                }
            };
            buf[..data.len()].copy_from_slice(data);
            Ok(data.len())
        }

        fn write(&self, buf: &[u8]) -> std::result::Result<usize, SocketError> {
            if let Some(kind) = self.write_failures.lock().pop_front() {
                return Err(SocketError::new(kind, "scripted"));
            }
            // Short writes force the send loop to continue.
            let n = buf.len().min(3);
            self.written.lock().extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn shutdown(&self) -> std::result::Result<(), SocketError> {
            *self.closed.lock() = true;
            self.wake.notify_all();
            Ok(())
        }
    }

    #[test]
    fn test_send_retries_transient_errors() {
        let stream = ScriptedStream::with_write_failures(vec![
            io::ErrorKind::WouldBlock,
            io::ErrorKind::Interrupted,
            io::ErrorKind::WouldBlock,
        ]);
        let connection = Connection::from_stream(stream.clone(), peer(), &TcpSettings::default());

        assert_eq!(connection.send(b"hello world").unwrap(), 11);
        assert_eq!(&*stream.written.lock(), b"hello world");
        assert_eq!(connection.pull_upload(), 11);
        assert_eq!(connection.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_receive_retries_transient_errors() {
        let stream = ScriptedStream::with_reads(vec![
            ReadStep::Fail(io::ErrorKind::Interrupted),
            ReadStep::Fail(io::ErrorKind::WouldBlock),
            ReadStep::Data(b"abc"),
        ]);
        let connection = Connection::from_stream(stream, peer(), &TcpSettings::default());

        assert!(wait_for(|| connection.available() == 3));
        assert_eq!(connection.state(), ConnectionState::Connected);

        let mut buf = [0u8; 8];
        assert_eq!(connection.recv(&mut buf), Some(3));
        assert_eq!(&buf[..3], b"abc");
        assert_eq!(connection.pull_download(), 3);
    }

    #[test]
    fn test_fatal_read_error_closes() {
        let stream = ScriptedStream::with_reads(vec![
            ReadStep::Data(b"ok"),
            ReadStep::Fail(io::ErrorKind::ConnectionReset),
        ]);
        let connection = Connection::from_stream(stream, peer(), &TcpSettings::default());

        assert!(wait_for(|| connection.state() == ConnectionState::Closed));
        assert_eq!(connection.available(), 2);
    }

    #[test]
    fn test_read_finishing_after_discarding_close_is_dropped() {
        let stream = ScriptedStream::with_reads(vec![ReadStep::Slow(
            Duration::from_millis(200),
            b"late",
        )]);
        let connection = Connection::from_stream(stream, peer(), &TcpSettings::default());

        thread::sleep(Duration::from_millis(50));
        // Joins the receiver, so the late read has completed by the time this returns.
        connection.close_discarding();

        assert_eq!(connection.state(), ConnectionState::Closed);
        assert_eq!(connection.available(), 0);
        assert!(connection.is_finished());
        let mut buf = [0u8; 8];
        assert_eq!(connection.recv(&mut buf), None);
    }

    #[test]
    fn test_connection_id_display() {
        let id = ConnectionId::new(42);
        assert_eq!(id.as_u64(), 42);
        assert_eq!(id.to_string(), "conn-42");
        assert!(ConnectionId::new(1) < ConnectionId::new(2));
    }
}
