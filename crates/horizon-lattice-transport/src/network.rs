//! The registry that owns every connection and server.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::requests::{HttpRequests, OnReject, RequestSettings, Requests};
use crate::socket;
use crate::tcp::{ClientHandler, Connection, ConnectionId, Server, ServerId, TcpSettings};

const TARGET: &str = "horizon_lattice_transport::network";

/// Settings for a [`Network`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    /// Connection and server settings.
    pub tcp: TcpSettings,
    /// Request client settings.
    pub requests: RequestSettings,
}

impl NetworkSettings {
    /// Create settings with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the TCP settings.
    pub fn tcp(mut self, tcp: TcpSettings) -> Self {
        self.tcp = tcp;
        self
    }

    /// Replace the request client settings.
    pub fn requests(mut self, requests: RequestSettings) -> Self {
        self.requests = requests;
        self
    }
}

struct TableInner {
    connections: HashMap<ConnectionId, Arc<Connection>>,
    next_id: u64,
}

/// Id allocator and id -> connection map.
///
/// Shared with servers so their accept loops can register clients. Has its
/// own lock, separate from every connection's lock.
pub(crate) struct ConnectionTable {
    inner: Mutex<TableInner>,
}

impl ConnectionTable {
    fn new() -> Self {
        Self {
            inner: Mutex::new(TableInner {
                connections: HashMap::new(),
                next_id: 1,
            }),
        }
    }

    /// Allocate an id and store the connection `create` builds for it.
    fn insert_with(&self, create: impl FnOnce(ConnectionId) -> Arc<Connection>) -> ConnectionId {
        let mut inner = self.inner.lock();
        let id = ConnectionId::new(inner.next_id);
        inner.next_id += 1;
        let connection = create(id);
        inner.connections.insert(id, connection);
        id
    }

    pub(crate) fn register(&self, connection: Arc<Connection>) -> ConnectionId {
        self.insert_with(move |_| connection)
    }

    pub(crate) fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.inner.lock().connections.get(&id).cloned()
    }

    pub(crate) fn contains(&self, id: ConnectionId) -> bool {
        self.inner.lock().connections.contains_key(&id)
    }

    fn len(&self) -> usize {
        self.inner.lock().connections.len()
    }

    /// Drain every connection's counters and remove the finished ones.
    ///
    /// Returns `(upload, download, evicted)`; the caller drops the evicted
    /// connections after the lock is released.
    fn sweep(&self) -> (u64, u64, Vec<Arc<Connection>>) {
        let mut upload = 0;
        let mut download = 0;
        let mut evicted = Vec::new();

        let mut inner = self.inner.lock();
        inner.connections.retain(|id, connection| {
            upload += connection.pull_upload();
            download += connection.pull_download();
            if connection.is_finished() {
                tracing::debug!(target: TARGET, "evicting {}", id);
                evicted.push(connection.clone());
                false
            } else {
                true
            }
        });

        (upload, download, evicted)
    }

    fn take_all(&self) -> Vec<Arc<Connection>> {
        self.inner
            .lock()
            .connections
            .drain()
            .map(|(_, connection)| connection)
            .collect()
    }
}

struct ServerTable {
    servers: HashMap<ServerId, Arc<Server>>,
    next_id: u64,
}

/// Owns every connection and server, assigns their ids and reconciles them
/// once per host tick.
///
/// Create one per process (or per subsystem) and call [`update`](Self::update)
/// once per tick. Connections stay registered until they are closed *and*
/// every received byte has been read; servers stay until they stop
/// accepting. Dropping the `Network` closes everything it owns.
///
/// # Example
///
/// ```ignore
/// let network = Network::create(NetworkSettings::default())?;
/// let server = network.open_server(0, |id| println!("accepted {id}"))?;
/// let port = network.server(server).map(|s| s.port()).unwrap_or_default();
///
/// let client = network.connect("localhost", port, |id| println!("{id} up"))?;
/// loop {
///     network.update();
///     // poll connections...
/// }
/// ```
pub struct Network {
    settings: NetworkSettings,
    table: Arc<ConnectionTable>,
    servers: Mutex<ServerTable>,
    requests: Box<dyn Requests>,
    total_upload: AtomicU64,
    total_download: AtomicU64,
}

impl Network {
    /// Create a network with the default `reqwest`-backed request client.
    pub fn create(settings: NetworkSettings) -> Result<Self> {
        let requests = HttpRequests::new(settings.requests.clone())?;
        Ok(Self::with_requests(Box::new(requests), settings))
    }

    /// Create a network that forwards `get`/`post` to `requests`.
    pub fn with_requests(requests: Box<dyn Requests>, settings: NetworkSettings) -> Self {
        Self {
            settings,
            table: Arc::new(ConnectionTable::new()),
            servers: Mutex::new(ServerTable {
                servers: HashMap::new(),
                next_id: 1,
            }),
            requests,
            total_upload: AtomicU64::new(0),
            total_download: AtomicU64::new(0),
        }
    }

    /// The settings this network was created with.
    pub fn settings(&self) -> &NetworkSettings {
        &self.settings
    }

    /// Queue an HTTP GET. See [`Requests::get`].
    pub fn get(
        &self,
        url: &str,
        on_response: impl FnOnce(Vec<u8>) + Send + 'static,
        on_reject: Option<OnReject>,
        max_size: u64,
    ) {
        self.requests
            .get(url, Box::new(on_response), on_reject, max_size);
    }

    /// Queue an HTTP POST with a JSON body. See [`Requests::post`].
    pub fn post(
        &self,
        url: &str,
        body: &str,
        on_response: impl FnOnce(Vec<u8>) + Send + 'static,
        on_reject: Option<OnReject>,
        max_size: u64,
    ) {
        self.requests
            .post(url, body, Box::new(on_response), on_reject, max_size);
    }

    /// Open an outbound connection to `address:port`.
    ///
    /// The id is returned immediately and the connection is registered in
    /// the `Connecting` state; `on_connected` runs on the connection's thread
    /// once the handshake succeeds. Only resolution and socket creation fail
    /// here; a failed connect shows up as the connection reaching `Closed`.
    pub fn connect(
        &self,
        address: &str,
        port: u16,
        on_connected: impl FnOnce(ConnectionId) + Send + 'static,
    ) -> Result<ConnectionId> {
        let peer = socket::resolve_ipv4(address, port)?;
        let socket = socket::create_stream_socket()?;
        let socket = socket::configure_stream(socket, self.settings.tcp.no_delay);

        let tcp = &self.settings.tcp;
        Ok(self.table.insert_with(|id| {
            Connection::connect(socket, peer, tcp, move || on_connected(id))
        }))
    }

    /// Open a server on `port` (0 picks a free port).
    ///
    /// `on_client_connected` runs on the accept thread with the id of each
    /// client; it must not block.
    pub fn open_server(
        &self,
        port: u16,
        on_client_connected: impl Fn(ConnectionId) + Send + Sync + 'static,
    ) -> Result<ServerId> {
        let handler: ClientHandler = Box::new(on_client_connected);

        let mut servers = self.servers.lock();
        let id = ServerId::new(servers.next_id);
        servers.next_id += 1;

        let server = Server::open(port, &self.settings.tcp, self.table.clone(), handler)?;
        servers.servers.insert(id, Arc::new(server));
        Ok(id)
    }

    /// Register a connection created elsewhere and return its new id.
    pub fn add_connection(&self, connection: Arc<Connection>) -> ConnectionId {
        self.table.register(connection)
    }

    /// Look up a registered connection.
    pub fn connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.table.get(id)
    }

    /// Look up a registered server.
    pub fn server(&self, id: ServerId) -> Option<Arc<Server>> {
        self.servers.lock().servers.get(&id).cloned()
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.table.len()
    }

    /// Number of registered servers.
    pub fn server_count(&self) -> usize {
        self.servers.lock().servers.len()
    }

    /// Reconcile the registry. Call once per host tick.
    ///
    /// Polls the request client, rolls every connection's traffic counters
    /// into the lifetime totals, evicts connections that are closed with
    /// nothing left to read, and evicts servers that stopped accepting.
    pub fn update(&self) {
        self.requests.update();

        let (upload, download, evicted) = self.table.sweep();
        self.total_upload.fetch_add(upload, Ordering::Relaxed);
        self.total_download.fetch_add(download, Ordering::Relaxed);
        drop(evicted);

        let closed: Vec<Arc<Server>> = {
            let mut servers = self.servers.lock();
            let ids: Vec<ServerId> = servers
                .servers
                .iter()
                .filter(|(_, server)| !server.is_open())
                .map(|(id, _)| *id)
                .collect();
            ids.iter()
                .filter_map(|id| servers.servers.remove(id))
                .collect()
        };
        for server in &closed {
            tracing::debug!(target: TARGET, "evicting server at port {}", server.port());
        }
        drop(closed);
    }

    /// Lifetime bytes sent, including the request client's.
    pub fn total_upload(&self) -> u64 {
        self.requests.total_upload() + self.total_upload.load(Ordering::Relaxed)
    }

    /// Lifetime bytes received, including the request client's.
    pub fn total_download(&self) -> u64 {
        self.requests.total_download() + self.total_download.load(Ordering::Relaxed)
    }

    /// Close every server and connection and empty the registry.
    ///
    /// Servers close first, taking their accepted clients with them. Safe to
    /// call more than once; dropping the network calls it too.
    pub fn shutdown(&self) {
        let servers: Vec<Arc<Server>> = self
            .servers
            .lock()
            .servers
            .drain()
            .map(|(_, server)| server)
            .collect();
        for server in &servers {
            server.close();
        }

        let connections = self.table.take_all();
        for connection in &connections {
            connection.close();
        }
        if !servers.is_empty() || !connections.is_empty() {
            tracing::info!(
                target: TARGET,
                servers = servers.len(),
                connections = connections.len(),
                "network shut down"
            );
        }
    }
}

impl Drop for Network {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Network")
            .field("connections", &self.connection_count())
            .field("servers", &self.server_count())
            .field("total_upload", &self.total_upload())
            .field("total_download", &self.total_download())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::time::{Duration, Instant};

    use super::*;
    use crate::memory::MemoryStream;
    use crate::requests::OnResponse;
    use crate::socket::ByteStream;
    use crate::tcp::ConnectionState;

    #[derive(Default)]
    struct CountingRequests {
        updates: AtomicU64,
    }

    impl Requests for CountingRequests {
        fn get(
            &self,
            _url: &str,
            on_response: OnResponse,
            _on_reject: Option<OnReject>,
            _max_size: u64,
        ) {
            on_response(b"ok".to_vec());
        }

        fn post(
            &self,
            _url: &str,
            _body: &str,
            _on_response: OnResponse,
            on_reject: Option<OnReject>,
            _max_size: u64,
        ) {
            if let Some(on_reject) = on_reject {
                on_reject(404);
            }
        }

        fn update(&self) {
            self.updates.fetch_add(1, Ordering::Relaxed);
        }

        fn total_upload(&self) -> u64 {
            100
        }

        fn total_download(&self) -> u64 {
            200
        }
    }

    fn network() -> Network {
        Network::with_requests(Box::<CountingRequests>::default(), NetworkSettings::default())
    }

    fn peer() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, 4000)
    }

    fn memory_connection() -> (Arc<Connection>, MemoryStream) {
        let (local, remote) = MemoryStream::pair();
        let connection = Connection::from_stream(Arc::new(local), peer(), &TcpSettings::default());
        (connection, remote)
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_settings_default() {
        let settings = NetworkSettings::new();
        assert_eq!(settings.tcp, TcpSettings::default());
        assert_eq!(settings.requests, RequestSettings::default());
    }

    #[test]
    fn test_ids_start_at_one_and_increase() {
        let network = network();
        let (a, _ra) = memory_connection();
        let (b, _rb) = memory_connection();

        let first = network.add_connection(a);
        let second = network.add_connection(b);
        assert_eq!(first.as_u64(), 1);
        assert_eq!(second.as_u64(), 2);
        assert_eq!(network.connection_count(), 2);
    }

    #[test]
    fn test_ids_not_reused_after_eviction() {
        let network = network();
        let (a, _ra) = memory_connection();
        let first = network.add_connection(a.clone());
        a.close();
        drop(a);
        network.update();
        assert!(network.connection(first).is_none());

        let (b, _rb) = memory_connection();
        let second = network.add_connection(b);
        assert!(second > first);
    }

    #[test]
    fn test_unknown_lookups_return_none() {
        let network = network();
        assert!(network.connection(ConnectionId::new(42)).is_none());
        assert!(network.server(ServerId::new(42)).is_none());
    }

    #[test]
    fn test_closed_connection_kept_until_drained() {
        let network = network();
        let (connection, remote) = memory_connection();
        let id = network.add_connection(connection.clone());

        remote.write(b"bye").unwrap();
        assert!(wait_until(|| connection.available() == 3));
        remote.shutdown().unwrap();
        assert!(wait_until(|| connection.state() == ConnectionState::Closed));

        network.update();
        assert!(network.connection(id).is_some());

        let mut buf = [0u8; 8];
        assert_eq!(connection.recv(&mut buf), Some(3));
        assert_eq!(connection.recv(&mut buf), None);

        network.update();
        assert!(network.connection(id).is_none());
    }

    #[test]
    fn test_update_rolls_counters_into_totals() {
        let network = network();
        let (connection, remote) = memory_connection();
        network.add_connection(connection.clone());

        connection.send(b"hello").unwrap();
        remote.write(b"abc").unwrap();
        assert!(wait_until(|| connection.available() == 3));

        network.update();
        assert_eq!(network.total_upload(), 100 + 5);
        assert_eq!(network.total_download(), 200 + 3);

        network.update();
        assert_eq!(network.total_upload(), 105);
        assert_eq!(network.total_download(), 203);
    }

    #[test]
    fn test_requests_forwarded() {
        let network = network();
        let (tx, rx) = crossbeam_channel::unbounded();

        let body_tx = tx.clone();
        network.get(
            "http://example.invalid",
            move |body| body_tx.send(body.len() as u16).unwrap(),
            None,
            0,
        );
        network.post(
            "http://example.invalid",
            "{}",
            |_| panic!("unexpected response"),
            Some(Box::new(move |status: u16| tx.send(status).unwrap())),
            0,
        );

        assert_eq!(rx.try_recv(), Ok(2));
        assert_eq!(rx.try_recv(), Ok(404));
    }

    #[test]
    fn test_shutdown_closes_everything() {
        let network = network();
        let (connection, remote) = memory_connection();
        network.add_connection(connection.clone());

        network.shutdown();
        assert_eq!(connection.state(), ConnectionState::Closed);
        let mut buf = [0u8; 4];
        assert_eq!(remote.read(&mut buf).unwrap(), 0);
        assert_eq!(network.connection_count(), 0);
        assert_eq!(network.server_count(), 0);

        // Second call is a no-op.
        network.shutdown();
    }

    #[test]
    fn test_server_prunes_evicted_client_ids() {
        let network = network();
        let (accepted_tx, accepted_rx) = crossbeam_channel::unbounded();
        let server_id = network
            .open_server(0, move |id| {
                let _ = accepted_tx.send(id);
            })
            .unwrap();
        let server = network.server(server_id).unwrap();

        for _ in 0..3 {
            let client = network.connect("127.0.0.1", server.port(), |_| {}).unwrap();
            let accepted = accepted_rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert!(server.tracked_client_ids() <= 1);
            assert_eq!(server.client_count(), 1);

            network.connection(client).unwrap().close();
            assert!(wait_until(|| {
                network.update();
                network.connection(accepted).is_none()
            }));
            assert_eq!(server.client_count(), 0);
        }
    }

    #[test]
    fn test_connect_resolve_failure_is_synchronous() {
        let network = network();
        let result = network.connect("no-such-host.invalid", 80, |_| {});
        assert!(matches!(result, Err(crate::NetworkError::Resolve { .. })));
        assert_eq!(network.connection_count(), 0);
    }
}
