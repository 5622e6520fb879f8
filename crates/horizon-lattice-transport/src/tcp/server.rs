//! Listening TCP server with a background accept loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use socket2::Socket;

use super::config::TcpSettings;
use super::connection::{Connection, ConnectionId};
use crate::error::{NetworkError, Result};
use crate::network::ConnectionTable;
use crate::socket;

const TARGET: &str = "horizon_lattice_transport::server";

/// Identifier the registry assigns to a server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServerId(u64);

impl ServerId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ServerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "server-{}", self.0)
    }
}

/// Handler invoked on the accept thread with each new client's id.
pub type ClientHandler = Box<dyn Fn(ConnectionId) + Send + Sync + 'static>;

/// State shared with the accept thread.
struct ServerShared {
    port: u16,
    open: AtomicBool,
    /// Ids of accepted clients still registered, used only to force-close them.
    clients: Mutex<Vec<ConnectionId>>,
    table: Arc<ConnectionTable>,
    settings: TcpSettings,
}

/// A listening endpoint that turns accepted clients into registered
/// [`Connection`]s.
///
/// Each accepted client is registered with the owning
/// [`Network`](crate::Network) and the handler is called with its id. The
/// handler runs on the accept thread, so it must not block.
pub struct Server {
    shared: Arc<ServerShared>,
    closing: AtomicBool,
    listener: Mutex<Option<Arc<Socket>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    /// Bind `port` (0 picks a free one), start listening and spawn the
    /// accept loop.
    ///
    /// Fails without leaving a listening socket or thread behind.
    pub(crate) fn open(
        port: u16,
        settings: &TcpSettings,
        table: Arc<ConnectionTable>,
        handler: ClientHandler,
    ) -> Result<Self> {
        let listener = socket::create_listener(port, settings.backlog, settings.reuse_port)?;
        let port = socket::local_port(&listener).unwrap_or(port);
        let listener = Arc::new(listener);

        let shared = Arc::new(ServerShared {
            port,
            open: AtomicBool::new(true),
            clients: Mutex::new(Vec::new()),
            table,
            settings: settings.clone(),
        });

        let worker = {
            let shared = shared.clone();
            let listener = listener.clone();
            thread::Builder::new()
                .name(format!("tcp-accept-{port}"))
                .spawn(move || accept_loop(&shared, &listener, &handler))
                .map_err(|e| NetworkError::Socket(e.into()))?
        };

        tracing::info!(target: TARGET, "opened server at port {}", port);
        Ok(Self {
            shared,
            closing: AtomicBool::new(false),
            listener: Mutex::new(Some(listener)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// The port the server is bound to.
    pub fn port(&self) -> u16 {
        self.shared.port
    }

    /// Whether the server is still accepting clients.
    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::Acquire)
    }

    /// Number of accepted clients still registered with the network.
    pub fn client_count(&self) -> usize {
        let clients = self.shared.clients.lock();
        clients
            .iter()
            .filter(|id| self.shared.table.contains(**id))
            .count()
    }

    #[cfg(test)]
    pub(crate) fn tracked_client_ids(&self) -> usize {
        self.shared.clients.lock().len()
    }

    /// Stop accepting, close every client this server accepted, close the
    /// listening socket and join the accept thread.
    ///
    /// Only the first call does anything.
    pub fn close(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!(target: TARGET, "closing server at port {}", self.shared.port);

        // Cleared under the clients lock so the accept loop can't add one after the sweep below.
        let clients = {
            let mut clients = self.shared.clients.lock();
            self.shared.open.store(false, Ordering::Release);
            std::mem::take(&mut *clients)
        };
        for id in clients {
            if let Some(client) = self.shared.table.get(id) {
                client.close();
            }
        }

        let listener = self.listener.lock().take();
        if let Some(listener) = listener {
            if let Err(e) = socket::shutdown(&listener) {
                tracing::debug!(target: TARGET, "listener shutdown failed ({}), waking accept", e);
                socket::wake_listener(self.shared.port);
            }
        }

        let handle = {
            let mut worker = self.worker.lock();
            match worker.as_ref() {
                Some(handle) if handle.thread().id() == thread::current().id() => None,
                _ => worker.take(),
            }
        };
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::warn!(target: TARGET, "accept thread for port {} panicked", self.shared.port);
            }
        }
    }
}

fn accept_loop(shared: &ServerShared, listener: &Socket, handler: &ClientHandler) {
    tracing::info!(target: TARGET, "listening for connections on port {}", shared.port);

    while shared.open.load(Ordering::Acquire) {
        let (client, peer) = match socket::accept(listener) {
            Ok(accepted) => accepted,
            Err(e) if e.is_transient() => continue,
            Err(e) => {
                if shared.open.swap(false, Ordering::AcqRel) {
                    tracing::warn!(
                        target: TARGET,
                        code = ?e.code(),
                        "accept failed on port {}: {}", shared.port, e
                    );
                }
                break;
            }
        };

        let id = {
            let mut clients = shared.clients.lock();
            if !shared.open.load(Ordering::Acquire) {
                drop(clients);
                socket::shutdown_and_close(client);
                break;
            }

            tracing::info!(target: TARGET, "client connected: {}", peer);
            let client = socket::configure_stream(client, shared.settings.no_delay);
            let connection = Connection::from_stream(Arc::new(client), peer, &shared.settings);
            let id = shared.table.register(connection);
            clients.retain(|client| shared.table.contains(*client));
            clients.push(id);
            id
        };
        handler(id);
    }

    tracing::debug!(target: TARGET, "accept loop on port {} finished", shared.port);
}

impl Drop for Server {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("port", &self.shared.port)
            .field("open", &self.is_open())
            .field("clients", &self.client_count())
            .finish()
    }
}
