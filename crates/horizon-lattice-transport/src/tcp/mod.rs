//! TCP connections and servers.
//!
//! This module provides the socket-backed side of the transport:
//! - **Connection**: one byte-stream endpoint with a background receiver
//!   thread, a capped inbound queue, a non-blocking `recv` and a blocking,
//!   retrying `send`
//! - **Server**: a listening socket with an accept loop that registers each
//!   client as a `Connection`
//!
//! Both are normally created through [`Network`](crate::Network), which
//! assigns their ids and reaps them once they are finished.
//!
//! # Example
//!
//! ```ignore
//! use horizon_lattice_transport::{Network, NetworkSettings};
//!
//! let network = Network::create(NetworkSettings::default())?;
//!
//! let server = network.open_server(7777, |id| {
//!     println!("client {id} connected");
//! })?;
//!
//! let client = network.connect("localhost", 7777, |id| {
//!     println!("{id} is connected");
//! })?;
//!
//! // Once per tick:
//! network.update();
//! if let Some(conn) = network.connection(client) {
//!     let mut buf = [0u8; 1024];
//!     if let Some(n) = conn.recv(&mut buf) {
//!         // handle buf[..n]
//!     }
//! }
//! ```

mod config;
mod connection;
mod server;
mod state;

pub use config::{DEFAULT_MAX_INBOUND_BUFFER, DEFAULT_READ_CHUNK_SIZE, TcpSettings};
pub use connection::{Connection, ConnectionId};
pub(crate) use server::ClientHandler;
pub use server::{Server, ServerId};
pub use state::ConnectionState;
