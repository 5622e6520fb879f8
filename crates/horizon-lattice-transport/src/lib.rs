//! Tick-driven TCP transport for Horizon Lattice.
//!
//! This crate provides the networking layer a host loop drives once per tick:
//!
//! - **Connections**: byte-stream endpoints with a background receiver, a
//!   capped inbound queue and a non-blocking `recv`
//! - **Servers**: listening sockets whose accepted clients become connections
//! - **Network**: the registry that assigns ids, reaps finished connections
//!   and servers, and aggregates traffic totals
//! - **Requests**: a FIFO HTTP GET/POST client whose callbacks run on the
//!   tick thread
//!
//! # Example
//!
//! ```ignore
//! use horizon_lattice_transport::{Network, NetworkSettings};
//!
//! let network = Network::create(NetworkSettings::default())?;
//!
//! let server = network.open_server(7777, |id| println!("client {id}"))?;
//! let client = network.connect("localhost", 7777, |id| println!("{id} up"))?;
//!
//! loop {
//!     network.update();
//!
//!     if let Some(conn) = network.connection(client) {
//!         conn.send(b"ping")?;
//!     }
//! }
//! ```
//!
//! # Threading
//!
//! Every connection owns one receiver thread and every server one accept
//! thread. All public types are `Send + Sync`; the registry, the connections
//! and the request client each guard their own state with separate locks.
//!
//! # Logging
//!
//! Events are emitted with [`tracing`] under the
//! `horizon_lattice_transport::*` targets; install any subscriber to see them.

mod error;
pub mod memory;
mod network;
pub mod requests;
pub mod socket;
pub mod tcp;

pub use error::{NetworkError, Result};
pub use memory::MemoryStream;
pub use network::{Network, NetworkSettings};
pub use requests::{HttpRequests, OnReject, OnResponse, RequestSettings, Requests};
pub use socket::{ByteStream, SocketError};
pub use tcp::{
    Connection, ConnectionId, ConnectionState, DEFAULT_MAX_INBOUND_BUFFER,
    DEFAULT_READ_CHUNK_SIZE, Server, ServerId, TcpSettings,
};
