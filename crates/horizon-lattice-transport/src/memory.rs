//! In-memory byte pipes.
//!
//! [`MemoryStream::pair`] returns two connected ends that behave like a TCP
//! stream: bytes written to one end are read, in order, from the other, a
//! reader blocks until data arrives, and shutting down either end wakes a
//! blocked reader. A [`Connection`](crate::tcp::Connection) built on a
//! `MemoryStream` runs exactly the same receive loop, backpressure check and
//! close sequence as a socket-backed one.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::socket::{ByteStream, SocketError};

#[derive(Default)]
struct PipeState {
    data: VecDeque<u8>,
    closed: bool,
}

/// One direction of a pipe.
#[derive(Default)]
struct Pipe {
    state: Mutex<PipeState>,
    readable: Condvar,
}

impl Pipe {
    fn close(&self, discard: bool) {
        let mut state = self.state.lock();
        state.closed = true;
        if discard {
            state.data.clear();
        }
        self.readable.notify_all();
    }
}

/// One end of an in-memory byte pipe.
pub struct MemoryStream {
    inbound: Arc<Pipe>,
    outbound: Arc<Pipe>,
    shutdowns: AtomicUsize,
}

impl MemoryStream {
    /// Create two connected ends.
    pub fn pair() -> (Self, Self) {
        let a_to_b = Arc::new(Pipe::default());
        let b_to_a = Arc::new(Pipe::default());

        let a = Self {
            inbound: b_to_a.clone(),
            outbound: a_to_b.clone(),
            shutdowns: AtomicUsize::new(0),
        };
        let b = Self {
            inbound: a_to_b,
            outbound: b_to_a,
            shutdowns: AtomicUsize::new(0),
        };
        (a, b)
    }

    /// How many times [`ByteStream::shutdown`] was called on this end.
    pub fn shutdown_count(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

impl ByteStream for MemoryStream {
    fn read(&self, buf: &mut [u8]) -> Result<usize, SocketError> {
        let mut state = self.inbound.state.lock();
        while state.data.is_empty() && !state.closed {
            self.inbound.readable.wait(&mut state);
        }

        let n = buf.len().min(state.data.len());
        for (dst, src) in buf.iter_mut().zip(state.data.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }

    fn write(&self, buf: &[u8]) -> Result<usize, SocketError> {
        let mut state = self.outbound.state.lock();
        if state.closed {
            return Err(SocketError::new(
                io::ErrorKind::BrokenPipe,
                "memory pipe closed",
            ));
        }
        state.data.extend(buf);
        self.outbound.readable.notify_all();
        Ok(buf.len())
    }

    fn shutdown(&self) -> Result<(), SocketError> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        // Unread inbound bytes are gone; the peer may still drain what we wrote.
        self.inbound.close(true);
        self.outbound.close(false);
        Ok(())
    }
}

impl std::fmt::Debug for MemoryStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStream")
            .field("shutdowns", &self.shutdown_count())
            .finish()
    }
}
