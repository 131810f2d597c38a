//! Registry of connected clients.
//!
//! Every accepted socket gets an entry holding a cloned handle for writing.
//! The receive side stays with the connection's handler thread. All
//! registry operations, including the whole of a broadcast fan-out, run
//! under one registry-wide lock, so at most one writer touches a socket at a
//! time and a fan-out is never observed half done.

use crate::frame::{write_frame, Frame};
use slab::Slab;
use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace, warn};

/// Identity of a registered connection.
///
/// Slab slots are reused after removal; the serial is not, so a stale id
/// never matches a newer connection that landed in the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    slot: usize,
    serial: u64,
}

/// Point-in-time description of one peer, for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: ConnectionId,
    pub addr: SocketAddr,
}

/// Outcome of one fan-out pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

struct Entry {
    serial: u64,
    addr: SocketAddr,
    stream: TcpStream,
}

struct Inner {
    entries: Slab<Entry>,
    next_serial: u64,
}

/// Thread-safe set of active connections.
pub struct ConnectionRegistry {
    inner: Mutex<Inner>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: Slab::new(),
                next_serial: 0,
            }),
        }
    }

    // Entries are only mutated as a whole under the lock, so a panic in
    // another holder cannot leave one half-written.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a connection. `stream` should be a clone of the handler's socket.
    pub fn register(&self, stream: TcpStream, addr: SocketAddr) -> ConnectionId {
        let mut inner = self.lock();
        let serial = inner.next_serial;
        inner.next_serial += 1;
        let slot = inner.entries.insert(Entry {
            serial,
            addr,
            stream,
        });
        let id = ConnectionId { slot, serial };
        debug!(peer = %addr, conn = ?id, clients = inner.entries.len(), "Registered connection");
        id
    }

    /// Remove a connection. Unknown or stale ids are ignored.
    pub fn unregister(&self, id: ConnectionId) -> bool {
        let mut inner = self.lock();
        let live = inner
            .entries
            .get(id.slot)
            .is_some_and(|entry| entry.serial == id.serial);
        if !live {
            trace!(conn = ?id, "Unregister of unknown connection ignored");
            return false;
        }

        let entry = inner.entries.remove(id.slot);
        debug!(peer = %entry.addr, conn = ?id, clients = inner.entries.len(), "Unregistered connection");
        true
    }

    /// Write `frame` to every connection except `exclude`.
    ///
    /// A failed write is logged and that peer's socket is shut down so its
    /// handler tears it down; delivery to the others carries on.
    pub fn broadcast(&self, frame: &Frame, exclude: ConnectionId) -> BroadcastReport {
        let mut inner = self.lock();
        let mut report = BroadcastReport::default();

        for (slot, entry) in inner.entries.iter_mut() {
            if slot == exclude.slot && entry.serial == exclude.serial {
                continue;
            }
            match write_frame(&mut entry.stream, frame) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(peer = %entry.addr, error = %e, "Broadcast write failed, dropping peer");
                    let _ = entry.stream.shutdown(Shutdown::Both);
                    report.failed += 1;
                }
            }
        }

        report
    }

    /// Write `frame` to a single connection.
    pub fn send_to(&self, id: ConnectionId, frame: &Frame) -> io::Result<()> {
        let mut inner = self.lock();
        match inner.entries.get_mut(id.slot) {
            Some(entry) if entry.serial == id.serial => write_frame(&mut entry.stream, frame),
            _ => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection is no longer registered",
            )),
        }
    }

    /// Copy out the current peers.
    pub fn snapshot(&self) -> Vec<PeerInfo> {
        self.lock()
            .entries
            .iter()
            .map(|(slot, entry)| PeerInfo {
                id: ConnectionId {
                    slot,
                    serial: entry.serial,
                },
                addr: entry.addr,
            })
            .collect()
    }

    /// Shut down every registered socket. Handlers unregister as they notice.
    pub fn close_all(&self) -> usize {
        let inner = self.lock();
        for (_, entry) in inner.entries.iter() {
            if let Err(e) = entry.stream.shutdown(Shutdown::Both) {
                debug!(peer = %entry.addr, error = %e, "Shutdown failed");
            }
        }
        inner.entries.len()
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Check if there are no connections.
    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
