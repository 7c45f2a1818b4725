//! Per-socket connection state and the shared registry of live connections.
//!
//! A `Connection` holds what both runtime threads need to see: its identity
//! and its two byte accumulators. The socket itself stays with the
//! multiplexer, keyed by the connection id.

use crate::protocol::{encode_frame, Command, FrameError};
use crate::runtime::buffer::Accumulator;
use slab::Slab;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A single client connection.
#[derive(Debug)]
pub struct Connection {
    id: usize,
    peer: SocketAddr,
    inbound: Accumulator,
    outbound: Accumulator,
    close_requested: AtomicBool,
}

impl Connection {
    pub fn new(id: usize, peer: SocketAddr) -> Self {
        Self {
            id,
            peer,
            inbound: Accumulator::new(),
            outbound: Accumulator::new(),
            close_requested: AtomicBool::new(false),
        }
    }

    /// Registry id; also the connection's poll token.
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Remote IP without the port.
    pub fn ip(&self) -> IpAddr {
        self.peer.ip()
    }

    /// Bytes read from the socket and not yet parsed.
    pub fn inbound(&self) -> &Accumulator {
        &self.inbound
    }

    /// Bytes queued for the socket and not yet written.
    pub fn outbound(&self) -> &Accumulator {
        &self.outbound
    }

    /// Queue a complete frame for sending.
    pub fn push_message(&self, command: Command, body: &[u8]) -> Result<(), FrameError> {
        let mut out = self.outbound.lock();
        encode_frame(command, body, &mut out)
    }

    /// Ask the multiplexer to tear this connection down on its next sweep.
    pub fn request_close(&self) {
        self.close_requested.store(true, Ordering::Release);
    }

    pub fn close_requested(&self) -> bool {
        self.close_requested.load(Ordering::Acquire)
    }
}

/// Registry of live connections.
///
/// Created once per runtime and shared by the multiplexer (insert on accept,
/// remove on teardown) and the dispatcher (iterate only). The registry lock
/// is never held while a per-connection lock is taken: iteration goes through
/// [`ConnectionRegistry::snapshot`], which releases it first.
pub struct ConnectionRegistry {
    connections: Mutex<Slab<Arc<Connection>>>,
    max_connections: usize,
}

impl ConnectionRegistry {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Mutex::new(Slab::with_capacity(max_connections.min(1024))),
            max_connections,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slab<Arc<Connection>>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a connection built from its freshly assigned id.
    ///
    /// Returns `None` if the registry is at capacity.
    pub fn insert_with<F>(&self, build: F) -> Option<Arc<Connection>>
    where
        F: FnOnce(usize) -> Connection,
    {
        let mut connections = self.lock();
        if connections.len() >= self.max_connections {
            return None;
        }
        let entry = connections.vacant_entry();
        let conn = Arc::new(build(entry.key()));
        debug_assert_eq!(conn.id(), entry.key());
        entry.insert(Arc::clone(&conn));
        Some(conn)
    }

    /// Remove exactly this connection.
    ///
    /// Ids are reused once freed, so the entry is only removed if it still
    /// holds the same connection. Returns `false` if it was already gone.
    pub fn remove(&self, conn: &Connection) -> bool {
        let mut connections = self.lock();
        let same = connections
            .get(conn.id())
            .is_some_and(|c| std::ptr::eq(c.as_ref(), conn));
        if same {
            connections.remove(conn.id());
        }
        same
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Clone out the current members.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.lock().iter().map(|(_, c)| Arc::clone(c)).collect()
    }

    /// Remove every member (shutdown).
    pub fn drain(&self) -> Vec<Arc<Connection>> {
        self.lock().drain().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FrameHeader, HEADER_SIZE};
    use std::thread;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn is_member(registry: &ConnectionRegistry, conn: &Arc<Connection>) -> bool {
        registry
            .snapshot()
            .iter()
            .any(|member| Arc::ptr_eq(member, conn))
    }

    #[test]
    fn test_connection_identity() {
        let conn = Connection::new(7, addr(4000));
        assert_eq!(conn.id(), 7);
        assert_eq!(conn.peer().port(), 4000);
        assert_eq!(conn.ip().to_string(), "127.0.0.1");
        assert!(conn.inbound().is_empty());
        assert!(conn.outbound().is_empty());
    }

    #[test]
    fn test_push_message_encodes_frame() {
        let conn = Connection::new(0, addr(4000));
        conn.push_message(Command::Dir, b"").unwrap();

        let queued = conn.outbound().take().unwrap();
        assert_eq!(queued.len(), HEADER_SIZE);
        let header = FrameHeader::decode(&queued).unwrap();
        assert_eq!(header.command(), Some(Command::Dir));
        assert_eq!(header.body_len, 0);
    }

    #[test]
    fn test_close_request() {
        let conn = Connection::new(0, addr(4000));
        assert!(!conn.close_requested());
        conn.request_close();
        assert!(conn.close_requested());
    }

    #[test]
    fn test_connection_registry() {
        let registry = ConnectionRegistry::new(2);

        let c1 = registry.insert_with(|id| Connection::new(id, addr(1))).unwrap();
        let c2 = registry.insert_with(|id| Connection::new(id, addr(2))).unwrap();

        // At capacity
        assert!(registry.insert_with(|id| Connection::new(id, addr(3))).is_none());

        assert_eq!(registry.len(), 2);
        assert_eq!(c1.peer().port(), 1);
        assert!(is_member(&registry, &c2));

        assert!(registry.remove(&c1));
        assert!(!registry.remove(&c1));
        assert!(!is_member(&registry, &c1));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_stale_remove_does_not_evict_reused_id() {
        let registry = ConnectionRegistry::new(4);

        let old = registry.insert_with(|id| Connection::new(id, addr(1))).unwrap();
        assert!(registry.remove(&old));

        let new = registry.insert_with(|id| Connection::new(id, addr(2))).unwrap();
        assert_eq!(new.id(), old.id());

        assert!(!registry.remove(&old));
        assert!(is_member(&registry, &new));
    }

    #[test]
    fn test_snapshot_and_drain() {
        let registry = ConnectionRegistry::new(8);
        for port in 0..3 {
            registry.insert_with(|id| Connection::new(id, addr(port)));
        }

        assert_eq!(registry.snapshot().len(), 3);
        assert_eq!(registry.len(), 3);

        let drained = registry.drain();
        assert_eq!(drained.len(), 3);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_registry_churn() {
        let registry = Arc::new(ConnectionRegistry::new(10_000));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    for i in 0..500u16 {
                        let conn = registry
                            .insert_with(|id| Connection::new(id, addr(t * 1000 + i)))
                            .unwrap();
                        assert!(is_member(&registry, &conn));
                        assert!(registry.remove(&conn));
                        assert!(!registry.remove(&conn));
                        assert!(!is_member(&registry, &conn));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert!(registry.is_empty());
    }
}
