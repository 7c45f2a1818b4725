//! Connection multiplexer on top of mio (epoll on Linux, kqueue on macOS).
//!
//! The multiplexer is the only owner of sockets. It accepts connections,
//! appends whatever it reads to the connection's inbound accumulator and
//! flushes the outbound accumulator when the socket is writable. Outbound
//! bytes are produced on the dispatcher thread, so after every poll round the
//! multiplexer sweeps the registry and re-arms write interest for each
//! connection with pending output. The dispatcher triggers the poll `Waker`
//! when it queues output, which makes that sweep run promptly instead of at
//! the next poll timeout.
//!
//! mio readiness is edge-triggered, so reads continue until `WouldBlock`.
//! Writes follow the configured [`FlushPolicy`].

use crate::config::{Config, FlushPolicy};
use crate::protocol::Command;
use crate::runtime::connection::{Connection, ConnectionRegistry};
use crate::runtime::dispatcher::WorkSignal;
use crate::runtime::RuntimeError;
use bytes::{Buf, BytesMut};
use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const WAKER_TOKEN: Token = Token(usize::MAX - 1);

/// Listen backlog for the server socket.
const LISTEN_BACKLOG: i32 = 1024;

/// A registered socket and the connection state it feeds.
struct Socket {
    stream: TcpStream,
    conn: Arc<Connection>,
}

/// How a read pass over a socket ended.
#[derive(Debug)]
enum ReadStatus {
    /// Socket drained to `WouldBlock`.
    Drained,
    /// Peer closed its side.
    Closed,
    Failed(io::Error),
}

/// Single-threaded owner of the listener, the poller and every client socket.
pub struct Multiplexer {
    poll: Poll,
    listener: TcpListener,
    waker: Arc<Waker>,
    local_addr: SocketAddr,
    sockets: HashMap<usize, Socket>,
    registry: Arc<ConnectionRegistry>,
    signal: Arc<WorkSignal>,
    stop: Arc<AtomicBool>,
    poll_timeout: Duration,
    event_capacity: usize,
    read_chunk_size: usize,
    flush: FlushPolicy,
}

impl Multiplexer {
    /// Bind the listening socket and set up the poller.
    pub fn bind(
        config: &Config,
        registry: Arc<ConnectionRegistry>,
        signal: Arc<WorkSignal>,
        stop: Arc<AtomicBool>,
    ) -> Result<Self, RuntimeError> {
        let addr: SocketAddr =
            config
                .listen
                .parse()
                .map_err(|source| RuntimeError::InvalidAddress {
                    addr: config.listen.clone(),
                    source,
                })?;

        let poll = Poll::new()?;
        let listener = create_listener(addr).map_err(|source| RuntimeError::Bind { addr, source })?;
        let mut listener = TcpListener::from_std(listener);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let local_addr = listener.local_addr()?;

        Ok(Self {
            poll,
            listener,
            waker,
            local_addr,
            sockets: HashMap::new(),
            registry,
            signal,
            stop,
            poll_timeout: config.poll_timeout,
            event_capacity: config.event_capacity,
            read_chunk_size: config.read_chunk_size,
            flush: config.flush,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle that interrupts a blocked poll from another thread.
    pub fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    /// Run until the stop flag is raised, then tear every connection down.
    pub fn run(mut self) -> Result<(), RuntimeError> {
        let mut events = Events::with_capacity(self.event_capacity);
        info!(addr = %self.local_addr, "Multiplexer listening");

        let mut result = Ok(());
        while !self.stop.load(Ordering::Acquire) {
            if let Err(e) = self.poll.poll(&mut events, Some(self.poll_timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "Poll failed");
                result = Err(RuntimeError::Io(e));
                break;
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept_connections(),
                    WAKER_TOKEN => trace!("Multiplexer woken"),
                    Token(conn_id) => self.handle_connection_event(conn_id, event),
                }
            }

            self.sweep();
        }

        self.shutdown();
        result
    }

    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.register_connection(stream, peer),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    break;
                }
            }
        }
    }

    fn register_connection(&mut self, mut stream: TcpStream, peer: SocketAddr) {
        let Some(conn) = self
            .registry
            .insert_with(|id| Connection::new(id, peer))
        else {
            warn!(peer = %peer, "Connection limit reached, rejecting");
            return;
        };

        // Greet before the peer asks for anything.
        if let Err(e) = conn.push_message(Command::Dir, b"") {
            warn!(peer = %peer, error = %e, "Failed to queue greeting");
            self.registry.remove(&conn);
            return;
        }

        if let Err(e) = self.poll.registry().register(
            &mut stream,
            Token(conn.id()),
            Interest::READABLE | Interest::WRITABLE,
        ) {
            warn!(peer = %peer, error = %e, "Failed to register connection");
            self.registry.remove(&conn);
            return;
        }

        info!(conn_id = conn.id(), ip = %conn.ip(), port = peer.port(), "Connected");
        self.sockets.insert(conn.id(), Socket { stream, conn });
    }

    fn handle_connection_event(&mut self, conn_id: usize, event: &Event) {
        if event.is_readable() || event.is_read_closed() {
            self.handle_readable(conn_id);
        }

        // Re-checked inside: the read may have torn the connection down.
        if event.is_writable() {
            self.handle_writable(conn_id);
        }
    }

    fn handle_readable(&mut self, conn_id: usize) {
        let Some(socket) = self.sockets.get_mut(&conn_id) else {
            return;
        };

        let (n, status) = fill_inbound(&mut socket.stream, &socket.conn, self.read_chunk_size);
        if n > 0 {
            trace!(conn_id, bytes = n, "Read");
            self.signal.notify();
        }

        match status {
            ReadStatus::Drained => {}
            ReadStatus::Closed => self.close_connection(conn_id, "peer closed"),
            ReadStatus::Failed(e) if is_closure(&e) => {
                debug!(conn_id, error = %e, "Read failed");
                self.close_connection(conn_id, "read error");
            }
            ReadStatus::Failed(e) => warn!(conn_id, error = %e, "Read failed"),
        }
    }

    fn handle_writable(&mut self, conn_id: usize) {
        let Some(socket) = self.sockets.get_mut(&conn_id) else {
            return;
        };

        let result = {
            let mut outbound = socket.conn.outbound().lock();
            if outbound.is_empty() {
                Ok(0)
            } else {
                flush_outbound(&mut socket.stream, &mut outbound, self.flush)
            }
        };

        // Back to read-only; the sweep re-arms if anything is left.
        if let Err(e) =
            self.poll
                .registry()
                .reregister(&mut socket.stream, Token(conn_id), Interest::READABLE)
        {
            warn!(conn_id, error = %e, "Failed to reregister connection");
        }

        match result {
            Ok(0) => {}
            Ok(n) => trace!(conn_id, bytes = n, "Wrote"),
            Err(e) if is_closure(&e) => {
                debug!(conn_id, error = %e, "Write failed");
                self.close_connection(conn_id, "write error");
            }
            Err(e) => warn!(conn_id, error = %e, "Write failed"),
        }
    }

    /// Pending-write sweep, run once per poll round.
    ///
    /// Closes connections the dispatcher asked to drop and re-arms write
    /// interest for every connection with queued output.
    fn sweep(&mut self) {
        for conn in self.registry.snapshot() {
            if conn.close_requested() {
                self.close_connection(conn.id(), "close requested");
                continue;
            }

            let Some(socket) = self.sockets.get_mut(&conn.id()) else {
                continue;
            };

            let outbound = conn.outbound().lock();
            if outbound.is_empty() {
                continue;
            }
            if let Err(e) = self.poll.registry().reregister(
                &mut socket.stream,
                Token(conn.id()),
                Interest::READABLE | Interest::WRITABLE,
            ) {
                warn!(conn_id = conn.id(), error = %e, "Failed to arm write interest");
            }
            drop(outbound);
        }
    }

    /// Tear a connection down. Only the first call for a given socket does
    /// anything: the socket map is the single owner of the stream.
    fn close_connection(&mut self, conn_id: usize, reason: &'static str) {
        let Some(mut socket) = self.sockets.remove(&conn_id) else {
            return;
        };

        if let Err(e) = self.poll.registry().deregister(&mut socket.stream) {
            debug!(conn_id, error = %e, "Failed to deregister connection");
        }
        self.registry.remove(&socket.conn);

        let conn = &socket.conn;
        if !conn.outbound().is_empty() {
            debug!(conn_id, unsent = conn.outbound().len(), "Dropping unsent output");
        }
        info!(conn_id, ip = %conn.ip(), reason, "Disconnected");
        // Dropping the stream closes the socket.
    }

    fn shutdown(&mut self) {
        let ids: Vec<usize> = self.sockets.keys().copied().collect();
        for conn_id in ids {
            self.close_connection(conn_id, "shutdown");
        }
        if !self.registry.is_empty() {
            warn!(
                remaining = self.registry.len(),
                "Registry not empty after closing every socket"
            );
            self.registry.drain();
        }

        if let Err(e) = self.poll.registry().deregister(&mut self.listener) {
            debug!(error = %e, "Failed to deregister listener");
        }
        info!(addr = %self.local_addr, "Multiplexer stopped");
    }
}

/// Read everything the socket has into the connection's inbound accumulator.
///
/// Holds the inbound lock for the whole pass. Returns the byte count read
/// alongside how the pass ended; bytes read before an error are kept.
fn fill_inbound(stream: &mut TcpStream, conn: &Connection, chunk: usize) -> (usize, ReadStatus) {
    let mut inbound = conn.inbound().lock();
    let mut total = 0;

    loop {
        let start = inbound.len();
        inbound.resize(start + chunk, 0);

        match stream.read(&mut inbound[start..]) {
            Ok(0) => {
                inbound.truncate(start);
                return (total, ReadStatus::Closed);
            }
            Ok(n) => {
                inbound.truncate(start + n);
                total += n;
            }
            Err(e) => {
                inbound.truncate(start);
                match e.kind() {
                    io::ErrorKind::WouldBlock => return (total, ReadStatus::Drained),
                    io::ErrorKind::Interrupted => continue,
                    _ => return (total, ReadStatus::Failed(e)),
                }
            }
        }
    }
}

/// Write queued bytes, advancing past whatever the socket accepted.
///
/// `Single` makes one successful write attempt; `Drain` keeps going until the
/// buffer is empty or the socket would block.
fn flush_outbound<W: Write>(
    stream: &mut W,
    outbound: &mut BytesMut,
    policy: FlushPolicy,
) -> io::Result<usize> {
    let mut written = 0;

    while !outbound.is_empty() {
        match stream.write(&outbound[..]) {
            Ok(0) => {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
            }
            Ok(n) => {
                outbound.advance(n);
                written += n;
                if policy == FlushPolicy::Single {
                    break;
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(written)
}

/// Errors that mean the peer is gone rather than a transient failure.
fn is_closure(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected
            | io::ErrorKind::WriteZero
    )
}

/// Create a non-blocking TCP listener with SO_REUSEADDR.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}
