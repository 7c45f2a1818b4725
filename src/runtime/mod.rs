//! Connection-handling runtime.
//!
//! Two threads share one [`ConnectionRegistry`]:
//! - `multiplexer`: owns the poller and every socket; accepts, reads,
//!   writes and tears connections down
//! - `dispatcher`: reassembles frames from inbound bytes and runs responders
//!
//! Shared building blocks:
//! - `Accumulator`: lock-guarded byte buffer (two per connection)
//! - `Connection` / `ConnectionRegistry`: per-socket state and the live set
//! - `WorkSignal`: wakes the dispatcher when new bytes arrive
//!
//! Lock order is registry first, then a connection's own locks; the registry
//! lock is released before any per-connection lock is taken.

mod buffer;
mod connection;
mod dispatcher;
mod multiplexer;
mod reassembler;

pub use connection::{Connection, ConnectionRegistry};
pub use dispatcher::{Dispatcher, WorkSignal};
pub use multiplexer::Multiplexer;

use crate::config::Config;
use crate::responders::ResponderTable;
use mio::Waker;
use std::net::{AddrParseError, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tracing::{error, info, warn};

/// Errors that stop the runtime from starting or running.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("invalid listen address '{addr}': {source}")]
    InvalidAddress {
        addr: String,
        #[source]
        source: AddrParseError,
    },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0} thread panicked")]
    Panicked(&'static str),
}

/// A running server: the multiplexer and dispatcher threads plus the state
/// they share.
///
/// Stopping is cooperative. [`Runtime::stop`] raises a flag that both threads
/// check once per loop iteration, and wakes them so neither waits out its
/// full timeout.
pub struct Runtime {
    stop: Arc<AtomicBool>,
    signal: Arc<WorkSignal>,
    waker: Arc<Waker>,
    registry: Arc<ConnectionRegistry>,
    local_addr: SocketAddr,
    multiplexer: Option<JoinHandle<Result<(), RuntimeError>>>,
    dispatcher: Option<JoinHandle<()>>,
}

impl Runtime {
    /// Bind the listener and start both threads.
    ///
    /// Fails without spawning anything if the listener cannot be bound.
    pub fn start(config: &Config, responders: ResponderTable) -> Result<Self, RuntimeError> {
        let stop = Arc::new(AtomicBool::new(false));
        let signal = Arc::new(WorkSignal::new());
        let registry = Arc::new(ConnectionRegistry::new(config.max_connections));

        let multiplexer = Multiplexer::bind(
            config,
            Arc::clone(&registry),
            Arc::clone(&signal),
            Arc::clone(&stop),
        )?;
        let local_addr = multiplexer.local_addr();
        let waker = multiplexer.waker();

        if responders.is_empty() {
            warn!("No responders registered; every frame will be dropped");
        }
        let responder_count = responders.len();

        let dispatcher = Dispatcher::new(
            config,
            Arc::clone(&registry),
            Arc::new(responders),
            Arc::clone(&signal),
            Arc::clone(&stop),
        )
        .with_waker(Arc::clone(&waker));

        info!(
            addr = %local_addr,
            max_connections = config.max_connections,
            poll_timeout_ms = config.poll_timeout.as_millis() as u64,
            flush = ?config.flush,
            resync = ?config.resync,
            responders = responder_count,
            "Starting runtime"
        );

        let multiplexer = thread::Builder::new()
            .name("multiplexer".to_string())
            .spawn(move || multiplexer.run())
            .map_err(|source| RuntimeError::Spawn {
                name: "multiplexer",
                source,
            })?;

        let mut runtime = Self {
            stop,
            signal,
            waker,
            registry,
            local_addr,
            multiplexer: Some(multiplexer),
            dispatcher: None,
        };

        // On failure, dropping `runtime` stops the multiplexer again.
        let dispatcher = thread::Builder::new()
            .name("dispatcher".to_string())
            .spawn(move || dispatcher.run())
            .map_err(|source| RuntimeError::Spawn {
                name: "dispatcher",
                source,
            })?;
        runtime.dispatcher = Some(dispatcher);

        Ok(runtime)
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The live connection set.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Ask both threads to finish.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "Failed to wake multiplexer");
        }
        self.signal.notify();
    }

    /// True while either thread is still running.
    pub fn is_alive(&self) -> bool {
        let multiplexer = self.multiplexer.as_ref().is_some_and(|h| !h.is_finished());
        let dispatcher = self.dispatcher.as_ref().is_some_and(|h| !h.is_finished());
        multiplexer || dispatcher
    }

    /// Wait for both threads to finish.
    pub fn join(mut self) -> Result<(), RuntimeError> {
        self.join_threads()
    }

    fn join_threads(&mut self) -> Result<(), RuntimeError> {
        let mut result = Ok(());

        if let Some(handle) = self.multiplexer.take() {
            result = handle
                .join()
                .unwrap_or(Err(RuntimeError::Panicked("multiplexer")));
        }
        if let Some(handle) = self.dispatcher.take() {
            if handle.join().is_err() && result.is_ok() {
                result = Err(RuntimeError::Panicked("dispatcher"));
            }
        }

        result
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if self.multiplexer.is_none() && self.dispatcher.is_none() {
            return;
        }
        self.stop();
        if let Err(e) = self.join_threads() {
            error!(error = %e, "Runtime stopped with error");
        }
    }
}
