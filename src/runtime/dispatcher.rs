//! Message dispatcher thread.
//!
//! Sleeps until the multiplexer reports new inbound bytes, then walks every
//! registered connection once: snapshot its inbound accumulator, reassemble
//! frames outside the lock, hand each body to its responder and put any
//! incomplete tail back.

use crate::config::{Config, ResyncPolicy};
use crate::protocol::FrameHeader;
use crate::responders::{Outbox, ResponderTable};
use crate::runtime::connection::{Connection, ConnectionRegistry};
use crate::runtime::reassembler::scan;
use mio::Waker;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Wake-up channel from the multiplexer to the dispatcher.
///
/// A generation counter behind a condvar: every append bumps it, and the
/// dispatcher waits for a generation newer than the one it last processed,
/// so a notification that lands while it is busy is never lost.
#[derive(Debug, Default)]
pub struct WorkSignal {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl WorkSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        let mut generation = self
            .generation
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *generation = generation.wrapping_add(1);
        self.cond.notify_all();
    }

    pub fn current(&self) -> u64 {
        *self
            .generation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until the generation differs from `seen` or `timeout` elapses.
    /// Returns the generation observed on wake-up.
    pub fn wait_newer(&self, seen: u64, timeout: Duration) -> u64 {
        let generation = self
            .generation
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let (generation, _) = self
            .cond
            .wait_timeout_while(generation, timeout, |g| *g == seen)
            .unwrap_or_else(PoisonError::into_inner);
        *generation
    }
}

/// Reassembles and dispatches frames for every registered connection.
pub struct Dispatcher {
    registry: Arc<ConnectionRegistry>,
    responders: Arc<ResponderTable>,
    signal: Arc<WorkSignal>,
    stop: Arc<AtomicBool>,
    waker: Option<Arc<Waker>>,
    max_body_size: usize,
    resync: ResyncPolicy,
    idle_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        config: &Config,
        registry: Arc<ConnectionRegistry>,
        responders: Arc<ResponderTable>,
        signal: Arc<WorkSignal>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            registry,
            responders,
            signal,
            stop,
            waker: None,
            max_body_size: config.max_body_size,
            resync: config.resync,
            idle_timeout: config.poll_timeout,
        }
    }

    /// Wake the multiplexer's poll whenever responders queue output.
    pub fn with_waker(mut self, waker: Arc<Waker>) -> Self {
        self.waker = Some(waker);
        self
    }

    /// Run until the stop flag is raised.
    pub fn run(&self) {
        info!("Dispatcher started");

        while !self.stop.load(Ordering::Acquire) {
            let seen = self.signal.current();
            self.process_all();
            self.signal.wait_newer(seen, self.idle_timeout);
        }

        info!("Dispatcher stopped");
    }

    /// One pass over every registered connection.
    ///
    /// Returns the number of reply bytes queued.
    pub fn process_all(&self) -> usize {
        let queued: usize = self
            .registry
            .snapshot()
            .iter()
            .map(|conn| self.process_connection(conn))
            .sum();

        if queued > 0 {
            if let Some(waker) = &self.waker {
                if let Err(e) = waker.wake() {
                    warn!(error = %e, "Failed to wake multiplexer");
                }
            }
        }
        queued
    }

    /// Reassemble and dispatch whatever `conn` has buffered.
    ///
    /// Returns the number of reply bytes queued.
    pub fn process_connection(&self, conn: &Connection) -> usize {
        let Some(snapshot) = conn.inbound().take() else {
            return 0;
        };

        let mut out = Outbox::new(conn);
        let outcome = scan(&snapshot, self.max_body_size, |header, body| {
            self.dispatch(&header, body, &mut out);
        });

        if let Some(from) = outcome.carry_from {
            conn.inbound().restore(&snapshot[from..]);
        }

        if outcome.discarded > 0 {
            warn!(
                conn_id = conn.id(),
                peer = %conn.peer(),
                discarded = outcome.discarded,
                "Discarded bytes outside any frame"
            );
        }
        if let Some(e) = &outcome.last_error {
            warn!(
                conn_id = conn.id(),
                peer = %conn.peer(),
                rejected = outcome.rejected,
                error = %e,
                "Rejected malformed frame header"
            );
        }
        if self.resync == ResyncPolicy::Strict && outcome.lost_bytes() {
            info!(peer = %conn.peer(), "Closing connection after unframed input");
            conn.request_close();
        }

        trace!(
            conn_id = conn.id(),
            frames = outcome.frames,
            carried = outcome.carry_from.map_or(0, |from| snapshot.len() - from),
            "Processed inbound bytes"
        );
        out.written()
    }

    fn dispatch(&self, header: &FrameHeader, body: &[u8], out: &mut Outbox<'_>) {
        match self.responders.resolve(header) {
            Ok(responder) => {
                if let Err(e) = responder.respond(body, out) {
                    warn!(
                        conn_id = out.connection().id(),
                        kind = header.kind,
                        error = %e,
                        "Responder failed"
                    );
                }
            }
            Err(e) => {
                debug!(
                    conn_id = out.connection().id(),
                    error = %e,
                    len = body.len(),
                    "Dropping message"
                );
            }
        }
    }
}
