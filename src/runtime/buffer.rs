//! Lock-guarded byte accumulators.
//!
//! Each connection owns two of these: an inbound one that socket reads append
//! to and the dispatcher drains, and an outbound one that responders append to
//! and the multiplexer flushes. Every mutation happens under the
//! accumulator's own mutex.

use bytes::{Bytes, BytesMut};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Initial capacity of a fresh accumulator.
const INITIAL_CAPACITY: usize = 4 * 1024;

/// A byte sequence guarded by its own lock.
#[derive(Debug)]
pub struct Accumulator {
    bytes: Mutex<BytesMut>,
}

impl Accumulator {
    pub fn new() -> Self {
        Self {
            bytes: Mutex::new(BytesMut::with_capacity(INITIAL_CAPACITY)),
        }
    }

    /// Acquire the lock for a compound operation (e.g. read-from-socket-and-append).
    ///
    /// A poisoned lock is recovered: no operation leaves the buffer partially
    /// updated, so the bytes are still consistent.
    pub fn lock(&self) -> MutexGuard<'_, BytesMut> {
        self.bytes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append bytes at the end.
    pub fn append(&self, data: &[u8]) {
        self.lock().extend_from_slice(data);
    }

    /// Snapshot everything accumulated so far and leave the accumulator empty.
    ///
    /// Returns `None` when there is nothing buffered.
    pub fn take(&self) -> Option<Bytes> {
        let mut bytes = self.lock();
        if bytes.is_empty() {
            return None;
        }
        Some(bytes.split().freeze())
    }

    /// Put unconsumed bytes back in front of whatever arrived since the last
    /// [`Accumulator::take`].
    pub fn restore(&self, tail: &[u8]) {
        if tail.is_empty() {
            return;
        }
        let mut bytes = self.lock();
        if bytes.is_empty() {
            bytes.extend_from_slice(tail);
        } else {
            let mut joined = BytesMut::with_capacity(tail.len() + bytes.len());
            joined.extend_from_slice(tail);
            joined.extend_from_slice(&bytes);
            *bytes = joined;
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl Default for Accumulator {
    fn default() -> Self {
        Self::new()
    }
}
