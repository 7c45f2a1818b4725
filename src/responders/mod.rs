//! Responder dispatch.
//!
//! A responder consumes one frame body and may queue reply bytes on the
//! connection that sent it. [`ResponderTable`] resolves a decoded header to
//! the responder registered for its command.
//!
//! ## Built-in responders
//! - `echo`: replies `Echo` with the received body
//! - `ping`: replies `Pong` with the received body
//!
//! `Dir` is the server's greeting and `Pong` is a reply, so neither has a
//! server-side responder by default.

pub mod echo;
pub mod ping;

use crate::protocol::{Command, FrameError, FrameHeader, HEADER_SIZE};
use crate::runtime::Connection;
use std::collections::HashMap;
use thiserror::Error;

pub use echo::EchoResponder;
pub use ping::PingResponder;

/// Handler for the body of one command kind.
pub trait Responder: Send + Sync {
    /// Handle one complete body. Replies go through `out`.
    fn respond(&self, body: &[u8], out: &mut Outbox<'_>) -> Result<(), FrameError>;
}

/// A responder's write channel back to the network.
///
/// Appends land in the connection's outbound accumulator; the multiplexer
/// picks them up on its next pending-write sweep.
pub struct Outbox<'a> {
    conn: &'a Connection,
    written: usize,
}

impl<'a> Outbox<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn, written: 0 }
    }

    /// Queue a complete frame. Nothing is queued if the body cannot be framed.
    pub fn push_frame(&mut self, command: Command, body: &[u8]) -> Result<(), FrameError> {
        self.conn.push_message(command, body)?;
        self.written += HEADER_SIZE + body.len();
        Ok(())
    }

    /// Queue bytes verbatim.
    #[allow(dead_code)] // For responders that pre-encode their frames; the built-ins use push_frame
    pub fn push_raw(&mut self, bytes: &[u8]) {
        self.conn.outbound().append(bytes);
        self.written += bytes.len();
    }

    /// Bytes queued through this outbox.
    pub fn written(&self) -> usize {
        self.written
    }

    pub fn connection(&self) -> &Connection {
        self.conn
    }
}

/// Reasons a header cannot be dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("unknown command kind {0:#06x}")]
    UnknownCommand(u16),

    #[error("no responder registered for {0:?}")]
    NoResponder(Command),
}

/// Maps command kinds to responders.
#[derive(Default)]
pub struct ResponderTable {
    responders: HashMap<Command, Box<dyn Responder>>,
}

impl ResponderTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with the built-in `Echo` and `Ping` responders.
    pub fn with_defaults() -> Self {
        let mut table = Self::new();
        table.register(Command::Echo, EchoResponder);
        table.register(Command::Ping, PingResponder);
        table
    }

    /// Register (or replace) the responder for `command`.
    pub fn register<R>(&mut self, command: Command, responder: R)
    where
        R: Responder + 'static,
    {
        self.responders.insert(command, Box::new(responder));
    }

    pub fn resolve(&self, header: &FrameHeader) -> Result<&dyn Responder, DispatchError> {
        let command = header
            .command()
            .ok_or(DispatchError::UnknownCommand(header.kind))?;
        self.responders
            .get(&command)
            .map(|r| r.as_ref())
            .ok_or(DispatchError::NoResponder(command))
    }

    pub fn len(&self) -> usize {
        self.responders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.responders.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    struct Mirror;

    impl Responder for Mirror {
        fn respond(&self, body: &[u8], out: &mut Outbox<'_>) -> Result<(), FrameError> {
            out.push_raw(body);
            Ok(())
        }
    }

    fn conn() -> Connection {
        Connection::new(0, SocketAddr::from(([127, 0, 0, 1], 5000)))
    }

    #[test]
    fn test_defaults() {
        let table = ResponderTable::with_defaults();
        assert_eq!(table.len(), 2);
        assert!(table.resolve(&FrameHeader::new(Command::Echo, 0)).is_ok());
        assert!(table.resolve(&FrameHeader::new(Command::Ping, 0)).is_ok());
    }

    #[test]
    fn test_resolve_known_without_responder() {
        let table = ResponderTable::with_defaults();
        assert_eq!(
            table.resolve(&FrameHeader::new(Command::Dir, 0)).err(),
            Some(DispatchError::NoResponder(Command::Dir))
        );
    }

    #[test]
    fn test_resolve_unknown_kind() {
        let table = ResponderTable::with_defaults();
        let header = FrameHeader {
            kind: 0x0999,
            body_len: 0,
        };
        assert_eq!(
            table.resolve(&header).err(),
            Some(DispatchError::UnknownCommand(0x0999))
        );
    }

    #[test]
    fn test_custom_responder() {
        let mut table = ResponderTable::new();
        assert!(table.is_empty());
        table.register(Command::Dir, Mirror);

        let conn = conn();
        let mut out = Outbox::new(&conn);
        table
            .resolve(&FrameHeader::new(Command::Dir, 3))
            .unwrap()
            .respond(b"abc", &mut out)
            .unwrap();

        assert_eq!(out.written(), 3);
        assert_eq!(&conn.outbound().take().unwrap()[..], b"abc");
    }

    #[test]
    fn test_outbox_counts_frames() {
        let conn = conn();
        let mut out = Outbox::new(&conn);
        out.push_frame(Command::Pong, b"hi").unwrap();
        assert_eq!(out.written(), HEADER_SIZE + 2);
        assert_eq!(out.connection().id(), 0);
    }
}
