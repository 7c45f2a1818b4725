//! Ping responder implementation.

use crate::protocol::{Command, FrameError};
use crate::responders::{Outbox, Responder};

/// Answers `Ping` with `Pong`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PingResponder;

impl Responder for PingResponder {
    fn respond(&self, body: &[u8], out: &mut Outbox<'_>) -> Result<(), FrameError> {
        out.push_frame(Command::Pong, body)
    }
}
