//! Echo responder implementation.

use crate::protocol::{Command, FrameError};
use crate::responders::{Outbox, Responder};
use tracing::trace;

/// Sends every body straight back.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoResponder;

impl Responder for EchoResponder {
    fn respond(&self, body: &[u8], out: &mut Outbox<'_>) -> Result<(), FrameError> {
        trace!(conn_id = out.connection().id(), len = body.len(), "echo");
        out.push_frame(Command::Echo, body)
    }
}
