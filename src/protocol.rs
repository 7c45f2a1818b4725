//! Wire format for switchboard messages.
//!
//! Every message is a frame: a fixed-size header followed by a body whose
//! length the header declares.
//!
//! ```text
//! ┌──────────────┬──────────┬─────────────┬──────────────┐
//! │ Start marker │ Command  │ Body length │ Body         │
//! │ CA FE BA BE  │ u16 BE   │ u32 BE      │ length bytes │
//! └──────────────┴──────────┴─────────────┴──────────────┘
//! ```
//!
//! The start marker is how frame boundaries are found inside an otherwise
//! unstructured byte stream. It counts towards `HEADER_SIZE`.

use bytes::{BufMut, BytesMut};
use thiserror::Error;

/// Magic bytes that open every frame.
pub const START_MARKER: [u8; 4] = [0xCA, 0xFE, 0xBA, 0xBE];

/// Serialized header size in bytes, start marker included.
pub const HEADER_SIZE: usize = START_MARKER.len() + 2 + 4;

/// Default upper bound for a declared body length (16 MiB).
pub const DEFAULT_MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

/// Largest body a frame can carry: the length field is 32 bits and the
/// whole frame must still fit in a `u32`.
pub const MAX_BODY_SIZE_LIMIT: usize = u32::MAX as usize - HEADER_SIZE;

/// Command kinds understood by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Directory listing. Sent by the server as its greeting.
    Dir,
    /// Echo the body back.
    Echo,
    /// Liveness check; answered with `Pong`.
    Ping,
    /// Reply to `Ping`.
    Pong,
}

impl Command {
    pub fn from_u16(kind: u16) -> Option<Self> {
        match kind {
            1 => Some(Command::Dir),
            2 => Some(Command::Echo),
            3 => Some(Command::Ping),
            4 => Some(Command::Pong),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        match self {
            Command::Dir => 1,
            Command::Echo => 2,
            Command::Ping => 3,
            Command::Pong => 4,
        }
    }
}

/// Errors produced while decoding a frame header.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Not enough bytes for a full header.
    #[error("truncated header: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    /// The window does not begin with the start marker.
    #[error("missing start marker")]
    BadMarker,

    /// Declared body length exceeds the configured limit.
    #[error("declared body length {declared} exceeds maximum {max}")]
    BodyTooLarge { declared: usize, max: usize },
}

/// Decoded frame header.
///
/// The command kind is kept raw so that frames with kinds this build does not
/// know about can still be skipped cleanly; resolving the kind is the
/// dispatcher's job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: u16,
    pub body_len: u32,
}

impl FrameHeader {
    pub fn new(command: Command, body_len: u32) -> Self {
        Self {
            kind: command.as_u16(),
            body_len,
        }
    }

    /// The command this header names, if it is a known one.
    pub fn command(&self) -> Option<Command> {
        Command::from_u16(self.kind)
    }

    /// Total frame length (header plus body). Saturates on targets where
    /// the sum does not fit in `usize`.
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE.saturating_add(self.body_len as usize)
    }

    /// Decode a header from the front of `buf`.
    ///
    /// `buf` must start at the start marker.
    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < HEADER_SIZE {
            return Err(FrameError::Truncated {
                needed: HEADER_SIZE,
                available: buf.len(),
            });
        }
        if buf[..START_MARKER.len()] != START_MARKER {
            return Err(FrameError::BadMarker);
        }

        let m = START_MARKER.len();
        let kind = u16::from_be_bytes([buf[m], buf[m + 1]]);
        let body_len = u32::from_be_bytes([buf[m + 2], buf[m + 3], buf[m + 4], buf[m + 5]]);

        Ok(Self { kind, body_len })
    }

    /// Like [`FrameHeader::decode`], but rejects bodies above `max_body_size`.
    pub fn decode_bounded(buf: &[u8], max_body_size: usize) -> Result<Self, FrameError> {
        let header = Self::decode(buf)?;
        if header.body_len as usize > max_body_size {
            return Err(FrameError::BodyTooLarge {
                declared: header.body_len as usize,
                max: max_body_size,
            });
        }
        Ok(header)
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        let m = START_MARKER.len();
        out[..m].copy_from_slice(&START_MARKER);
        out[m..m + 2].copy_from_slice(&self.kind.to_be_bytes());
        out[m + 2..].copy_from_slice(&self.body_len.to_be_bytes());
        out
    }
}

/// Append a complete frame for `command` carrying `body` to `out`.
///
/// Bodies above [`MAX_BODY_SIZE_LIMIT`] cannot be framed; `out` is left
/// untouched.
pub fn encode_frame(command: Command, body: &[u8], out: &mut BytesMut) -> Result<(), FrameError> {
    let body_len = body_len_field(body.len())?;
    out.reserve(HEADER_SIZE + body.len());
    out.put_slice(&FrameHeader::new(command, body_len).encode());
    out.put_slice(body);
    Ok(())
}

/// Length field for a body of `len` bytes.
fn body_len_field(len: usize) -> Result<u32, FrameError> {
    if len > MAX_BODY_SIZE_LIMIT {
        return Err(FrameError::BodyTooLarge {
            declared: len,
            max: MAX_BODY_SIZE_LIMIT,
        });
    }
    Ok(len as u32)
}

/// Find the next start marker in `buf` at or after `from`.
pub fn find_marker(buf: &[u8], from: usize) -> Option<usize> {
    if from >= buf.len() {
        return None;
    }
    buf[from..]
        .windows(START_MARKER.len())
        .position(|w| w == START_MARKER)
        .map(|pos| from + pos)
}

/// Length of the longest suffix of `buf` that is a proper prefix of the
/// start marker.
///
/// Such a suffix may be the first half of a marker whose remaining bytes have
/// not arrived yet.
pub fn partial_marker_suffix(buf: &[u8]) -> usize {
    let max = (START_MARKER.len() - 1).min(buf.len());
    (1..=max)
        .rev()
        .find(|&n| buf[buf.len() - n..] == START_MARKER[..n])
        .unwrap_or(0)
}
