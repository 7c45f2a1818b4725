//! Ping responder.
//!
//! A minimal liveness check that never touches application state:
//! - Client sends: `Ping` frame, optionally with a body
//! - Server replies: `Pong` frame carrying the same body
//!
//! ```text
//! Request:  [marker][Ping, 0]
//! Response: [marker][Pong, 0]
//!
//! Request:  [marker][Ping, 5]hello
//! Response: [marker][Pong, 5]hello
//! ```

pub mod handler;

pub use handler::PingResponder;
