//! Echo responder.
//!
//! Useful for throughput and correctness testing of the framing path:
//! - Client sends: `Echo` frame with any body
//! - Server replies: `Echo` frame with the same body
//!
//! ```text
//! Request:  [marker][Echo, 5]hello
//! Response: [marker][Echo, 5]hello
//! ```

pub mod handler;

pub use handler::EchoResponder;
