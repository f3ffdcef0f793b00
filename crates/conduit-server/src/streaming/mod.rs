//! Newline-delimited JSON over a long-lived chunked request/response pair.
//!
//! A session ends only on a body read error, the body or line size limits,
//! EOF (after the final unterminated fragment is dispatched), or the idle
//! timeout. Unparseable lines produce an error line and the session goes on.

pub mod line_buffer;
mod session;
mod transport;

pub use line_buffer::{LineBuffer, LineTooLong};
pub use session::{SessionConflict, StreamSession, Termination};
pub use transport::{SESSION_HEADER, StreamingTransport};
