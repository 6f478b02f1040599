//! SPDY/3 style stream multiplexing over a single tokio connection.
//!
//! A [`Session`] wraps any `AsyncRead + AsyncWrite` transport. Both ends open
//! [`Stream`]s with a header block, exchange data under per-stream and
//! per-session flow control windows, and close each direction independently.

mod config;
mod error;
mod frame;
mod frame_router;
mod headers;
mod session;
mod session_inner;
mod stream;
mod window;

pub use config::SpdyConfig;
pub use error::{Result, TokioSpdyError};
pub use frame::{
  flags, setting, status, Body, Cmd, Frame, FrameHeader, Setting, Sid, HEADER_SIZE,
};
pub use headers::Headers;
pub use session::{Session, SessionState};
pub use stream::{Stream, StreamState};
pub use window::DEFAULT_WINDOW;
