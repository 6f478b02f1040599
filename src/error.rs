use crate::frame::{status, Sid};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TokioSpdyError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokioSpdyError {
  // Not fatal. The reader waits for more bytes and decodes again.
  #[error("frame truncated, need {needed} more bytes")]
  Truncated { needed: usize },

  #[error("malformed frame: {msg}")]
  MalformedFrame { msg: String },

  #[error("protocol violation: {msg}")]
  ProtocolViolation { msg: String },

  #[error("remote reuses live stream id: {sid}")]
  DuplicateStream { sid: Sid },

  #[error("remote exceeds receive window of stream {sid}")]
  WindowExceeded { sid: Sid },

  #[error("receive invalid config: {msg}")]
  InvalidConfig { msg: String },

  #[error("session closed")]
  SessionClosed,

  // Stream ids ran out, or the remote sent GOAWAY before processing the stream.
  #[error("session is going away, should start a new connection")]
  SessionGoAway,

  #[error("peer allows at most {limit} concurrent streams")]
  StreamLimitReached { limit: u32 },

  #[error("no frame received within keep-alive timeout")]
  KeepAliveTimeout,

  #[error("stream closed for write")]
  StreamClosedForWrite,

  #[error("invalid operation: {msg}")]
  InvalidOperation { msg: String },

  #[error("stream {sid} reset with status {status}")]
  StreamReset { sid: Sid, status: u32 },

  #[error("{msg}")]
  Io { msg: String },
}

impl TokioSpdyError {
  /// Whether the operation may succeed once more bytes arrive.
  pub fn is_retryable(&self) -> bool {
    matches!(self, TokioSpdyError::Truncated { .. })
  }

  /// Errors caused by remote misbehavior or a broken transport. They tear the
  /// whole session down.
  pub fn is_session_fatal(&self) -> bool {
    matches!(
      self,
      TokioSpdyError::MalformedFrame { .. }
        | TokioSpdyError::ProtocolViolation { .. }
        | TokioSpdyError::DuplicateStream { .. }
        | TokioSpdyError::WindowExceeded { .. }
        | TokioSpdyError::KeepAliveTimeout
        | TokioSpdyError::Io { .. }
    )
  }

  /// Status carried by the GOAWAY frame sent when this error ends a session.
  pub fn goaway_status(&self) -> u32 {
    match self {
      TokioSpdyError::MalformedFrame { .. }
      | TokioSpdyError::ProtocolViolation { .. }
      | TokioSpdyError::DuplicateStream { .. } => status::PROTOCOL_ERROR,
      TokioSpdyError::WindowExceeded { .. } => status::FLOW_CONTROL_ERROR,
      TokioSpdyError::SessionClosed | TokioSpdyError::SessionGoAway => status::OK,
      _ => status::INTERNAL_ERROR,
    }
  }
}

impl From<std::io::Error> for TokioSpdyError {
  fn from(value: std::io::Error) -> Self {
    TokioSpdyError::Io {
      msg: value.to_string(),
    }
  }
}

#[test]
fn test_error_classes() {
  assert!(TokioSpdyError::Truncated { needed: 3 }.is_retryable());
  assert!(!TokioSpdyError::SessionClosed.is_retryable());

  let err = TokioSpdyError::WindowExceeded { sid: 1 };
  assert!(err.is_session_fatal());
  assert_eq!(err.goaway_status(), status::FLOW_CONTROL_ERROR);

  assert!(!TokioSpdyError::StreamClosedForWrite.is_session_fatal());
  assert!(!TokioSpdyError::StreamReset { sid: 1, status: 4 }.is_session_fatal());
  assert_eq!(
    TokioSpdyError::DuplicateStream { sid: 2 }.goaway_status(),
    status::PROTOCOL_ERROR
  );

  let err: TokioSpdyError = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe").into();
  assert_eq!(err, TokioSpdyError::Io { msg: "pipe".to_string() });
  assert!(err.is_session_fatal());
}
